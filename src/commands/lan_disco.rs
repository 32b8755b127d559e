use crate::lan_api::{Client, LanEvent};

#[derive(clap::Parser, Debug)]
pub struct LanDiscoCommand {}

impl LanDiscoCommand {
    pub async fn run(&self, args: &crate::Args) -> anyhow::Result<()> {
        let (client, mut events) = Client::new(args.lan_args.init_timeout()).await?;
        client.discover().await?;

        loop {
            match events.recv().await {
                Ok(LanEvent::DeviceAdded(device)) => {
                    log::info!("{device:?}");

                    if let Ok(resp) = client.query_status(&device).await {
                        log::info!("Got status: {resp:?}");
                    }
                }
                Ok(event) => {
                    log::info!("{event:?}");
                }
                Err(_) => break,
            }
        }
        Ok(())
    }
}
