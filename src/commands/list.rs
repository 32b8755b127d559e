use crate::lan_api::{Client as LanClient, LanEvent};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(clap::Parser, Debug)]
pub struct ListCommand {
    /// Don't wait for LAN discovery
    #[arg(long)]
    skip_lan: bool,

    /// Seconds to wait for LAN discovery responses
    #[arg(long, default_value_t = 10)]
    lan_timeout: u64,
}

impl ListCommand {
    pub async fn run(&self, args: &crate::Args) -> anyhow::Result<()> {
        let mut lan_ips: HashMap<String, String> = HashMap::new();

        if !self.skip_lan {
            eprintln!(
                "Waiting {} seconds for LAN discovery, use --skip-lan to skip...",
                self.lan_timeout
            );
            let (client, mut events) = LanClient::new(args.lan_args.init_timeout()).await?;
            let deadline = Instant::now() + Duration::from_secs(self.lan_timeout);
            while let Ok(Ok(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
                if let LanEvent::DeviceAdded(device) = event {
                    lan_ips.insert(device.id().to_string(), device.ip().to_string());
                }
            }
            drop(client);
        }

        if let Ok(client) = args.api_args.api_client() {
            for d in client.get_devices().await? {
                println!(
                    "{sku:<7} {id} {ip:<15} {name}",
                    sku = d.sku,
                    id = d.device,
                    ip = lan_ips.remove(&d.device).unwrap_or_default(),
                    name = d.device_name
                );
            }
        }

        // LAN-only devices that the cloud doesn't know about
        for (id, ip) in lan_ips {
            println!("{sku:<7} {id} {ip:<15}", sku = "?");
        }

        Ok(())
    }
}
