use crate::hub::HubDevice;
use crate::lan_api::{Client as LanClient, LanEvent};
use crate::service::http::run_http_server;
use crate::service::iot::start_iot_client;
use crate::service::refresh::{spawn_device, PushUpdate};
use crate::service::state::StateHandle;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(clap::Parser, Debug)]
pub struct ServeCommand {
    /// The port on which the HTTP API will listen
    #[arg(long, default_value_t = 8056)]
    http_port: u16,

    /// Seconds between cloud state polls. Values below the platform
    /// rate-limit floor are raised to it.
    #[arg(long)]
    poll_interval: Option<u64>,
}

/// Routes the shared LAN client's event stream: newly discovered
/// devices get a bridge device and a refresh task, status diffs are
/// forwarded to the owning task, and devices that stop answering are
/// marked unreachable.
async fn route_lan_events(state: StateHandle, mut events: broadcast::Receiver<LanEvent>) {
    loop {
        match events.recv().await {
            Ok(LanEvent::DeviceAdded(lan_device)) => {
                let id = lan_device.id().to_string();
                let sku = lan_device.sku().to_string();
                state
                    .device_mut(&sku, &id)
                    .await
                    .set_lan_device(lan_device);

                if state.hub_for(&id).await.is_none() {
                    log::info!("LAN device {id} ({sku}) joined, starting its device task");
                    spawn_device(&state, &sku, &id).await;
                }
            }
            Ok(LanEvent::UpdatedStatus {
                device,
                status,
                changed,
            }) => {
                state
                    .route_push(&device, PushUpdate::from_lan(&status, &changed))
                    .await;
            }
            Ok(LanEvent::DeviceRemoved { device }) => {
                let Some(d) = state.device_by_id(&device).await else {
                    continue;
                };
                state.device_mut(&d.sku, &device).await.lan_device = None;
                if d.http_device_info.is_none() {
                    // no cloud fallback; the device is gone until
                    // discovery sees it again
                    if let Some(hub) = state.hub_for(&device).await {
                        hub.set_unavailable("Device is no longer reachable on the LAN")
                            .await;
                    }
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::warn!("LAN event router lagged by {n} events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

impl ServeCommand {
    pub async fn run(&self, args: &crate::Args) -> anyhow::Result<()> {
        log::info!("Starting service. version {}", env!("CARGO_PKG_VERSION"));
        let state: StateHandle = Arc::new(crate::service::state::State::new());

        if let Some(secs) = self.poll_interval {
            state.set_poll_interval(Duration::from_secs(secs)).await;
        }

        // First, use the HTTP API to determine the list of devices and
        // their names.
        if let Ok(client) = args.api_args.api_client() {
            log::info!("Querying platform API for device list");
            for info in client.get_devices().await? {
                let mut device = state.device_mut(&info.sku, &info.device).await;
                device.set_http_device_info(info);
            }

            state.set_platform_client(client).await;
        }

        // Now start local discovery
        if !args.lan_args.no_lan {
            log::info!("Starting LAN discovery");
            match LanClient::new(args.lan_args.init_timeout()).await {
                Ok((client, events)) => {
                    state.set_lan_client(client).await;
                    let state = state.clone();
                    tokio::spawn(async move {
                        route_lan_events(state, events).await;
                    });
                }
                Err(err) => {
                    // the error state persists; LAN operations report
                    // it until the service is restarted
                    log::error!("LAN client unavailable: {err:#}");
                    state.set_lan_client_error(err.to_string()).await;
                }
            }
        }

        // The account push feed, when configured
        if args.iot_args.configured() {
            match start_iot_client(&args.iot_args, state.clone()).await {
                Ok(()) => {
                    if state.get_iot_client().await.is_some() {
                        log::info!("IoT push feed is routing device events");
                    }
                }
                Err(err) => {
                    log::error!("IoT client unavailable: {err:#}");
                }
            }
        }

        log::info!("Devices returned from the vendor APIs");
        for device in state.devices().await {
            log::info!("{device}");
            if let Some(http_info) = &device.http_device_info {
                let rgb = http_info.supports_rgb();
                let bright = http_info.supports_brightness();
                let color_temp = http_info.get_color_temperature_range();
                log::info!(
                    "  Platform API: {kind:?}. supports_rgb={rgb} supports_brightness={bright} \
                     color_temp={color_temp:?}",
                    kind = http_info.device_type
                );
                log::trace!("{http_info:#?}");
            }

            if let Some(quirk) = crate::service::quirks::resolve_quirk(&device.sku) {
                // Sanity check: if the device should speak the LAN
                // protocol but discovery hasn't seen it, the LAN API
                // may be disabled in the vendor app or blocked by the
                // network
                if quirk.lan_api_capable && device.lan_device.is_none() {
                    log::info!(
                        "  {} supports the LAN API but has not been discovered yet",
                        device.sku
                    );
                }
            }

            // the LAN router may have beaten us to it
            if state.hub_for(&device.id).await.is_none() {
                spawn_device(&state, &device.sku, &device.id).await;
            }
        }

        run_http_server(state, self.http_port).await
    }
}
