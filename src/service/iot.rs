use crate::lan_api::DeviceColor;
use crate::opt_env_var;
use crate::platform_api::from_json;
use crate::service::refresh::PushUpdate;
use crate::service::state::StateHandle;
use anyhow::Context;
use async_channel::Receiver;
use mosquitto_rs::{Event, QoS};
use serde::Deserialize;
use std::time::Duration;
use tokio::time::timeout;

// Subscribes to the vendor's account-scoped MQTT feed and routes the
// per-device JSON state packets it carries into the matching device's
// refresh loop. The feed is the only way to hear about state changes
// between cloud polls for devices without LAN presence.

#[derive(clap::Parser, Debug)]
pub struct IotArguments {
    /// The hostname of the vendor MQTT endpoint.
    /// You may also set this via the GOVEE_MQTT_HOST environment variable.
    #[arg(long, global = true)]
    iot_host: Option<String>,

    /// The MQTT port. If unspecified, uses 8883.
    #[arg(long, global = true)]
    iot_port: Option<u16>,

    /// The account credential used to authenticate and derive the
    /// subscription topic.
    /// You may also set this via the GOVEE_MQTT_ACCOUNT environment variable.
    #[arg(long, global = true)]
    iot_account: Option<String>,

    /// You may also set this via the GOVEE_MQTT_PASSWORD environment variable.
    #[arg(long, global = true)]
    iot_password: Option<String>,
}

impl IotArguments {
    pub fn opt_host(&self) -> anyhow::Result<Option<String>> {
        match &self.iot_host {
            Some(h) => Ok(Some(h.to_string())),
            None => opt_env_var("GOVEE_MQTT_HOST"),
        }
    }

    pub fn opt_account(&self) -> anyhow::Result<Option<String>> {
        match &self.iot_account {
            Some(a) => Ok(Some(a.to_string())),
            None => opt_env_var("GOVEE_MQTT_ACCOUNT"),
        }
    }

    fn password(&self) -> anyhow::Result<Option<String>> {
        match &self.iot_password {
            Some(p) => Ok(Some(p.to_string())),
            None => opt_env_var("GOVEE_MQTT_PASSWORD"),
        }
    }

    fn port(&self) -> anyhow::Result<u16> {
        match self.iot_port {
            Some(p) => Ok(p),
            None => Ok(opt_env_var("GOVEE_MQTT_PORT")?.unwrap_or(8883)),
        }
    }

    pub fn configured(&self) -> bool {
        matches!(self.opt_host(), Ok(Some(_))) && matches!(self.opt_account(), Ok(Some(_)))
    }
}

#[derive(Clone)]
pub struct IotClient {
    /// Kept for the lifetime of the bridge; the subscription loop
    /// owns its own handle to the same session.
    #[allow(dead_code)]
    client: mosquitto_rs::Client,
}

/// Account-level state packet. The interesting payload nests under
/// `state`; each field is optional because the vendor only sends what
/// changed.
#[derive(Deserialize, Debug)]
#[allow(dead_code)]
struct Packet {
    sku: Option<String>,
    device: Option<String>,
    cmd: Option<String>,
    state: StateUpdate,
}

#[derive(Deserialize, Debug)]
struct StateUpdate {
    #[serde(rename = "onOff")]
    pub on_off: Option<u8>,
    pub brightness: Option<u8>,
    pub color: Option<DeviceColor>,
    #[serde(rename = "colorTemInKelvin")]
    pub color_temperature_kelvin: Option<u32>,
    pub sku: Option<String>,
    pub device: Option<String>,
}

impl Packet {
    /// The device id can be in a couple of different places(!)
    fn device(&self) -> Option<&str> {
        if let Some(device) = self.device.as_deref() {
            return Some(device);
        }
        self.state.device.as_deref()
    }
}

impl From<&StateUpdate> for PushUpdate {
    fn from(state: &StateUpdate) -> Self {
        Self {
            on_off: state.on_off,
            brightness: state.brightness,
            color: state.color,
            color_temperature_kelvin: state.color_temperature_kelvin,
        }
    }
}

pub async fn start_iot_client(args: &IotArguments, state: StateHandle) -> anyhow::Result<()> {
    let host = args
        .opt_host()?
        .ok_or_else(|| anyhow::anyhow!("iot host is not configured"))?;
    let account = args
        .opt_account()?
        .ok_or_else(|| anyhow::anyhow!("iot account is not configured"))?;
    let port = args.port()?;
    let topic = format!("GA/{account}");

    let client = mosquitto_rs::Client::with_id(
        &format!("AP/{account}/{id}", id = uuid::Uuid::new_v4().simple()),
        true,
    )
    .context("new client")?;

    client
        .set_username_and_password(Some(&account), args.password()?.as_deref())
        .context("set_username_and_password")?;

    log::trace!("Connecting to IoT {host}:{port}");
    let status = timeout(
        Duration::from_secs(60),
        client.connect(&host, port as i32, Duration::from_secs(120), None),
    )
    .await
    .with_context(|| format!("timeout connecting to IoT {host}:{port}"))?
    .with_context(|| format!("failed to connect to IoT {host}:{port}"))?;
    log::info!("Connected to IoT: {host}:{port} {status}");

    let subscriptions = client.subscriber().expect("first and only");

    state.set_iot_client(IotClient {
        client: client.clone(),
    })
    .await;

    tokio::spawn(async move {
        if let Err(err) = run_iot_subscriber(subscriptions, state, client, topic).await {
            log::error!("IoT loop failed: {err:#}");
        }
        log::info!("IoT loop terminated");
        Ok::<(), anyhow::Error>(())
    });

    Ok(())
}

async fn run_iot_subscriber(
    subscriptions: Receiver<Event>,
    state: StateHandle,
    client: mosquitto_rs::Client,
    topic: String,
) -> anyhow::Result<()> {
    while let Ok(event) = subscriptions.recv().await {
        match event {
            Event::Message(msg) => {
                let payload = String::from_utf8_lossy(&msg.payload);
                log::trace!("{} -> {payload}", msg.topic);

                match from_json::<Packet, _>(&msg.payload) {
                    Ok(packet) => {
                        log::debug!("{packet:?}");
                        let Some(device_id) = packet.device() else {
                            log::trace!("packet carries no device id, ignoring");
                            continue;
                        };
                        let update: PushUpdate = (&packet.state).into();
                        state.route_push(device_id, update).await;
                    }
                    Err(err) => {
                        log::error!("Decoding IoT Packet: {err:#} {payload}");
                    }
                }
            }
            Event::Disconnected(reason) => {
                log::warn!("IoT disconnected with reason {reason}");
            }
            Event::Connected(status) => {
                log::info!("IoT (re)connected with status {status}");

                client
                    .subscribe(&topic, QoS::AtMostOnce)
                    .await
                    .context("subscribe to account topic")?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn packet_field_partiality() {
        let packet: Packet = from_json(
            r#"{
                "sku": "H6159",
                "device": "AA:BB:CC:DD:EE:FF:42:2A",
                "cmd": "status",
                "state": {"brightness": 42}
            }"#,
        )
        .unwrap();

        k9::assert_equal!(packet.device(), Some("AA:BB:CC:DD:EE:FF:42:2A"));
        let update: PushUpdate = (&packet.state).into();
        k9::assert_equal!(update.brightness, Some(42));
        k9::assert_equal!(update.on_off, None);
        k9::assert_equal!(update.color, None);
        k9::assert_equal!(update.color_temperature_kelvin, None);
    }

    #[test]
    fn device_id_nested_in_state() {
        let packet: Packet = from_json(
            r#"{
                "state": {"onOff": 1, "device": "AA:BB", "sku": "H6159"}
            }"#,
        )
        .unwrap();
        k9::assert_equal!(packet.device(), Some("AA:BB"));
    }
}
