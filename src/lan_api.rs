use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use strum_macros::Display;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;

// Govee LAN protocol client.
// <https://app-h5.govee.com/user-manual/wlan-guide>
//
// One client per process: it owns the scan/listen socket pair and an
// in-memory roster of discovered devices. Devices are polled for their
// status and the differences are published as events, so that each
// paired device's refresh loop only ever sees the fields that changed.

const SCAN_PORT: u16 = 4001;
const LISTEN_PORT: u16 = 4002;
const CMD_PORT: u16 = 4003;

const MULTICAST: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);

/// How often roster devices are interrogated for status
const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(10);
/// Devices that haven't answered anything for this long fall out of
/// the roster
const STALE_AFTER: Duration = Duration::from_secs(300);

#[derive(clap::Parser, Debug)]
pub struct LanDiscoArguments {
    /// Disable the LAN protocol entirely
    #[arg(long, global = true)]
    pub no_lan: bool,

    /// Seconds allowed for the local UDP stack to become ready before
    /// it is treated as failed
    #[arg(long, global = true, default_value_t = 10)]
    pub lan_init_timeout: u64,
}

impl LanDiscoArguments {
    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.lan_init_timeout)
    }
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum LanError {
    #[error(
        "LAN transport unavailable: {0}. \
         The local client must be reinitialized before it can be used"
    )]
    Unavailable(String),
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "cmd", content = "data")]
pub enum Request {
    #[serde(rename = "scan")]
    Scan { account_topic: AccountTopic },
    #[serde(rename = "devStatus")]
    DevStatus {},
    #[serde(rename = "turn")]
    Turn { value: u8 },
    #[serde(rename = "brightness")]
    Brightness { value: u8 },
    #[serde(rename = "colorwc")]
    Color {
        color: DeviceColor,
        #[serde(rename = "colorTemInKelvin")]
        color_temperature_kelvin: u32,
    },
}

#[derive(Serialize, Deserialize, Debug)]
struct RequestMessage {
    msg: Request,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ScannedDevice {
    pub ip: IpAddr,
    pub device: String,
    pub sku: String,
    #[serde(rename = "bleVersionHard")]
    pub ble_version_hard: String,
    #[serde(rename = "bleVersionSoft")]
    pub ble_version_soft: String,
    #[serde(rename = "wifiVersionHard")]
    pub wifi_version_hard: String,
    #[serde(rename = "wifiVersionSoft")]
    pub wifi_version_soft: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeviceStatus {
    #[serde(rename = "onOff")]
    pub on_off: u8,
    pub brightness: u8,
    pub color: DeviceColor,
    #[serde(rename = "colorTemInKelvin")]
    pub color_temperature_kelvin: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

/// Names the status fields that changed between two reports. Pushed
/// alongside status updates so consumers can apply field-partial
/// refreshes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum StatusField {
    #[strum(serialize = "onOff")]
    OnOff,
    #[strum(serialize = "brightness")]
    Brightness,
    #[strum(serialize = "color")]
    Color,
    #[strum(serialize = "colorKelvin")]
    ColorKelvin,
}

pub const ALL_STATUS_FIELDS: [StatusField; 4] = [
    StatusField::OnOff,
    StatusField::Brightness,
    StatusField::Color,
    StatusField::ColorKelvin,
];

/// Which fields differ between the previous report (if any) and the
/// next one. A first report counts as everything changed.
pub fn diff_status(prev: Option<&DeviceStatus>, next: &DeviceStatus) -> Vec<StatusField> {
    let Some(prev) = prev else {
        return ALL_STATUS_FIELDS.to_vec();
    };

    let mut changed = vec![];
    if prev.on_off != next.on_off {
        changed.push(StatusField::OnOff);
    }
    if prev.brightness != next.brightness {
        changed.push(StatusField::Brightness);
    }
    if prev.color != next.color {
        changed.push(StatusField::Color);
    }
    if prev.color_temperature_kelvin != next.color_temperature_kelvin {
        changed.push(StatusField::ColorKelvin);
    }
    changed
}

#[derive(Debug, Clone)]
pub struct LanDevice {
    info: ScannedDevice,
    addr: SocketAddr,
}

impl LanDevice {
    pub fn with_scan(info: ScannedDevice, addr: IpAddr) -> Self {
        let addr = SocketAddr::from((addr, CMD_PORT));
        Self { info, addr }
    }

    pub fn id(&self) -> &str {
        &self.info.device
    }

    pub fn sku(&self) -> &str {
        &self.info.sku
    }

    pub fn ip(&self) -> IpAddr {
        self.info.ip
    }

    pub async fn send_request(&self, msg: Request) -> anyhow::Result<()> {
        let client = UdpSocket::bind("0.0.0.0:0").await?;
        let data = serde_json::to_string(&RequestMessage { msg })?;
        client.send_to(data.as_bytes(), self.addr).await?;

        Ok(())
    }

    pub async fn send_turn(&self, on: bool) -> anyhow::Result<()> {
        self.send_request(Request::Turn {
            value: if on { 1 } else { 0 },
        })
        .await
    }

    pub async fn send_brightness(&self, percent: u8) -> anyhow::Result<()> {
        self.send_request(Request::Brightness { value: percent })
            .await
    }

    pub async fn send_color_rgb(&self, color: DeviceColor) -> anyhow::Result<()> {
        self.send_request(Request::Color {
            color,
            color_temperature_kelvin: 0,
        })
        .await
    }

    pub async fn send_color_temperature_kelvin(&self, kelvin: u32) -> anyhow::Result<()> {
        self.send_request(Request::Color {
            color: DeviceColor { r: 0, g: 0, b: 0 },
            color_temperature_kelvin: kelvin,
        })
        .await
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "cmd", content = "data")]
pub enum Response {
    #[serde(rename = "scan")]
    Scan(ScannedDevice),
    #[serde(rename = "devStatus")]
    DevStatus(DeviceStatus),
}

#[derive(Serialize, Deserialize, Debug)]
struct ResponseWrapper {
    msg: Response,
}

#[derive(Serialize, Deserialize, Debug)]
pub enum AccountTopic {
    #[serde(rename = "reserve")]
    Reserve,
}

#[derive(Debug, Clone)]
pub enum LanEvent {
    DeviceAdded(LanDevice),
    DeviceRemoved { device: String },
    UpdatedStatus {
        device: String,
        status: DeviceStatus,
        changed: Vec<StatusField>,
    },
}

struct RosterEntry {
    device: LanDevice,
    status: Option<DeviceStatus>,
    last_seen: Instant,
}

struct ClientListener {
    addr: IpAddr,
    tx: Sender<Response>,
}

struct ClientInner {
    roster: Mutex<HashMap<String, RosterEntry>>,
    mux: Mutex<Vec<ClientListener>>,
    events: broadcast::Sender<LanEvent>,
}

#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

fn scan_message() -> String {
    serde_json::to_string(&RequestMessage {
        msg: Request::Scan {
            account_topic: AccountTopic::Reserve,
        },
    })
    .expect("to serialize scan message")
}

async fn send_scan(mcast: &UdpSocket) -> anyhow::Result<()> {
    mcast
        .send_to(scan_message().as_bytes(), (MULTICAST, SCAN_PORT))
        .await?;
    Ok(())
}

async fn process_packet(
    addr: SocketAddr,
    data: &[u8],
    inner: &Arc<ClientInner>,
) -> anyhow::Result<()> {
    let response: ResponseWrapper = serde_json::from_slice(data)
        .with_context(|| format!("Parsing: {}", String::from_utf8_lossy(data)))?;

    {
        let mut mux = inner.mux.lock().await;
        mux.retain(|l| !l.tx.is_closed());
        for l in mux.iter() {
            if l.addr == addr.ip() {
                l.tx.send(response.msg.clone()).await.ok();
            }
        }
    }

    let mut roster = inner.roster.lock().await;
    match response.msg {
        Response::Scan(info) => {
            let device = LanDevice::with_scan(info, addr.ip());
            let id = device.id().to_string();
            match roster.get_mut(&id) {
                Some(entry) => {
                    entry.device = device;
                    entry.last_seen = Instant::now();
                }
                None => {
                    log::debug!("LAN: discovered {id} ({}) at {}", device.sku(), addr.ip());
                    roster.insert(
                        id,
                        RosterEntry {
                            device: device.clone(),
                            status: None,
                            last_seen: Instant::now(),
                        },
                    );
                    inner.events.send(LanEvent::DeviceAdded(device)).ok();
                }
            }
        }
        Response::DevStatus(status) => {
            // Status packets don't carry a device id; attribute them
            // by source address
            if let Some(entry) = roster.values_mut().find(|e| e.device.ip() == addr.ip()) {
                entry.last_seen = Instant::now();
                let changed = diff_status(entry.status.as_ref(), &status);
                entry.status = Some(status.clone());
                if !changed.is_empty() {
                    inner
                        .events
                        .send(LanEvent::UpdatedStatus {
                            device: entry.device.id().to_string(),
                            status,
                            changed,
                        })
                        .ok();
                }
            }
        }
    }

    Ok(())
}

async fn prune_stale(inner: &Arc<ClientInner>) {
    let mut roster = inner.roster.lock().await;
    let now = Instant::now();
    let stale: Vec<String> = roster
        .iter()
        .filter(|(_, e)| now.duration_since(e.last_seen) > STALE_AFTER)
        .map(|(id, _)| id.to_string())
        .collect();
    for id in stale {
        log::debug!("LAN: {id} went stale, dropping from roster");
        roster.remove(&id);
        inner
            .events
            .send(LanEvent::DeviceRemoved { device: id })
            .ok();
    }
}

async fn poll_roster(inner: &Arc<ClientInner>) -> anyhow::Result<()> {
    let devices: Vec<LanDevice> = inner
        .roster
        .lock()
        .await
        .values()
        .map(|e| e.device.clone())
        .collect();
    for device in devices {
        if let Err(err) = device.send_request(Request::DevStatus {}).await {
            log::warn!("LAN: status request to {} failed: {err:#}", device.id());
        }
    }
    Ok(())
}

async fn run_disco(
    mcast: UdpSocket,
    listen: UdpSocket,
    inner: Arc<ClientInner>,
) -> anyhow::Result<()> {
    send_scan(&mcast).await?;

    let mut scan_interval = Duration::from_secs(2);
    let max_scan_interval = Duration::from_secs(60);
    let mut last_scan = Instant::now();
    let mut last_poll = Instant::now();

    loop {
        let mut buf = [0u8; 4096];

        let deadline = (last_scan + scan_interval).min(last_poll + STATUS_POLL_INTERVAL);
        match tokio::time::timeout_at(deadline, listen.recv_from(&mut buf)).await {
            Ok(Ok((len, addr))) => {
                if let Err(err) = process_packet(addr, &buf[0..len], &inner).await {
                    log::error!("process_packet: {err:#}");
                }
            }
            Ok(Err(err)) => {
                log::error!("recv_from: {err:#}");
            }
            Err(_) => {
                let now = Instant::now();
                if now >= last_scan + scan_interval {
                    send_scan(&mcast).await?;
                    last_scan = now;
                    scan_interval = (scan_interval * 2).min(max_scan_interval);
                }
                if now >= last_poll + STATUS_POLL_INTERVAL {
                    poll_roster(&inner).await?;
                    prune_stale(&inner).await;
                    last_poll = now;
                }
            }
        }
    }
}

async fn bind_sockets() -> anyhow::Result<(UdpSocket, UdpSocket)> {
    let mcast = UdpSocket::bind("0.0.0.0:0").await?;
    mcast.set_multicast_loop_v4(false)?;
    mcast.join_multicast_v4(MULTICAST, Ipv4Addr::UNSPECIFIED)?;

    let listen = UdpSocket::bind(("0.0.0.0", LISTEN_PORT))
        .await
        .with_context(|| format!("binding listen port {LISTEN_PORT}"))?;

    Ok((mcast, listen))
}

impl Client {
    /// Initializes the shared LAN client. If the underlying UDP stack
    /// cannot be brought up within `init_timeout` (typically because
    /// the listen port is already bound by another process), the
    /// returned error is terminal for this client instance: callers
    /// keep it as a persistent unavailable state until they
    /// explicitly reinitialize.
    pub async fn new(
        init_timeout: Duration,
    ) -> Result<(Self, broadcast::Receiver<LanEvent>), LanError> {
        let sockets = tokio::time::timeout(init_timeout, bind_sockets())
            .await
            .map_err(|_| {
                LanError::Unavailable(format!(
                    "UDP setup did not become ready within {init_timeout:?}"
                ))
            })?
            .map_err(|err| LanError::Unavailable(format!("{err:#}")))?;
        let (mcast, listen) = sockets;

        let (events, rx) = broadcast::channel(64);
        let inner = Arc::new(ClientInner {
            roster: Mutex::new(HashMap::new()),
            mux: Mutex::new(vec![]),
            events,
        });

        {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                if let Err(err) = run_disco(mcast, listen, inner).await {
                    log::error!("Error at the disco: {err:#}");
                }
            });
        }

        Ok((Self { inner }, rx))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LanEvent> {
        self.inner.events.subscribe()
    }

    /// Forces an immediate broadcast scan.
    pub async fn discover(&self) -> anyhow::Result<()> {
        let client = UdpSocket::bind("0.0.0.0:0").await?;
        client
            .send_to(scan_message().as_bytes(), (MULTICAST, SCAN_PORT))
            .await?;
        Ok(())
    }

    pub async fn get_device_by_id(&self, id: &str) -> Option<LanDevice> {
        self.inner
            .roster
            .lock()
            .await
            .get(id)
            .map(|e| e.device.clone())
    }

    pub async fn cached_status(&self, id: &str) -> Option<DeviceStatus> {
        self.inner
            .roster
            .lock()
            .await
            .get(id)
            .and_then(|e| e.status.clone())
    }

    async fn add_listener(&self, addr: IpAddr) -> anyhow::Result<Receiver<Response>> {
        let (tx, rx) = channel(1);
        let mut mux = self.inner.mux.lock().await;
        mux.push(ClientListener { addr, tx });
        Ok(rx)
    }

    /// Interrogates a device and waits for its status response.
    pub async fn query_status(&self, device: &LanDevice) -> anyhow::Result<DeviceStatus> {
        let mut rx = self.add_listener(device.addr.ip()).await?;
        device.send_request(Request::DevStatus {}).await?;
        loop {
            match tokio::time::timeout(Duration::from_secs(10), rx.recv()).await {
                Ok(Some(Response::DevStatus(status))) => {
                    return Ok(status);
                }
                Ok(Some(_)) => {}
                Ok(None) => anyhow::bail!("listener thread terminated"),
                Err(_) => anyhow::bail!("timeout waiting for response"),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn status(on: u8, brightness: u8, rgb: (u8, u8, u8), kelvin: u32) -> DeviceStatus {
        DeviceStatus {
            on_off: on,
            brightness,
            color: DeviceColor {
                r: rgb.0,
                g: rgb.1,
                b: rgb.2,
            },
            color_temperature_kelvin: kelvin,
        }
    }

    #[test]
    fn first_status_changes_everything() {
        let next = status(1, 50, (255, 0, 0), 0);
        k9::assert_equal!(diff_status(None, &next), ALL_STATUS_FIELDS.to_vec());
    }

    #[test]
    fn diff_reports_only_changed_fields() {
        let prev = status(1, 50, (255, 0, 0), 0);
        let next = status(1, 80, (255, 0, 0), 0);
        k9::assert_equal!(diff_status(Some(&prev), &next), vec![StatusField::Brightness]);

        let same = status(1, 50, (255, 0, 0), 0);
        assert!(diff_status(Some(&prev), &same).is_empty());
    }

    #[test]
    fn request_wire_shape() {
        let turn = serde_json::to_value(&RequestMessage {
            msg: Request::Turn { value: 1 },
        })
        .unwrap();
        k9::assert_equal!(
            turn,
            serde_json::json!({"msg": {"cmd": "turn", "data": {"value": 1}}})
        );

        let color = serde_json::to_value(&RequestMessage {
            msg: Request::Color {
                color: DeviceColor { r: 0, g: 0, b: 0 },
                color_temperature_kelvin: 4000,
            },
        })
        .unwrap();
        k9::assert_equal!(
            color,
            serde_json::json!({
                "msg": {
                    "cmd": "colorwc",
                    "data": {
                        "color": {"r": 0, "g": 0, "b": 0},
                        "colorTemInKelvin": 4000,
                    }
                }
            })
        );
    }

    #[test]
    fn scan_response_parses() {
        let packet = serde_json::json!({
            "msg": {
                "cmd": "scan",
                "data": {
                    "ip": "192.168.1.23",
                    "device": "1F:80:C5:32:32:36:72:4E",
                    "sku": "H619C",
                    "bleVersionHard": "3.01.01",
                    "bleVersionSoft": "1.03.01",
                    "wifiVersionHard": "1.00.10",
                    "wifiVersionSoft": "1.02.03"
                }
            }
        });
        let wrapper: ResponseWrapper = serde_json::from_value(packet).unwrap();
        match wrapper.msg {
            Response::Scan(info) => {
                k9::assert_equal!(info.sku, "H619C");
                k9::assert_equal!(info.device, "1F:80:C5:32:32:36:72:4E");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
