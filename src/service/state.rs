use crate::lan_api::{Client as LanClient, DeviceColor, LanError};
use crate::platform_api::GoveeApiClient;
use crate::service::device::Device;
use crate::service::iot::IotClient;
use crate::service::refresh::{DeviceRuntime, PushUpdate};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};

/// Cloud devices must not be polled more often than this; the vendor
/// enforces a modest daily request quota.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Default)]
pub struct State {
    devices_by_id: Mutex<HashMap<String, Device>>,
    runtimes_by_id: Mutex<HashMap<String, DeviceRuntime>>,
    platform_client: Mutex<Option<GoveeApiClient>>,
    lan_client: Mutex<Option<LanClient>>,
    lan_client_error: Mutex<Option<String>>,
    iot_client: Mutex<Option<IotClient>>,
    poll_interval: Mutex<Option<Duration>>,
}

pub type StateHandle = Arc<State>;

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a mutable version of the specified device, creating
    /// an entry for it if necessary.
    pub async fn device_mut(&self, sku: &str, id: &str) -> MappedMutexGuard<'_, Device> {
        let devices = self.devices_by_id.lock().await;
        MutexGuard::map(devices, |devices| {
            devices
                .entry(id.to_string())
                .or_insert_with(|| Device::new(sku, id))
        })
    }

    pub async fn devices(&self) -> Vec<Device> {
        self.devices_by_id.lock().await.values().cloned().collect()
    }

    /// Returns an immutable copy of the specified Device
    pub async fn device_by_id(&self, id: &str) -> Option<Device> {
        let devices = self.devices_by_id.lock().await;
        devices.get(id).cloned()
    }

    pub async fn set_platform_client(&self, client: GoveeApiClient) {
        self.platform_client.lock().await.replace(client);
    }

    pub async fn get_platform_client(&self) -> Option<GoveeApiClient> {
        self.platform_client.lock().await.clone()
    }

    /// The API key changed: the old client is discarded wholesale and
    /// every subsequent call uses the replacement.
    pub async fn replace_platform_client(&self, api_key: String) {
        self.set_platform_client(GoveeApiClient::new(api_key)).await;
    }

    pub async fn set_lan_client(&self, client: LanClient) {
        self.lan_client.lock().await.replace(client);
        self.lan_client_error.lock().await.take();
    }

    /// Records a LAN initialization failure. Until a reinitialize
    /// succeeds, every LAN operation reports this condition instead of
    /// being attempted.
    pub async fn set_lan_client_error(&self, reason: String) {
        self.lan_client.lock().await.take();
        self.lan_client_error.lock().await.replace(reason);
    }

    pub async fn get_lan_client(&self) -> anyhow::Result<LanClient> {
        if let Some(client) = self.lan_client.lock().await.clone() {
            return Ok(client);
        }
        match self.lan_client_error.lock().await.clone() {
            Some(reason) => Err(LanError::Unavailable(reason).into()),
            None => anyhow::bail!("no lan client"),
        }
    }

    pub async fn set_iot_client(&self, client: IotClient) {
        self.iot_client.lock().await.replace(client);
    }

    pub async fn get_iot_client(&self) -> Option<IotClient> {
        self.iot_client.lock().await.clone()
    }

    pub async fn set_poll_interval(&self, interval: Duration) {
        let interval = if interval < MIN_POLL_INTERVAL {
            log::warn!(
                "poll interval {interval:?} is below the platform rate limit floor, \
                 using {MIN_POLL_INTERVAL:?}"
            );
            MIN_POLL_INTERVAL
        } else {
            interval
        };
        self.poll_interval.lock().await.replace(interval);
    }

    pub async fn poll_interval(&self) -> Duration {
        (*self.poll_interval.lock().await).unwrap_or(MIN_POLL_INTERVAL)
    }

    pub async fn register_runtime(&self, id: &str, runtime: DeviceRuntime) {
        self.runtimes_by_id
            .lock()
            .await
            .insert(id.to_string(), runtime);
    }

    pub async fn hub_for(&self, id: &str) -> Option<Arc<crate::hub::MemoryHub>> {
        self.runtimes_by_id
            .lock()
            .await
            .get(id)
            .map(|r| r.hub.clone())
    }

    pub async fn runtime_ids(&self) -> Vec<String> {
        self.runtimes_by_id.lock().await.keys().cloned().collect()
    }

    /// Delivers a push update to the device's refresh loop, if it is
    /// running.
    pub async fn route_push(&self, id: &str, update: PushUpdate) {
        let tx = {
            let runtimes = self.runtimes_by_id.lock().await;
            runtimes.get(id).map(|r| r.push.clone())
        };
        if let Some(tx) = tx {
            tx.send(update).await.ok();
        }
    }

    /// The user removed the device: the refresh task is cancelled and
    /// the hub-side object is dropped. No further capability writes
    /// can occur once this returns.
    pub async fn remove_device(&self, id: &str) {
        if let Some(runtime) = self.runtimes_by_id.lock().await.remove(id) {
            runtime.shutdown.send(true).ok();
        }
        self.devices_by_id.lock().await.remove(id);
    }

    pub async fn device_power_on(
        self: &Arc<Self>,
        device: &Device,
        on: bool,
    ) -> anyhow::Result<()> {
        if let Some(lan_dev) = &device.lan_device {
            log::info!("Using LAN API to set {device} power state");
            lan_dev.send_turn(on).await?;
            return Ok(());
        }

        if let Some(client) = self.get_platform_client().await {
            if let Some(info) = &device.http_device_info {
                log::info!("Using Platform API to set {device} power state");
                client.set_power_state(info, on).await?;
                return Ok(());
            }
        }

        anyhow::bail!("Unable to control power state for {device}");
    }

    pub async fn device_set_brightness(
        self: &Arc<Self>,
        device: &Device,
        percent: u8,
    ) -> anyhow::Result<()> {
        if let Some(lan_dev) = &device.lan_device {
            log::info!("Using LAN API to set {device} brightness");
            lan_dev.send_brightness(percent).await?;
            return Ok(());
        }

        if let Some(client) = self.get_platform_client().await {
            if let Some(info) = &device.http_device_info {
                log::info!("Using Platform API to set {device} brightness");
                client.set_brightness(info, percent).await?;
                return Ok(());
            }
        }
        anyhow::bail!("Unable to control brightness for {device}");
    }

    pub async fn device_set_color_temperature(
        self: &Arc<Self>,
        device: &Device,
        kelvin: u32,
    ) -> anyhow::Result<()> {
        if let Some(lan_dev) = &device.lan_device {
            log::info!("Using LAN API to set {device} color temperature");
            lan_dev.send_color_temperature_kelvin(kelvin).await?;
            return Ok(());
        }

        if let Some(client) = self.get_platform_client().await {
            if let Some(info) = &device.http_device_info {
                log::info!("Using Platform API to set {device} color temperature");
                client.set_color_temperature(info, kelvin).await?;
                return Ok(());
            }
        }
        anyhow::bail!("Unable to control color temperature for {device}");
    }

    pub async fn device_set_color_rgb(
        self: &Arc<Self>,
        device: &Device,
        r: u8,
        g: u8,
        b: u8,
    ) -> anyhow::Result<()> {
        if let Some(lan_dev) = &device.lan_device {
            log::info!("Using LAN API to set {device} color");
            lan_dev.send_color_rgb(DeviceColor { r, g, b }).await?;
            return Ok(());
        }

        if let Some(client) = self.get_platform_client().await {
            if let Some(info) = &device.http_device_info {
                log::info!("Using Platform API to set {device} color");
                client.set_color_rgb(info, r, g, b).await?;
                return Ok(());
            }
        }
        anyhow::bail!("Unable to control color for {device}");
    }

    /// Activates a scene by opaque vendor value; cloud only.
    pub async fn device_set_scene_value(
        self: &Arc<Self>,
        device: &Device,
        instance: &str,
        value: JsonValue,
    ) -> anyhow::Result<()> {
        if let Some(client) = self.get_platform_client().await {
            if let Some(info) = &device.http_device_info {
                log::info!("Using Platform API to set {device} {instance}");
                client.set_scene_value(info, instance, value).await?;
                return Ok(());
            }
        }
        anyhow::bail!("Unable to set {instance} for {device}");
    }

    pub async fn device_set_toggle(
        self: &Arc<Self>,
        device: &Device,
        instance: &str,
        on: bool,
    ) -> anyhow::Result<()> {
        if let Some(client) = self.get_platform_client().await {
            if let Some(info) = &device.http_device_info {
                log::info!("Using Platform API to set {device} {instance} to {on}");
                client.set_toggle_state(info, instance, on).await?;
                return Ok(());
            }
        }
        anyhow::bail!("Unable to control {instance} for {device}");
    }

    pub async fn device_set_music_mode(
        self: &Arc<Self>,
        device: &Device,
        mode_value: JsonValue,
        sensitivity: u8,
    ) -> anyhow::Result<()> {
        if let Some(client) = self.get_platform_client().await {
            if let Some(info) = &device.http_device_info {
                if let Some(cap) = info.capability_by_instance("musicMode") {
                    log::info!("Using Platform API to set {device} music mode");
                    let value = serde_json::json!({
                        "musicMode": mode_value,
                        "sensitivity": sensitivity,
                    });
                    client.control_device(info, cap, value).await?;
                    return Ok(());
                }
            }
        }
        anyhow::bail!("Unable to set music mode for {device}");
    }

    /// Raw segment control; the value shape is vendor-defined and is
    /// passed through untouched.
    pub async fn device_set_segment_value(
        self: &Arc<Self>,
        device: &Device,
        instance: &str,
        value: JsonValue,
    ) -> anyhow::Result<()> {
        if let Some(client) = self.get_platform_client().await {
            if let Some(info) = &device.http_device_info {
                if let Some(cap) = info.capability_by_instance(instance) {
                    log::info!("Using Platform API to set {device} {instance}");
                    client.control_device(info, cap, value).await?;
                    return Ok(());
                }
            }
        }
        anyhow::bail!("Unable to control {instance} for {device}");
    }

    pub async fn device_list_scenes(&self, device: &Device) -> anyhow::Result<Vec<String>> {
        if let Some(client) = self.get_platform_client().await {
            if let Some(info) = &device.http_device_info {
                let mut names = vec![];
                for cap in client.get_device_scenes(info).await? {
                    for opt in cap.enum_options() {
                        names.push(opt.name.to_string());
                    }
                }
                for cap in client.get_device_diy_scenes(info).await? {
                    for opt in cap.enum_options() {
                        names.push(opt.name.to_string());
                    }
                }
                return Ok(sort_and_dedup_scenes(names));
            }
        }

        log::trace!("Platform API unavailable: Don't know how to list scenes for {device}");

        Ok(vec![])
    }
}

pub fn sort_and_dedup_scenes(mut scenes: Vec<String>) -> Vec<String> {
    scenes.sort_by_key(|s| s.to_ascii_lowercase());
    scenes.dedup();
    scenes
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn scene_sort() {
        let scenes = vec![
            "sunset".to_string(),
            "Aurora".to_string(),
            "sunset".to_string(),
            "candlelight".to_string(),
        ];
        k9::assert_equal!(
            sort_and_dedup_scenes(scenes),
            vec!["Aurora", "candlelight", "sunset"]
        );
    }

    #[tokio::test]
    async fn poll_interval_floor() {
        let state = State::new();
        state.set_poll_interval(Duration::from_secs(5)).await;
        k9::assert_equal!(state.poll_interval().await, MIN_POLL_INTERVAL);

        state.set_poll_interval(Duration::from_secs(300)).await;
        k9::assert_equal!(state.poll_interval().await, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn lan_error_state_is_persistent() {
        let state = State::new();
        state
            .set_lan_client_error("listen port 4002 is already bound".to_string())
            .await;
        let err = state.get_lan_client().await.unwrap_err();
        assert!(err.to_string().contains("already bound"), "{err:#}");
        // a second attempt reports the same condition without retrying
        let err = state.get_lan_client().await.unwrap_err();
        assert!(err.to_string().contains("reinitialized"), "{err:#}");
    }
}
