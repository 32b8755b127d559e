use crate::catalog::{find_instance, HubCapability};
use crate::hub::{CapabilityWrite, HubDevice, MemoryHub};
use crate::lan_api::{DeviceColor, DeviceStatus, StatusField};
use crate::platform_api::{CapabilityDescriptor, CapabilityKind, HttpDeviceState};
use crate::service::device::Device;
use crate::service::migrate::{resolve_capability_schema, SchemaError};
use crate::service::quirks::DEFAULT_COLOR_TEMP_RANGE;
use crate::service::reconcile::{reconcile, BindingSet, NoScenes, PlatformSceneSource};
use crate::service::state::StateHandle;
use crate::transcode::{
    classify_light_mode, dim_to_vendor, hs_to_rgb_int, kelvin_from_percent, percent_from_kelvin,
    rgb_int_to_components, rgb_int_to_hs, vendor_to_dim, LightMode,
};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

// One task per paired device owns its entire lifecycle:
//
//   Uninitialized -> Discovering -> Ready -> (Refreshing)* -> Disposed
//
// Poll ticks, push events and inbound capability writes all flow
// through the same select loop, so per-device work is strictly
// serialized and a slow state fetch delays the next tick instead of
// overlapping it.

/// How often a local-protocol device is looked up in the discovery
/// roster while it has not been seen yet
const DISCOVERY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How long to wait before retrying a failed capability schema
/// resolution
const SCHEMA_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// A state change pushed from outside the poll loop. Only the fields
/// that the sender actually reported are present; everything else
/// must be left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushUpdate {
    pub on_off: Option<u8>,
    pub brightness: Option<u8>,
    pub color: Option<DeviceColor>,
    pub color_temperature_kelvin: Option<u32>,
}

impl PushUpdate {
    /// Projects a LAN status report down to the fields named in its
    /// changed list. Color and kelvin travel together: the mode
    /// decision needs both whenever either moved.
    pub fn from_lan(status: &DeviceStatus, changed: &[StatusField]) -> Self {
        let mut update = Self::default();
        for field in changed {
            match field {
                StatusField::OnOff => update.on_off = Some(status.on_off),
                StatusField::Brightness => update.brightness = Some(status.brightness),
                StatusField::Color | StatusField::ColorKelvin => {
                    update.color = Some(status.color);
                    update.color_temperature_kelvin = Some(status.color_temperature_kelvin);
                }
            }
        }
        update
    }

    pub fn full(status: &DeviceStatus) -> Self {
        Self {
            on_off: Some(status.on_off),
            brightness: Some(status.brightness),
            color: Some(status.color),
            color_temperature_kelvin: Some(status.color_temperature_kelvin),
        }
    }
}

/// Handle to a running device task, kept in the service state so that
/// push sources can route updates and deletion can cancel the task.
pub struct DeviceRuntime {
    pub hub: Arc<MemoryHub>,
    pub shutdown: watch::Sender<bool>,
    pub push: mpsc::Sender<PushUpdate>,
}

/// Boots the device task and registers its runtime.
pub async fn spawn_device(state: &StateHandle, sku: &str, id: &str) -> Arc<MemoryHub> {
    let hub = Arc::new(MemoryHub::new(id));
    let (push_tx, push_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    state
        .register_runtime(
            id,
            DeviceRuntime {
                hub: hub.clone(),
                shutdown: shutdown_tx,
                push: push_tx,
            },
        )
        .await;

    {
        let state = state.clone();
        let hub = hub.clone();
        let sku = sku.to_string();
        let id = id.to_string();
        tokio::spawn(async move {
            if let Err(err) = run_device(state, hub, &sku, &id, push_rx, shutdown_rx).await {
                log::error!("device task {id}: {err:#}");
            }
        });
    }

    hub
}

/// The descriptor list implied by the local protocol: every LAN
/// device answers the same four status fields.
pub fn local_descriptor_list() -> Vec<CapabilityDescriptor> {
    ["powerSwitch", "brightness", "colorRgb", "colorTemperatureK"]
        .into_iter()
        .map(|instance| CapabilityDescriptor {
            kind: match instance {
                "powerSwitch" => CapabilityKind::OnOff,
                "brightness" => CapabilityKind::Range,
                _ => CapabilityKind::ColorSetting,
            },
            instance: instance.to_string(),
            parameters: None,
            alarm_type: None,
            event_state: None,
        })
        .collect()
}

async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, period: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(period) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

/// Resolves the descriptor list for the device, retrying until it
/// succeeds or the device is deleted. Returns None on shutdown.
async fn resolve_descriptors(
    state: &StateHandle,
    hub: &Arc<MemoryHub>,
    device: &Device,
    shutdown: &mut watch::Receiver<bool>,
) -> anyhow::Result<Option<Vec<CapabilityDescriptor>>> {
    if device.http_device_info.is_none() {
        return Ok(Some(local_descriptor_list()));
    }

    loop {
        let Some(client) = state.get_platform_client().await else {
            anyhow::bail!("device {device} has cloud metadata but there is no platform client");
        };
        match resolve_capability_schema(hub.as_ref(), &client, &device.id).await {
            Ok(descriptors) => return Ok(Some(descriptors)),
            Err(SchemaError::NotInAccount(id)) => {
                log::warn!("cannot resolve capability schema for {id}; device unavailable");
                hub.set_unavailable("Device is not present in the vendor account")
                    .await;
            }
            Err(SchemaError::Other(err)) => {
                log::warn!("resolving capability schema for {device}: {err:#}");
            }
        }
        if wait_or_shutdown(shutdown, SCHEMA_RETRY_INTERVAL).await {
            return Ok(None);
        }
    }
}

async fn run_device(
    state: StateHandle,
    hub: Arc<MemoryHub>,
    sku: &str,
    id: &str,
    mut push_rx: mpsc::Receiver<PushUpdate>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let device = state
        .device_by_id(id)
        .await
        .ok_or_else(|| anyhow::anyhow!("device {id} is not registered"))?;
    let is_cloud = device.http_device_info.is_some();

    let Some(descriptors) =
        resolve_descriptors(&state, &hub, &device, &mut shutdown_rx).await?
    else {
        log::debug!("{device}: disposed before its schema was resolved");
        return Ok(());
    };

    let (cmd_tx, mut cmd_rx) = mpsc::channel(8);
    let bindings = {
        let client = state.get_platform_client().await;
        match (&client, &device.http_device_info) {
            (Some(client), Some(info)) => {
                let scenes = PlatformSceneSource {
                    client,
                    device: info,
                };
                reconcile(
                    hub.as_ref(),
                    &descriptors,
                    device.type_tag(),
                    &scenes,
                    cmd_tx.clone(),
                )
                .await?
            }
            _ => {
                reconcile(
                    hub.as_ref(),
                    &descriptors,
                    device.type_tag(),
                    &NoScenes,
                    cmd_tx.clone(),
                )
                .await?
            }
        }
    };
    drop(cmd_tx);

    // Local-protocol devices have to be seen on the wire before they
    // are usable
    let mut discovered = is_cloud;
    if !discovered {
        log::debug!("{device}: discovering");
        hub.set_unavailable("Discovering the device").await;
    }

    let mut poll = tokio::time::interval(state.poll_interval().await);
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut discovery_poll = tokio::time::interval(DISCOVERY_POLL_INTERVAL);
    discovery_poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // second handle for disposed-checks inside branch bodies, while
    // the primary receiver is parked in the select
    let disposed = shutdown_rx.clone();

    log::debug!("{device}: ready");
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *disposed.borrow() {
                    break;
                }
            }
            _ = poll.tick(), if is_cloud => {
                if let Err(err) = poll_cloud_state(&state, &hub, id, &disposed).await {
                    // skipped this cycle; the timer stays armed
                    log::warn!("polling {id}: {err:#}");
                }
            }
            _ = discovery_poll.tick(), if !discovered => {
                match check_discovered(&state, &hub, sku, id).await {
                    Ok(Some(update)) => {
                        discovered = true;
                        hub.set_available().await;
                        let device = state.device_by_id(id).await;
                        let range = device
                            .map(|d| d.color_temp_range())
                            .unwrap_or(DEFAULT_COLOR_TEMP_RANGE);
                        if let Err(err) = apply_push_update(hub.as_ref(), &update, range).await {
                            log::warn!("applying initial state for {id}: {err:#}");
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        log::trace!("discovery check for {id}: {err:#}");
                    }
                }
            }
            update = push_rx.recv() => {
                let Some(update) = update else { break };
                if *disposed.borrow() {
                    break;
                }
                let range = state
                    .device_by_id(id)
                    .await
                    .map(|d| d.color_temp_range())
                    .unwrap_or(DEFAULT_COLOR_TEMP_RANGE);
                if let Err(err) = apply_push_update(hub.as_ref(), &update, range).await {
                    log::warn!("applying push update for {id}: {err:#}");
                }
            }
            write = cmd_rx.recv() => {
                let Some(write) = write else { break };
                handle_capability_write(&state, &hub, id, &bindings, write).await;
            }
        }
    }

    log::debug!("device task {id}: disposed");
    Ok(())
}

/// One refresh cycle against the cloud state endpoint.
async fn poll_cloud_state(
    state: &StateHandle,
    hub: &Arc<MemoryHub>,
    id: &str,
    shutdown: &watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let device = state
        .device_by_id(id)
        .await
        .ok_or_else(|| anyhow::anyhow!("device {id} is not registered"))?;
    let Some(client) = state.get_platform_client().await else {
        anyhow::bail!("no platform client");
    };
    let Some(info) = &device.http_device_info else {
        anyhow::bail!("device {device} has no cloud metadata");
    };

    log::trace!("requesting state update for {device}");
    let snapshot = client.get_device_state(info).await?;

    // the fetch may have raced device deletion
    if *shutdown.borrow() {
        return Ok(());
    }

    state.device_mut(&device.sku, id).await.set_last_polled();
    apply_cloud_snapshot(hub.as_ref(), &snapshot, device.color_temp_range()).await
}

/// Looks for the device in the LAN roster; when present, returns the
/// full status to seed the hub with.
async fn check_discovered(
    state: &StateHandle,
    _hub: &Arc<MemoryHub>,
    sku: &str,
    id: &str,
) -> anyhow::Result<Option<PushUpdate>> {
    let client = state.get_lan_client().await?;
    let Some(lan_device) = client.get_device_by_id(id).await else {
        return Ok(None);
    };

    state
        .device_mut(sku, id)
        .await
        .set_lan_device(lan_device.clone());
    log::info!("LAN device {id} is now reachable");

    let status = match client.cached_status(id).await {
        Some(status) => status,
        None => client.query_status(&lan_device).await?,
    };
    Ok(Some(PushUpdate::full(&status)))
}

fn value_truthy(value: &JsonValue) -> Option<bool> {
    if let Some(b) = value.as_bool() {
        return Some(b);
    }
    value.as_i64().map(|n| n != 0)
}

async fn set_if_has(
    hub: &dyn HubDevice,
    cap: &HubCapability,
    value: JsonValue,
) -> anyhow::Result<()> {
    if hub.has_capability(cap).await {
        hub.set_capability_value(cap, value).await?;
    }
    Ok(())
}

/// Writes a full cloud state snapshot into the hub capabilities the
/// device currently has. Instances the vendor omitted this cycle are
/// skipped silently.
pub async fn apply_cloud_snapshot(
    hub: &dyn HubDevice,
    snapshot: &HttpDeviceState,
    kelvin_range: (u32, u32),
) -> anyhow::Result<()> {
    if let Some(power) = find_instance(snapshot, "powerSwitch").and_then(value_truthy) {
        set_if_has(hub, &HubCapability::OnOff, JsonValue::from(power)).await?;
    }

    if let Some(brightness) = find_instance(snapshot, "brightness").and_then(|v| v.as_u64()) {
        set_if_has(
            hub,
            &HubCapability::Dim,
            JsonValue::from(vendor_to_dim(brightness as u32)),
        )
        .await?;
    }

    let kelvin = find_instance(snapshot, "colorTemperatureK")
        .and_then(|v| v.as_u64())
        .map(|v| v as u32);
    let rgb = find_instance(snapshot, "colorRgb")
        .and_then(|v| v.as_u64())
        .map(|v| v as u32);

    let mode = match (rgb, kelvin) {
        (Some(rgb), kelvin) => {
            let (r, g, b) = rgb_int_to_components(rgb);
            Some(classify_light_mode(
                DeviceColor { r, g, b },
                kelvin.unwrap_or(0),
            ))
        }
        (None, Some(k)) => Some(if k != 0 {
            LightMode::Temperature
        } else {
            LightMode::Color
        }),
        (None, None) => None,
    };

    match mode {
        Some(LightMode::Temperature) => {
            let percent = kelvin.filter(|&k| k != 0).map(|k| {
                percent_from_kelvin(k, kelvin_range.0, kelvin_range.1)
            });
            set_if_has(
                hub,
                &HubCapability::LightTemperature,
                percent.map(JsonValue::from).unwrap_or(JsonValue::Null),
            )
            .await?;
            set_if_has(hub, &HubCapability::LightHue, JsonValue::Null).await?;
            set_if_has(hub, &HubCapability::LightSaturation, JsonValue::Null).await?;
        }
        Some(LightMode::Color) => {
            if let Some(rgb) = rgb {
                let (hue, saturation) = rgb_int_to_hs(rgb);
                set_if_has(hub, &HubCapability::LightHue, JsonValue::from(hue)).await?;
                set_if_has(
                    hub,
                    &HubCapability::LightSaturation,
                    JsonValue::from(saturation),
                )
                .await?;
            }
            set_if_has(hub, &HubCapability::LightTemperature, JsonValue::Null).await?;
        }
        None => {}
    }

    if let Some(mode) = mode {
        set_if_has(hub, &HubCapability::LightMode, JsonValue::from(mode.to_string())).await?;
    }

    Ok(())
}

/// Applies a field-partial push update. Exactly the capabilities
/// matching the reported fields are written; everything else stays
/// untouched.
pub async fn apply_push_update(
    hub: &dyn HubDevice,
    update: &PushUpdate,
    kelvin_range: (u32, u32),
) -> anyhow::Result<()> {
    if let Some(on) = update.on_off {
        set_if_has(hub, &HubCapability::OnOff, JsonValue::from(on != 0)).await?;
    }

    if let Some(brightness) = update.brightness {
        set_if_has(
            hub,
            &HubCapability::Dim,
            JsonValue::from(vendor_to_dim(brightness as u32)),
        )
        .await?;
    }

    if update.color.is_none() && update.color_temperature_kelvin.is_none() {
        return Ok(());
    }

    let kelvin = update.color_temperature_kelvin;
    let mode = match update.color {
        Some(color) => classify_light_mode(color, kelvin.unwrap_or(0)),
        None => {
            if kelvin.unwrap_or(0) != 0 {
                LightMode::Temperature
            } else {
                LightMode::Color
            }
        }
    };

    match mode {
        LightMode::Temperature => {
            if let Some(k) = kelvin {
                set_if_has(
                    hub,
                    &HubCapability::LightTemperature,
                    JsonValue::from(percent_from_kelvin(k, kelvin_range.0, kelvin_range.1)),
                )
                .await?;
            }
        }
        LightMode::Color => {
            if let Some(color) = update.color {
                let rgb =
                    ((color.r as u32) << 16) | ((color.g as u32) << 8) | (color.b as u32);
                let (hue, saturation) = rgb_int_to_hs(rgb);
                set_if_has(hub, &HubCapability::LightHue, JsonValue::from(hue)).await?;
                set_if_has(
                    hub,
                    &HubCapability::LightSaturation,
                    JsonValue::from(saturation),
                )
                .await?;
            }
        }
    }

    set_if_has(hub, &HubCapability::LightMode, JsonValue::from(mode.to_string())).await?;

    Ok(())
}

async fn handle_capability_write(
    state: &StateHandle,
    hub: &Arc<MemoryHub>,
    id: &str,
    bindings: &BindingSet,
    write: CapabilityWrite,
) {
    let capability = write.capability.clone();
    let result = dispatch_capability_write(state, hub, id, bindings, &capability, write.value).await;
    if let Err(err) = &result {
        log::warn!("capability write {capability} on {id} rejected: {err:#}");
    }
    write.reply.send(result).ok();
}

fn expect_unit_fraction(value: &JsonValue, what: &str) -> anyhow::Result<f64> {
    let v = value
        .as_f64()
        .ok_or_else(|| anyhow::anyhow!("{what} expects a number, got {value}"))?;
    if !(0.0..=1.0).contains(&v) {
        anyhow::bail!("{what} value {v} is outside the 0..1 domain");
    }
    Ok(v)
}

fn expect_index(value: &JsonValue, what: &str) -> anyhow::Result<usize> {
    value
        .as_u64()
        .map(|v| v as usize)
        .ok_or_else(|| anyhow::anyhow!("{what} expects a non-negative index, got {value}"))
}

/// Validates and routes one inbound capability write. Domain errors
/// reject before any network call is attempted.
async fn dispatch_capability_write(
    state: &StateHandle,
    hub: &Arc<MemoryHub>,
    id: &str,
    bindings: &BindingSet,
    capability: &HubCapability,
    value: JsonValue,
) -> anyhow::Result<()> {
    let device = state
        .device_by_id(id)
        .await
        .ok_or_else(|| anyhow::anyhow!("device {id} is not registered"))?;

    match capability {
        HubCapability::OnOff => {
            let on = value
                .as_bool()
                .ok_or_else(|| anyhow::anyhow!("onoff expects a boolean, got {value}"))?;
            state.device_power_on(&device, on).await?;
            set_if_has(hub.as_ref(), capability, JsonValue::from(on)).await?;
        }
        HubCapability::Dim => {
            let dim = expect_unit_fraction(&value, "dim")?;
            state
                .device_set_brightness(&device, dim_to_vendor(dim))
                .await?;
            set_if_has(hub.as_ref(), capability, JsonValue::from(dim)).await?;
        }
        HubCapability::LightTemperature => {
            let percent = expect_unit_fraction(&value, "light_temperature")?;
            let (min, max) = device.color_temp_range();
            state
                .device_set_color_temperature(&device, kelvin_from_percent(percent, min, max))
                .await?;
            set_if_has(hub.as_ref(), capability, JsonValue::from(percent)).await?;
        }
        HubCapability::LightHue => {
            let hue = expect_unit_fraction(&value, "light_hue")?;
            let saturation = hub
                .get_capability_value(&HubCapability::LightSaturation)
                .await
                .and_then(|v| v.as_f64())
                .unwrap_or(1.);
            let (r, g, b) = rgb_int_to_components(hs_to_rgb_int(hue, saturation, 1.));
            state.device_set_color_rgb(&device, r, g, b).await?;
            set_if_has(hub.as_ref(), capability, JsonValue::from(hue)).await?;
        }
        HubCapability::LightSaturation => {
            let saturation = expect_unit_fraction(&value, "light_saturation")?;
            let hue = hub
                .get_capability_value(&HubCapability::LightHue)
                .await
                .and_then(|v| v.as_f64())
                .unwrap_or(0.);
            let (r, g, b) = rgb_int_to_components(hs_to_rgb_int(hue, saturation, 1.));
            state.device_set_color_rgb(&device, r, g, b).await?;
            set_if_has(hub.as_ref(), capability, JsonValue::from(saturation)).await?;
        }
        HubCapability::LightMode => {
            let mode: LightMode = value
                .as_str()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| {
                    anyhow::anyhow!("light_mode expects \"color\" or \"temperature\", got {value}")
                })?;
            match mode {
                LightMode::Temperature => {
                    if let Some(percent) = hub
                        .get_capability_value(&HubCapability::LightTemperature)
                        .await
                        .and_then(|v| v.as_f64())
                    {
                        let (min, max) = device.color_temp_range();
                        state
                            .device_set_color_temperature(
                                &device,
                                kelvin_from_percent(percent, min, max),
                            )
                            .await?;
                    }
                }
                LightMode::Color => {
                    if let Some(hue) = hub
                        .get_capability_value(&HubCapability::LightHue)
                        .await
                        .and_then(|v| v.as_f64())
                    {
                        let saturation = hub
                            .get_capability_value(&HubCapability::LightSaturation)
                            .await
                            .and_then(|v| v.as_f64())
                            .unwrap_or(1.);
                        let (r, g, b) =
                            rgb_int_to_components(hs_to_rgb_int(hue, saturation, 1.));
                        state.device_set_color_rgb(&device, r, g, b).await?;
                    }
                }
            }
            set_if_has(hub.as_ref(), capability, value).await?;
        }
        HubCapability::LightScenes(_)
        | HubCapability::LightDiyScenes(_)
        | HubCapability::NightlightScenes(_)
        | HubCapability::Snapshots(_) => {
            let index = expect_index(&value, "scene")?;
            let option = bindings.scene_value_at(capability, index).ok_or_else(|| {
                anyhow::anyhow!("scene index {index} is out of range for {capability}")
            })?;
            let instance = capability.scene_instance().expect("scene capability");
            log::info!("switching {device} to scene {}", option.name);
            state
                .device_set_scene_value(&device, instance, option.value.clone())
                .await?;
            set_if_has(hub.as_ref(), capability, JsonValue::from(index)).await?;
        }
        HubCapability::MusicMode(_) => {
            let index = expect_index(&value, "music mode")?;
            let option = bindings.scene_value_at(capability, index).ok_or_else(|| {
                anyhow::anyhow!("music mode index {index} is out of range")
            })?;
            state
                .device_set_music_mode(&device, option.value.clone(), 100)
                .await?;
            set_if_has(hub.as_ref(), capability, JsonValue::from(index)).await?;
        }
        HubCapability::DreamViewToggle(_) => {
            let on = value
                .as_bool()
                .ok_or_else(|| anyhow::anyhow!("toggle expects a boolean, got {value}"))?;
            let instance = capability.toggle_instance().expect("toggle capability");
            state.device_set_toggle(&device, instance, on).await?;
            set_if_has(hub.as_ref(), capability, JsonValue::from(on)).await?;
        }
        HubCapability::SegmentControlColor(_) => {
            if !value.is_object() {
                anyhow::bail!("segment color expects an object value, got {value}");
            }
            state
                .device_set_segment_value(&device, "segmentedColorRgb", value)
                .await?;
        }
        HubCapability::SegmentControlBrightness(_) => {
            if !value.is_object() {
                anyhow::bail!("segment brightness expects an object value, got {value}");
            }
            state
                .device_set_segment_value(&device, "segmentedBrightness", value)
                .await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::platform_api::from_json;
    use crate::service::state::State;

    async fn light_hub() -> MemoryHub {
        let hub = MemoryHub::new("AA:BB");
        for cap in [
            HubCapability::OnOff,
            HubCapability::Dim,
            HubCapability::LightHue,
            HubCapability::LightSaturation,
            HubCapability::LightTemperature,
            HubCapability::LightMode,
        ] {
            hub.add_capability(&cap).await.unwrap();
        }
        hub
    }

    fn white_status(kelvin: u32) -> DeviceStatus {
        DeviceStatus {
            on_off: 1,
            brightness: 100,
            color: DeviceColor {
                r: 255,
                g: 255,
                b: 255,
            },
            color_temperature_kelvin: kelvin,
        }
    }

    #[tokio::test]
    async fn partial_update_only_touches_reported_fields() {
        let hub = light_hub().await;
        hub.set_capability_value(&HubCapability::OnOff, serde_json::json!(true))
            .await
            .unwrap();
        hub.set_capability_value(&HubCapability::LightHue, serde_json::json!(0.25))
            .await
            .unwrap();

        let update = PushUpdate {
            brightness: Some(200),
            ..Default::default()
        };
        apply_push_update(&hub, &update, (2000, 9000)).await.unwrap();

        // only dim moved; 200 is on the legacy 0-255 scale
        let dim = hub
            .get_capability_value(&HubCapability::Dim)
            .await
            .unwrap()
            .as_f64()
            .unwrap();
        assert!((dim - 200. / 255.).abs() < 1e-9, "{dim}");
        k9::assert_equal!(
            hub.get_capability_value(&HubCapability::OnOff).await,
            Some(serde_json::json!(true))
        );
        k9::assert_equal!(
            hub.get_capability_value(&HubCapability::LightHue).await,
            Some(serde_json::json!(0.25))
        );
        k9::assert_equal!(
            hub.get_capability_value(&HubCapability::LightMode).await,
            Some(JsonValue::Null)
        );
    }

    #[tokio::test]
    async fn white_reads_as_temperature_mode() {
        let hub = light_hub().await;
        let status = white_status(4000);
        let update = PushUpdate::from_lan(&status, &crate::lan_api::ALL_STATUS_FIELDS);
        apply_push_update(&hub, &update, (2000, 9000)).await.unwrap();

        k9::assert_equal!(
            hub.get_capability_value(&HubCapability::LightMode).await,
            Some(serde_json::json!("temperature"))
        );
        let percent = hub
            .get_capability_value(&HubCapability::LightTemperature)
            .await
            .unwrap()
            .as_f64()
            .unwrap();
        assert!((percent - 0.2857).abs() < 0.001, "{percent}");
    }

    #[tokio::test]
    async fn color_update_sets_hue_saturation_and_mode() {
        let hub = light_hub().await;
        let update = PushUpdate {
            color: Some(DeviceColor { r: 255, g: 0, b: 0 }),
            color_temperature_kelvin: Some(0),
            ..Default::default()
        };
        apply_push_update(&hub, &update, (2000, 9000)).await.unwrap();

        k9::assert_equal!(
            hub.get_capability_value(&HubCapability::LightMode).await,
            Some(serde_json::json!("color"))
        );
        let hue = hub
            .get_capability_value(&HubCapability::LightHue)
            .await
            .unwrap()
            .as_f64()
            .unwrap();
        let saturation = hub
            .get_capability_value(&HubCapability::LightSaturation)
            .await
            .unwrap()
            .as_f64()
            .unwrap();
        assert!(hue.abs() < 0.01, "{hue}");
        assert!((saturation - 1.).abs() < 0.01, "{saturation}");
    }

    #[tokio::test]
    async fn from_lan_couples_color_and_kelvin() {
        let status = white_status(5000);
        let update = PushUpdate::from_lan(&status, &[StatusField::Color]);
        k9::assert_equal!(update.color_temperature_kelvin, Some(5000));
        k9::assert_equal!(update.on_off, None);
        k9::assert_equal!(update.brightness, None);

        let update = PushUpdate::from_lan(&status, &[StatusField::Brightness]);
        k9::assert_equal!(
            update,
            PushUpdate {
                brightness: Some(100),
                ..Default::default()
            }
        );
    }

    #[tokio::test]
    async fn cloud_snapshot_applies_to_present_capabilities() {
        let hub = light_hub().await;
        let snapshot: HttpDeviceState = from_json(
            r#"{
                "sku": "H6159",
                "device": "AA:BB",
                "capabilities": [
                    {"type": "devices.capabilities.on_off", "instance": "powerSwitch", "state": {"value": 1}},
                    {"type": "devices.capabilities.range", "instance": "brightness", "state": {"value": 80}},
                    {"type": "devices.capabilities.color_setting", "instance": "colorRgb", "state": {"value": 16711680}},
                    {"type": "devices.capabilities.color_setting", "instance": "colorTemperatureK", "state": {"value": 0}}
                ]
            }"#,
        )
        .unwrap();

        apply_cloud_snapshot(&hub, &snapshot, (2000, 9000))
            .await
            .unwrap();

        k9::assert_equal!(
            hub.get_capability_value(&HubCapability::OnOff).await,
            Some(serde_json::json!(true))
        );
        k9::assert_equal!(
            hub.get_capability_value(&HubCapability::Dim).await,
            Some(serde_json::json!(0.8))
        );
        k9::assert_equal!(
            hub.get_capability_value(&HubCapability::LightMode).await,
            Some(serde_json::json!("color"))
        );
        // 16711680 == 0xff0000
        let hue = hub
            .get_capability_value(&HubCapability::LightHue)
            .await
            .unwrap()
            .as_f64()
            .unwrap();
        assert!(hue.abs() < 0.01, "{hue}");
        k9::assert_equal!(
            hub.get_capability_value(&HubCapability::LightTemperature)
                .await,
            Some(JsonValue::Null)
        );
    }

    #[tokio::test]
    async fn cloud_snapshot_skips_missing_instances() {
        let hub = light_hub().await;
        hub.set_capability_value(&HubCapability::Dim, serde_json::json!(0.4))
            .await
            .unwrap();
        let snapshot: HttpDeviceState = from_json(
            r#"{
                "sku": "H6159",
                "device": "AA:BB",
                "capabilities": [
                    {"type": "devices.capabilities.on_off", "instance": "powerSwitch", "state": {"value": 0}}
                ]
            }"#,
        )
        .unwrap();

        apply_cloud_snapshot(&hub, &snapshot, (2000, 9000))
            .await
            .unwrap();

        k9::assert_equal!(
            hub.get_capability_value(&HubCapability::OnOff).await,
            Some(serde_json::json!(false))
        );
        // brightness was absent from this snapshot
        k9::assert_equal!(
            hub.get_capability_value(&HubCapability::Dim).await,
            Some(serde_json::json!(0.4))
        );
    }

    #[tokio::test]
    async fn domain_validation_rejects_before_dispatch() {
        let state = std::sync::Arc::new(State::new());
        state.device_mut("H6159", "AA:BB").await.set_last_polled();

        let hub = spawn_device(&state, "H6159", "AA:BB").await;
        // allow the task to reconcile the local capability set
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = hub
            .write_capability(&HubCapability::Dim, serde_json::json!(1.5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("outside the 0..1 domain"), "{err:#}");
    }

    #[tokio::test]
    async fn commands_fail_cleanly_with_no_transport() {
        let state = std::sync::Arc::new(State::new());
        state.device_mut("H6159", "AA:BB").await.set_last_polled();

        let hub = spawn_device(&state, "H6159", "AA:BB").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = hub
            .write_capability(&HubCapability::OnOff, serde_json::json!(true))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Unable to control"), "{err:#}");
    }

    #[tokio::test]
    async fn disposal_stops_the_task() {
        let state = std::sync::Arc::new(State::new());
        state.device_mut("H6159", "AA:BB").await.set_last_polled();

        let hub = spawn_device(&state, "H6159", "AA:BB").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(hub.has_capability(&HubCapability::OnOff).await);

        state.remove_device("AA:BB").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // the command channel died with the task; no further writes
        // can reach the device
        let err = hub
            .write_capability(&HubCapability::OnOff, serde_json::json!(true))
            .await
            .unwrap_err();
        assert!(
            err.to_string().contains("command channel is closed")
                || err.to_string().contains("dropped the command"),
            "{err:#}"
        );
    }
}
