use crate::hub::HubDevice;
use crate::platform_api::{CapabilityDescriptor, GoveeApiClient, HttpDeviceInfo};
use async_trait::async_trait;

// Devices paired before the versioned capability descriptor schema
// existed have no descriptor list in their store. The first boot after
// the upgrade resolves it with a single device-list fetch and persists
// the result, so every later boot runs without network I/O. The
// upgrade is one-way: a migrated device never re-fetches its schema
// short of being removed and paired again.

pub const STORE_DEVICE_VERSION: &str = "deviceVersion";
pub const STORE_CAPABILITY_LIST: &str = "capabilityList";

const SCHEMA_V2: &str = "v2";

#[derive(thiserror::Error, Debug)]
pub enum SchemaError {
    #[error(
        "device {0} was not found in the vendor account; \
         its capability schema cannot be resolved"
    )]
    NotInAccount(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Where the one-time device list comes from during an upgrade.
#[async_trait]
pub trait DeviceListSource: Send + Sync {
    async fn device_list(&self) -> anyhow::Result<Vec<HttpDeviceInfo>>;
}

#[async_trait]
impl DeviceListSource for GoveeApiClient {
    async fn device_list(&self) -> anyhow::Result<Vec<HttpDeviceInfo>> {
        self.get_devices().await
    }
}

/// Returns the capability descriptor list for a paired device,
/// upgrading its persisted record on first use.
pub async fn resolve_capability_schema(
    hub: &dyn HubDevice,
    source: &dyn DeviceListSource,
    device_id: &str,
) -> Result<Vec<CapabilityDescriptor>, SchemaError> {
    if let Some(version) = hub.store_get(STORE_DEVICE_VERSION).await {
        if version == serde_json::json!(SCHEMA_V2) {
            let stored = hub
                .store_get(STORE_CAPABILITY_LIST)
                .await
                .ok_or_else(|| anyhow::anyhow!("device {device_id} is marked {SCHEMA_V2} but has no stored capability list"))?;
            let descriptors: Vec<CapabilityDescriptor> = serde_json::from_value(stored)
                .map_err(|err| anyhow::anyhow!("parsing stored capability list: {err}"))?;
            return Ok(descriptors);
        }
    }

    log::info!("Device {device_id} needs a capability schema upgrade, fetching the device list");
    let devices = source.device_list().await?;
    let info = devices
        .into_iter()
        .find(|d| d.device == device_id)
        .ok_or_else(|| SchemaError::NotInAccount(device_id.to_string()))?;

    hub.store_set(
        STORE_CAPABILITY_LIST,
        serde_json::to_value(&info.capabilities).map_err(anyhow::Error::from)?,
    )
    .await?;
    hub.store_set(STORE_DEVICE_VERSION, serde_json::json!(SCHEMA_V2))
        .await?;

    Ok(info.capabilities)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hub::MemoryHub;
    use crate::platform_api::from_json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        devices: Vec<HttpDeviceInfo>,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl DeviceListSource for CountingSource {
        async fn device_list(&self) -> anyhow::Result<Vec<HttpDeviceInfo>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.devices.clone())
        }
    }

    fn device_info(id: &str) -> HttpDeviceInfo {
        from_json(format!(
            r#"{{
                "sku": "H6159",
                "device": "{id}",
                "deviceName": "Strip",
                "type": "devices.types.light",
                "capabilities": [
                    {{
                        "type": "devices.capabilities.on_off",
                        "instance": "powerSwitch",
                        "parameters": null,
                        "alarmType": null,
                        "eventState": null
                    }}
                ]
            }}"#
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn upgrade_fetches_exactly_once() {
        let hub = MemoryHub::new("AA:BB");
        let source = CountingSource {
            devices: vec![device_info("AA:BB")],
            fetches: AtomicUsize::new(0),
        };

        let descriptors = resolve_capability_schema(&hub, &source, "AA:BB")
            .await
            .unwrap();
        k9::assert_equal!(descriptors.len(), 1);
        k9::assert_equal!(source.fetches.load(Ordering::SeqCst), 1);
        k9::assert_equal!(
            hub.store_get(STORE_DEVICE_VERSION).await,
            Some(serde_json::json!("v2"))
        );

        // every later resolution is store-only
        let descriptors = resolve_capability_schema(&hub, &source, "AA:BB")
            .await
            .unwrap();
        k9::assert_equal!(descriptors.len(), 1);
        k9::assert_equal!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_device_is_an_error() {
        let hub = MemoryHub::new("CC:DD");
        let source = CountingSource {
            devices: vec![device_info("AA:BB")],
            fetches: AtomicUsize::new(0),
        };

        let err = resolve_capability_schema(&hub, &source, "CC:DD")
            .await
            .unwrap_err();
        assert!(matches!(err, SchemaError::NotInAccount(_)));
        // nothing was persisted; the device stays unresolved
        k9::assert_equal!(hub.store_get(STORE_DEVICE_VERSION).await, None);
    }
}
