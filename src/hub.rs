use crate::catalog::HubCapability;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::{mpsc, oneshot};

// The hub runtime contract. The reconciliation engine and the refresh
// engine only ever talk to a device through this trait; the service
// binary backs it with the in-memory implementation below, which is
// also what the tests drive.

/// An inbound capability write originating from the hub user.
/// The reply channel resolves with the outcome so that the hub can
/// surface a rejected command.
pub struct CapabilityWrite {
    pub capability: HubCapability,
    pub value: JsonValue,
    pub reply: oneshot::Sender<anyhow::Result<()>>,
}

/// Listener installed for a capability; always replaced wholesale when
/// the device is reconciled, never patched.
pub type CapabilityListener = mpsc::Sender<CapabilityWrite>;

/// UI metadata for capabilities whose value domain is only known at
/// runtime (scene sliders).
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityOptions {
    pub title: String,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    pub decimals: u32,
}

impl CapabilityOptions {
    /// Slider over the positions of a scene option list.
    pub fn scene_slider<T: Into<String>>(title: T, option_count: usize) -> Self {
        Self {
            title: title.into(),
            min: 0.,
            max: option_count.saturating_sub(1) as f64,
            step: 1.,
            decimals: 0,
        }
    }
}

#[async_trait]
pub trait HubDevice: Send + Sync {
    fn id(&self) -> &str;

    async fn capabilities(&self) -> BTreeSet<HubCapability>;
    async fn has_capability(&self, cap: &HubCapability) -> bool;
    async fn add_capability(&self, cap: &HubCapability) -> anyhow::Result<()>;
    async fn remove_capability(&self, cap: &HubCapability) -> anyhow::Result<()>;

    async fn get_capability_value(&self, cap: &HubCapability) -> Option<JsonValue>;
    async fn set_capability_value(
        &self,
        cap: &HubCapability,
        value: JsonValue,
    ) -> anyhow::Result<()>;
    async fn set_capability_options(
        &self,
        cap: &HubCapability,
        options: &CapabilityOptions,
    ) -> anyhow::Result<()>;
    async fn set_capability_listener(
        &self,
        cap: &HubCapability,
        listener: CapabilityListener,
    ) -> anyhow::Result<()>;

    /// Per-device persisted key/value store
    async fn store_get(&self, key: &str) -> Option<JsonValue>;
    async fn store_set(&self, key: &str, value: JsonValue) -> anyhow::Result<()>;

    async fn set_available(&self);
    async fn set_unavailable(&self, reason: &str);
}

#[derive(Default)]
struct HubInner {
    capabilities: BTreeSet<HubCapability>,
    values: HashMap<HubCapability, JsonValue>,
    options: HashMap<HubCapability, CapabilityOptions>,
    listeners: HashMap<HubCapability, CapabilityListener>,
    store: HashMap<String, JsonValue>,
    unavailable_reason: Option<String>,
    adds: usize,
    removes: usize,
}

/// In-memory hub device. Interior mutability is synchronous; none of
/// the accessors hold the lock across an await point.
pub struct MemoryHub {
    id: String,
    inner: Mutex<HubInner>,
}

impl MemoryHub {
    pub fn new<I: Into<String>>(id: I) -> Self {
        Self {
            id: id.into(),
            inner: Mutex::new(HubInner::default()),
        }
    }

    /// Routes a capability write through the currently installed
    /// listener and awaits the outcome, the way the hub delivers a
    /// user action to the device.
    pub async fn write_capability(
        &self,
        cap: &HubCapability,
        value: JsonValue,
    ) -> anyhow::Result<()> {
        let listener = {
            let inner = self.inner.lock();
            if !inner.capabilities.contains(cap) {
                anyhow::bail!("device {} has no capability {cap}", self.id);
            }
            inner
                .listeners
                .get(cap)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("capability {cap} has no listener"))?
        };

        let (tx, rx) = oneshot::channel();
        listener
            .send(CapabilityWrite {
                capability: cap.clone(),
                value,
                reply: tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("device {} command channel is closed", self.id))?;

        rx.await
            .map_err(|_| anyhow::anyhow!("device {} dropped the command", self.id))?
    }

    pub fn capability_values(&self) -> Vec<(HubCapability, JsonValue)> {
        let inner = self.inner.lock();
        inner
            .capabilities
            .iter()
            .map(|cap| {
                (
                    cap.clone(),
                    inner.values.get(cap).cloned().unwrap_or(JsonValue::Null),
                )
            })
            .collect()
    }

    #[cfg(test)]
    pub fn capability_options(&self, cap: &HubCapability) -> Option<CapabilityOptions> {
        self.inner.lock().options.get(cap).cloned()
    }

    pub fn unavailable_reason(&self) -> Option<String> {
        self.inner.lock().unavailable_reason.clone()
    }

    /// Cumulative (add, remove) structural operation counts.
    #[cfg(test)]
    pub fn op_counts(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.adds, inner.removes)
    }
}

#[async_trait]
impl HubDevice for MemoryHub {
    fn id(&self) -> &str {
        &self.id
    }

    async fn capabilities(&self) -> BTreeSet<HubCapability> {
        self.inner.lock().capabilities.clone()
    }

    async fn has_capability(&self, cap: &HubCapability) -> bool {
        self.inner.lock().capabilities.contains(cap)
    }

    async fn add_capability(&self, cap: &HubCapability) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        inner.capabilities.insert(cap.clone());
        inner.adds += 1;
        Ok(())
    }

    async fn remove_capability(&self, cap: &HubCapability) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        inner.capabilities.remove(cap);
        inner.values.remove(cap);
        inner.options.remove(cap);
        inner.listeners.remove(cap);
        inner.removes += 1;
        Ok(())
    }

    async fn get_capability_value(&self, cap: &HubCapability) -> Option<JsonValue> {
        self.inner.lock().values.get(cap).cloned()
    }

    async fn set_capability_value(
        &self,
        cap: &HubCapability,
        value: JsonValue,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        if !inner.capabilities.contains(cap) {
            anyhow::bail!("device {} has no capability {cap}", self.id);
        }
        inner.values.insert(cap.clone(), value);
        Ok(())
    }

    async fn set_capability_options(
        &self,
        cap: &HubCapability,
        options: &CapabilityOptions,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        if !inner.capabilities.contains(cap) {
            anyhow::bail!("device {} has no capability {cap}", self.id);
        }
        inner.options.insert(cap.clone(), options.clone());
        Ok(())
    }

    async fn set_capability_listener(
        &self,
        cap: &HubCapability,
        listener: CapabilityListener,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        if !inner.capabilities.contains(cap) {
            anyhow::bail!("device {} has no capability {cap}", self.id);
        }
        // last registration wins; stale listeners must not linger
        inner.listeners.insert(cap.clone(), listener);
        Ok(())
    }

    async fn store_get(&self, key: &str) -> Option<JsonValue> {
        self.inner.lock().store.get(key).cloned()
    }

    async fn store_set(&self, key: &str, value: JsonValue) -> anyhow::Result<()> {
        self.inner.lock().store.insert(key.to_string(), value);
        Ok(())
    }

    async fn set_available(&self) {
        self.inner.lock().unavailable_reason.take();
    }

    async fn set_unavailable(&self, reason: &str) {
        self.inner
            .lock()
            .unavailable_reason
            .replace(reason.to_string());
    }
}
