use crate::lan_api::LanDevice;
use crate::platform_api::{DeviceType, HttpDeviceInfo};
use crate::service::quirks::{resolve_quirk, DEFAULT_COLOR_TEMP_RANGE};
use chrono::{DateTime, Utc};

/// Everything the bridge knows about one paired device, aggregated
/// across the protocols that have seen it.
#[derive(Default, Clone, Debug)]
pub struct Device {
    pub sku: String,
    pub id: String,

    /// Name assigned via the vendor app
    pub vendor_name: Option<String>,

    pub device_type: DeviceType,

    /// Cloud metadata, when the device is known to the account
    pub http_device_info: Option<HttpDeviceInfo>,

    /// LAN presence, found via discovery
    pub lan_device: Option<LanDevice>,
    pub last_lan_device_update: Option<DateTime<Utc>>,

    pub last_polled: Option<DateTime<Utc>>,
}

impl Device {
    /// Create a new device given just its sku and id.
    /// No other facts are known or reflected by it at this time;
    /// they will need to be added by the caller.
    pub fn new<S: Into<String>, I: Into<String>>(sku: S, id: I) -> Self {
        Self {
            sku: sku.into(),
            id: id.into(),
            ..Self::default()
        }
    }

    /// Returns the device name; either the name assigned in the vendor
    /// app, or a name computed from the SKU and the tail of the id.
    pub fn name(&self) -> String {
        match &self.vendor_name {
            Some(name) => name.to_string(),
            None => self.computed_name(),
        }
    }

    /// Compute a name from the SKU and the last couple of bytes from
    /// the device id, similar to the default name the vendor app shows
    /// for an unconfigured device.
    pub fn computed_name(&self) -> String {
        let tail = if self.id.len() > 18 {
            &self.id[18..]
        } else {
            self.id.as_str()
        };
        let mut name = format!("{}_{}", self.sku, tail);
        name.retain(|c| c != ':');
        name
    }

    pub fn set_http_device_info(&mut self, info: HttpDeviceInfo) {
        if !info.device_name.is_empty() {
            self.vendor_name.replace(info.device_name.to_string());
        }
        self.device_type = info.device_type;
        self.http_device_info.replace(info);
    }

    pub fn set_lan_device(&mut self, device: LanDevice) {
        self.lan_device.replace(device);
        self.last_lan_device_update.replace(Utc::now());
    }

    pub fn set_last_polled(&mut self) {
        self.last_polled.replace(Utc::now());
    }

    /// Tag for namespacing device-type-scoped hub capabilities
    pub fn type_tag(&self) -> &'static str {
        self.device_type.tag()
    }

    /// The kelvin range used to normalize color temperature values:
    /// the advertised descriptor range when the cloud knows the
    /// device, the quirk table otherwise, the app-wide default as a
    /// last resort.
    pub fn color_temp_range(&self) -> (u32, u32) {
        if let Some(info) = &self.http_device_info {
            if let Some(range) = info.get_color_temperature_range() {
                return range;
            }
        }
        resolve_quirk(&self.sku)
            .map(|q| q.color_temp_range)
            .unwrap_or(DEFAULT_COLOR_TEMP_RANGE)
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{} ({} {})", self.name(), self.sku, self.id)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn name_compute() {
        let device = Device::new("H6000", "AA:BB:CC:DD:EE:FF:42:2A");
        k9::assert_equal!(device.name(), "H6000_422A");
    }

    #[test]
    fn name_compute_short_id() {
        let device = Device::new("H6000", "shortid");
        k9::assert_equal!(device.name(), "H6000_shortid");
    }

    #[test]
    fn temp_range_fallback() {
        let device = Device::new("H9999", "AA:BB:CC:DD:EE:FF:42:2A");
        k9::assert_equal!(device.color_temp_range(), DEFAULT_COLOR_TEMP_RANGE);
    }
}
