use once_cell::sync::Lazy;
use std::borrow::Cow;
use std::collections::HashMap;

/// The LAN protocol doesn't report a color temperature range; this is
/// the range the vendor app assumes for LAN-only control.
pub const DEFAULT_COLOR_TEMP_RANGE: (u32, u32) = (2000, 9000);

/// Per-SKU facts that are not discoverable through the APIs.
/// Category-specific behavior lives here as data; there is exactly one
/// device implementation regardless of SKU.
#[derive(Clone, Debug)]
pub struct Quirk {
    pub sku: Cow<'static, str>,
    pub lan_api_capable: bool,
    pub color_temp_range: (u32, u32),
}

impl Quirk {
    pub fn light<SKU: Into<Cow<'static, str>>>(sku: SKU) -> Self {
        Quirk {
            sku: sku.into(),
            lan_api_capable: false,
            color_temp_range: DEFAULT_COLOR_TEMP_RANGE,
        }
    }

    pub fn with_lan_api(mut self) -> Self {
        self.lan_api_capable = true;
        self
    }

    pub fn lan_api_capable_light(sku: &'static str) -> Self {
        Self::light(sku).with_lan_api()
    }
}

static QUIRKS: Lazy<HashMap<String, Quirk>> = Lazy::new(load_quirks);

fn load_quirks() -> HashMap<String, Quirk> {
    let mut map = HashMap::new();
    for quirk in [
        // Lights from the list of LAN API enabled devices
        // at <https://app-h5.govee.com/user-manual/wlan-guide>
        Quirk::lan_api_capable_light("H6046"),
        Quirk::lan_api_capable_light("H6054"),
        Quirk::lan_api_capable_light("H6072"),
        Quirk::lan_api_capable_light("H610A"),
        Quirk::lan_api_capable_light("H6117"),
        Quirk::lan_api_capable_light("H6144"),
        Quirk::lan_api_capable_light("H615A"),
        Quirk::lan_api_capable_light("H615C"),
        Quirk::lan_api_capable_light("H6159"),
        Quirk::lan_api_capable_light("H618A"),
        Quirk::lan_api_capable_light("H619A"),
        Quirk::lan_api_capable_light("H619B"),
        Quirk::lan_api_capable_light("H619C"),
        Quirk::lan_api_capable_light("H61A2"),
        Quirk::lan_api_capable_light("H7060"),
        Quirk::light("H6143"),
        Quirk::light("H6199"),
        Quirk::light("H6602"),
    ] {
        map.insert(quirk.sku.to_string(), quirk);
    }

    map
}

pub fn resolve_quirk(sku: &str) -> Option<&'static Quirk> {
    QUIRKS.get(sku)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lookup() {
        assert!(resolve_quirk("H619C").unwrap().lan_api_capable);
        assert!(!resolve_quirk("H6199").unwrap().lan_api_capable);
        assert!(resolve_quirk("H0000").is_none());
    }
}
