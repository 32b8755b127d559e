use crate::platform_api::{CapabilityDescriptor, HttpDeviceState};
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;

// Maps the vendor's capability descriptor list onto the set of hub
// capabilities that must exist on the device. This is the single
// source of truth for that mapping: the reconciler diffs its output
// against the live device, and the refresh engine uses it to locate
// snapshot fields.

/// A hub-side capability identifier. Device-type-scoped capabilities
/// (scenes, toggles) carry the device type tag so that a hub entity
/// hosting multiple logical device types does not collide.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HubCapability {
    OnOff,
    Dim,
    LightHue,
    LightSaturation,
    LightTemperature,
    LightMode,
    LightScenes(String),
    LightDiyScenes(String),
    NightlightScenes(String),
    Snapshots(String),
    MusicMode(String),
    DreamViewToggle(String),
    SegmentControlColor(String),
    SegmentControlBrightness(String),
}

impl std::fmt::Display for HubCapability {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::OnOff => write!(fmt, "onoff"),
            Self::Dim => write!(fmt, "dim"),
            Self::LightHue => write!(fmt, "light_hue"),
            Self::LightSaturation => write!(fmt, "light_saturation"),
            Self::LightTemperature => write!(fmt, "light_temperature"),
            Self::LightMode => write!(fmt, "light_mode"),
            Self::LightScenes(tag) => write!(fmt, "lightScenes.{tag}"),
            Self::LightDiyScenes(tag) => write!(fmt, "lightDiyScenes.{tag}"),
            Self::NightlightScenes(tag) => write!(fmt, "nightlightScenes.{tag}"),
            Self::Snapshots(tag) => write!(fmt, "snapshots.{tag}"),
            Self::MusicMode(tag) => write!(fmt, "musicMode.{tag}"),
            Self::DreamViewToggle(tag) => write!(fmt, "dreamViewToggle.{tag}"),
            Self::SegmentControlColor(tag) => write!(fmt, "segmentControlColor.{tag}"),
            Self::SegmentControlBrightness(tag) => {
                write!(fmt, "segmentControlBrightness.{tag}")
            }
        }
    }
}

impl std::str::FromStr for HubCapability {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "onoff" => return Ok(Self::OnOff),
            "dim" => return Ok(Self::Dim),
            "light_hue" => return Ok(Self::LightHue),
            "light_saturation" => return Ok(Self::LightSaturation),
            "light_temperature" => return Ok(Self::LightTemperature),
            "light_mode" => return Ok(Self::LightMode),
            _ => {}
        }
        if let Some((name, tag)) = s.split_once('.') {
            let tag = tag.to_string();
            return match name {
                "lightScenes" => Ok(Self::LightScenes(tag)),
                "lightDiyScenes" => Ok(Self::LightDiyScenes(tag)),
                "nightlightScenes" => Ok(Self::NightlightScenes(tag)),
                "snapshots" => Ok(Self::Snapshots(tag)),
                "musicMode" => Ok(Self::MusicMode(tag)),
                "dreamViewToggle" => Ok(Self::DreamViewToggle(tag)),
                "segmentControlColor" => Ok(Self::SegmentControlColor(tag)),
                "segmentControlBrightness" => Ok(Self::SegmentControlBrightness(tag)),
                _ => anyhow::bail!("unknown capability id {s}"),
            };
        }
        anyhow::bail!("unknown capability id {s}")
    }
}

impl HubCapability {
    /// For capabilities that store a positional index into a scene
    /// option list, the vendor instance that activates the scene.
    pub fn scene_instance(&self) -> Option<&'static str> {
        match self {
            Self::LightScenes(_) => Some("lightScene"),
            Self::LightDiyScenes(_) => Some("diyScene"),
            Self::NightlightScenes(_) => Some("nightlightScene"),
            Self::Snapshots(_) => Some("snapshot"),
            _ => None,
        }
    }

    /// Toggle-style capabilities map to a vendor toggle instance.
    pub fn toggle_instance(&self) -> Option<&'static str> {
        match self {
            Self::DreamViewToggle(_) => Some("dreamViewToggle"),
            _ => None,
        }
    }
}

fn has_instance(descriptors: &[CapabilityDescriptor], instance: &str) -> bool {
    descriptors.iter().any(|d| d.instance == instance)
}

/// Computes the full set of hub capabilities that must exist for the
/// given descriptor list. Pure and deterministic; unknown instances
/// are ignored so that new vendor capabilities don't break existing
/// devices.
pub fn desired_hub_capabilities(
    descriptors: &[CapabilityDescriptor],
    device_type_tag: &str,
) -> BTreeSet<HubCapability> {
    let tag = device_type_tag;
    let mut wanted = BTreeSet::new();

    for d in descriptors {
        match d.instance.as_str() {
            "powerSwitch" => {
                wanted.insert(HubCapability::OnOff);
            }
            "brightness" => {
                wanted.insert(HubCapability::Dim);
            }
            "colorRgb" => {
                wanted.insert(HubCapability::LightHue);
                wanted.insert(HubCapability::LightSaturation);
            }
            "colorTemperatureK" => {
                wanted.insert(HubCapability::LightTemperature);
            }
            "lightScene" => {
                wanted.insert(HubCapability::LightScenes(tag.to_string()));
            }
            "diyScene" => {
                wanted.insert(HubCapability::LightDiyScenes(tag.to_string()));
            }
            "nightlightScene" => {
                wanted.insert(HubCapability::NightlightScenes(tag.to_string()));
            }
            "snapshot" => {
                wanted.insert(HubCapability::Snapshots(tag.to_string()));
            }
            "musicMode" => {
                wanted.insert(HubCapability::MusicMode(tag.to_string()));
            }
            "dreamViewToggle" => {
                wanted.insert(HubCapability::DreamViewToggle(tag.to_string()));
            }
            "segmentedColorRgb" => {
                wanted.insert(HubCapability::SegmentControlColor(tag.to_string()));
            }
            "segmentedBrightness" => {
                wanted.insert(HubCapability::SegmentControlBrightness(tag.to_string()));
            }
            _ => {}
        }
    }

    // The mode switch only makes sense when both interpretations of
    // the light state exist on the device
    if has_instance(descriptors, "colorRgb") && has_instance(descriptors, "colorTemperatureK") {
        wanted.insert(HubCapability::LightMode);
    }

    wanted
}

/// Locates the state value reported for `instance` in a snapshot.
/// Vendors omit instances from individual snapshots; absence means
/// "no update this cycle", not an error.
pub fn find_instance<'a>(snapshot: &'a HttpDeviceState, instance: &str) -> Option<&'a JsonValue> {
    snapshot
        .capabilities
        .iter()
        .find(|c| c.instance == instance)
        .map(|c| &c.state.value)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::platform_api::{CapabilityKind, CapabilityState, CapabilityStateEntry};

    fn descriptor(instance: &str) -> CapabilityDescriptor {
        let kind = match instance {
            "powerSwitch" => CapabilityKind::OnOff,
            "brightness" => CapabilityKind::Range,
            "colorRgb" | "colorTemperatureK" => CapabilityKind::ColorSetting,
            "lightScene" | "diyScene" | "snapshot" => CapabilityKind::DynamicScene,
            "musicMode" => CapabilityKind::MusicSetting,
            _ => CapabilityKind::Toggle,
        };
        CapabilityDescriptor {
            kind,
            instance: instance.to_string(),
            parameters: None,
            alarm_type: None,
            event_state: None,
        }
    }

    fn names(set: &BTreeSet<HubCapability>) -> Vec<String> {
        set.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn full_color_light() {
        let descriptors = vec![
            descriptor("powerSwitch"),
            descriptor("brightness"),
            descriptor("colorRgb"),
            descriptor("colorTemperatureK"),
        ];
        let mut wanted = names(&desired_hub_capabilities(&descriptors, "light"));
        wanted.sort();
        k9::assert_equal!(
            wanted,
            vec![
                "dim",
                "light_hue",
                "light_mode",
                "light_saturation",
                "light_temperature",
                "onoff",
            ]
        );
    }

    #[test]
    fn dropping_temperature_drops_mode() {
        let descriptors = vec![
            descriptor("powerSwitch"),
            descriptor("brightness"),
            descriptor("colorRgb"),
        ];
        let wanted = desired_hub_capabilities(&descriptors, "light");
        assert!(!wanted.contains(&HubCapability::LightTemperature));
        assert!(!wanted.contains(&HubCapability::LightMode));
        assert!(wanted.contains(&HubCapability::OnOff));
        assert!(wanted.contains(&HubCapability::Dim));
        assert!(wanted.contains(&HubCapability::LightHue));
        assert!(wanted.contains(&HubCapability::LightSaturation));
    }

    #[test]
    fn scoped_capabilities_take_the_tag() {
        let descriptors = vec![descriptor("lightScene"), descriptor("dreamViewToggle")];
        let wanted = names(&desired_hub_capabilities(&descriptors, "light"));
        assert!(wanted.contains(&"lightScenes.light".to_string()));
        assert!(wanted.contains(&"dreamViewToggle.light".to_string()));
    }

    #[test]
    fn unknown_instances_are_ignored() {
        let descriptors = vec![descriptor("powerSwitch"), descriptor("gradientToggle2077")];
        let wanted = desired_hub_capabilities(&descriptors, "light");
        k9::assert_equal!(wanted.len(), 1);
    }

    #[test]
    fn deterministic() {
        let descriptors = vec![
            descriptor("colorTemperatureK"),
            descriptor("colorRgb"),
            descriptor("powerSwitch"),
        ];
        k9::assert_equal!(
            desired_hub_capabilities(&descriptors, "light"),
            desired_hub_capabilities(&descriptors, "light")
        );
    }

    #[test]
    fn capability_ids_round_trip() {
        for cap in [
            HubCapability::OnOff,
            HubCapability::LightMode,
            HubCapability::LightScenes("light".to_string()),
            HubCapability::MusicMode("socket".to_string()),
        ] {
            let parsed: HubCapability = cap.to_string().parse().unwrap();
            k9::assert_equal!(parsed, cap);
        }
        assert!("wobble".parse::<HubCapability>().is_err());
    }

    #[test]
    fn find_instance_tolerates_absence() {
        let snapshot = HttpDeviceState {
            sku: "H6159".to_string(),
            device: "AA:BB".to_string(),
            capabilities: vec![CapabilityStateEntry {
                kind: CapabilityKind::Range,
                instance: "brightness".to_string(),
                state: CapabilityState {
                    value: serde_json::json!(42),
                },
            }],
        };
        k9::assert_equal!(
            find_instance(&snapshot, "brightness"),
            Some(&serde_json::json!(42))
        );
        k9::assert_equal!(find_instance(&snapshot, "powerSwitch"), None);
    }
}
