use crate::catalog::{desired_hub_capabilities, HubCapability};
use crate::hub::{CapabilityListener, CapabilityOptions, HubDevice};
use crate::platform_api::{
    CapabilityDescriptor, CapabilityParameters, EnumOption, GoveeApiClient, HttpDeviceInfo,
};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;

// Makes the hub device's live capability set match the set implied by
// the vendor descriptor list. The whole pass is a desired-vs-actual
// diff, so running it again with the same descriptors is a no-op, and
// a descriptor list that lost an instance tears the matching
// capability down.

/// Runtime route for one capability; rebuilt wholesale on every
/// reconcile, never patched in place.
#[derive(Debug, Clone, Default)]
pub struct CapabilityBinding {
    /// Loaded option list for scene-style capabilities. The hub-side
    /// value is a positional index into this vec.
    pub options: Vec<EnumOption>,
}

#[derive(Debug, Default)]
pub struct BindingSet {
    bindings: HashMap<HubCapability, CapabilityBinding>,
}

impl BindingSet {
    pub fn scene_options(&self, cap: &HubCapability) -> Option<&[EnumOption]> {
        self.bindings.get(cap).map(|b| b.options.as_slice())
    }

    /// Resolves a stored positional index to the vendor value it
    /// currently denotes.
    pub fn scene_value_at(&self, cap: &HubCapability, index: usize) -> Option<&EnumOption> {
        self.bindings.get(cap).and_then(|b| b.options.get(index))
    }
}

/// Where dynamic option lists come from when a descriptor doesn't
/// embed them.
#[async_trait]
pub trait SceneSource: Send + Sync {
    async fn scene_options(&self, instance: &str) -> anyhow::Result<Vec<EnumOption>>;
}

/// Cloud-backed scene source.
pub struct PlatformSceneSource<'a> {
    pub client: &'a GoveeApiClient,
    pub device: &'a HttpDeviceInfo,
}

#[async_trait]
impl SceneSource for PlatformSceneSource<'_> {
    async fn scene_options(&self, instance: &str) -> anyhow::Result<Vec<EnumOption>> {
        let caps = match instance {
            "lightScene" => self.client.get_device_scenes(self.device).await?,
            "diyScene" => self.client.get_device_diy_scenes(self.device).await?,
            // nightlight scenes and snapshots are only ever embedded
            // in the descriptor itself
            _ => return Ok(vec![]),
        };
        let mut options = vec![];
        for cap in caps {
            if cap.instance == instance {
                options.extend(cap.enum_options().iter().cloned());
            }
        }
        Ok(options)
    }
}

/// Scene source for devices with no cloud presence.
pub struct NoScenes;

#[async_trait]
impl SceneSource for NoScenes {
    async fn scene_options(&self, _instance: &str) -> anyhow::Result<Vec<EnumOption>> {
        Ok(vec![])
    }
}

fn descriptor_by_instance<'a>(
    descriptors: &'a [CapabilityDescriptor],
    instance: &str,
) -> Option<&'a CapabilityDescriptor> {
    descriptors.iter().find(|d| d.instance == instance)
}

/// The options a descriptor itself carries. Music modes nest their
/// option list inside a struct field.
fn embedded_options(descriptor: &CapabilityDescriptor) -> Vec<EnumOption> {
    match &descriptor.parameters {
        Some(CapabilityParameters::Enum { options }) => options.clone(),
        Some(CapabilityParameters::Struct { fields }) => {
            for field in fields {
                if field.field_name == "musicMode" {
                    if let CapabilityParameters::Enum { options } = &field.field_type {
                        return options.clone();
                    }
                }
            }
            vec![]
        }
        _ => vec![],
    }
}

/// Which vendor instance supplies the option list for an
/// option-backed capability.
fn option_instance(cap: &HubCapability) -> Option<&'static str> {
    if let Some(instance) = cap.scene_instance() {
        return Some(instance);
    }
    match cap {
        HubCapability::MusicMode(_) => Some("musicMode"),
        _ => None,
    }
}

fn option_title(cap: &HubCapability) -> &'static str {
    match cap {
        HubCapability::LightScenes(_) => "Light Scenes",
        HubCapability::LightDiyScenes(_) => "DIY Scenes",
        HubCapability::NightlightScenes(_) => "Nightlight Scenes",
        HubCapability::Snapshots(_) => "Snapshots",
        HubCapability::MusicMode(_) => "Music Modes",
        _ => "",
    }
}

async fn resolve_options(
    cap: &HubCapability,
    descriptors: &[CapabilityDescriptor],
    scenes: &dyn SceneSource,
) -> anyhow::Result<Vec<EnumOption>> {
    let instance = option_instance(cap).expect("option-backed capability");
    let embedded = descriptor_by_instance(descriptors, instance)
        .map(embedded_options)
        .unwrap_or_default();
    if !embedded.is_empty() {
        return Ok(embedded);
    }
    scenes.scene_options(instance).await
}

/// Reconciles the hub device's capability set against `descriptors`
/// and installs fresh listener bindings. Idempotent; safe to call on
/// every device boot and after every descriptor-list refresh.
pub async fn reconcile(
    hub: &dyn HubDevice,
    descriptors: &[CapabilityDescriptor],
    device_type_tag: &str,
    scenes: &dyn SceneSource,
    listener: CapabilityListener,
) -> anyhow::Result<BindingSet> {
    let desired = desired_hub_capabilities(descriptors, device_type_tag);
    let actual = hub.capabilities().await;

    let mut bindings = BindingSet::default();

    for cap in &desired {
        if option_instance(cap).is_some() {
            // Option-backed capabilities only exist when a usable
            // option list does; a failure to load one list must not
            // take down the rest of the reconcile.
            let options = match resolve_options(cap, descriptors, scenes).await {
                Ok(options) => options,
                Err(err) => {
                    log::warn!("loading options for {cap} on {}: {err:#}", hub.id());
                    if hub.has_capability(cap).await {
                        hub.remove_capability(cap).await?;
                    }
                    continue;
                }
            };

            if options.is_empty() {
                // a control with nothing to select always fails;
                // don't expose it
                if hub.has_capability(cap).await {
                    hub.remove_capability(cap).await?;
                }
                continue;
            }

            if !hub.has_capability(cap).await {
                hub.add_capability(cap).await?;
            }
            hub.set_capability_options(
                cap,
                &CapabilityOptions::scene_slider(option_title(cap), options.len()),
            )
            .await?;
            // any previously stored index referred to an option list
            // that may no longer exist
            hub.set_capability_value(cap, JsonValue::Null).await?;
            bindings
                .bindings
                .insert(cap.clone(), CapabilityBinding { options });
        } else if !hub.has_capability(cap).await {
            hub.add_capability(cap).await?;
        }
    }

    for cap in &actual {
        if !desired.contains(cap) {
            hub.remove_capability(cap).await?;
        }
    }

    // Re-bind everything that survived. Listener identity is not
    // preserved across reconciles: the previous binding may belong to
    // a torn-down device object.
    for cap in hub.capabilities().await {
        hub.set_capability_listener(&cap, listener.clone()).await?;
    }

    Ok(bindings)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hub::MemoryHub;
    use crate::platform_api::CapabilityKind;
    use tokio::sync::mpsc;

    fn descriptor(instance: &str) -> CapabilityDescriptor {
        CapabilityDescriptor {
            kind: CapabilityKind::OnOff,
            instance: instance.to_string(),
            parameters: None,
            alarm_type: None,
            event_state: None,
        }
    }

    fn scene_descriptor(instance: &str, names: &[&str]) -> CapabilityDescriptor {
        CapabilityDescriptor {
            kind: CapabilityKind::DynamicScene,
            instance: instance.to_string(),
            parameters: Some(CapabilityParameters::Enum {
                options: names
                    .iter()
                    .enumerate()
                    .map(|(i, name)| EnumOption {
                        name: name.to_string(),
                        value: serde_json::json!(i + 100),
                        extras: Default::default(),
                    })
                    .collect(),
            }),
            alarm_type: None,
            event_state: None,
        }
    }

    fn listener() -> CapabilityListener {
        let (tx, _rx) = mpsc::channel(4);
        tx
    }

    fn light_descriptors() -> Vec<CapabilityDescriptor> {
        vec![
            descriptor("powerSwitch"),
            descriptor("brightness"),
            descriptor("colorRgb"),
            descriptor("colorTemperatureK"),
            scene_descriptor("lightScene", &["Sunrise", "Sunset"]),
        ]
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let hub = MemoryHub::new("AA:BB");
        let descriptors = light_descriptors();

        reconcile(&hub, &descriptors, "light", &NoScenes, listener())
            .await
            .unwrap();
        let after_first = hub.op_counts();
        k9::assert_equal!(after_first, (7, 0));

        reconcile(&hub, &descriptors, "light", &NoScenes, listener())
            .await
            .unwrap();
        k9::assert_equal!(hub.op_counts(), after_first);
    }

    #[tokio::test]
    async fn dropping_a_descriptor_removes_its_capabilities() {
        let hub = MemoryHub::new("AA:BB");
        reconcile(&hub, &light_descriptors(), "light", &NoScenes, listener())
            .await
            .unwrap();

        let shrunk: Vec<CapabilityDescriptor> = light_descriptors()
            .into_iter()
            .filter(|d| d.instance != "colorTemperatureK")
            .collect();
        reconcile(&hub, &shrunk, "light", &NoScenes, listener())
            .await
            .unwrap();

        assert!(!hub.has_capability(&HubCapability::LightTemperature).await);
        assert!(!hub.has_capability(&HubCapability::LightMode).await);
        assert!(hub.has_capability(&HubCapability::OnOff).await);
        assert!(hub.has_capability(&HubCapability::Dim).await);
        assert!(hub.has_capability(&HubCapability::LightHue).await);
        assert!(hub.has_capability(&HubCapability::LightSaturation).await);
    }

    #[tokio::test]
    async fn empty_scene_list_is_not_exposed() {
        let hub = MemoryHub::new("AA:BB");
        let descriptors = vec![descriptor("powerSwitch"), scene_descriptor("lightScene", &[])];

        reconcile(&hub, &descriptors, "light", &NoScenes, listener())
            .await
            .unwrap();

        assert!(!hub
            .has_capability(&HubCapability::LightScenes("light".to_string()))
            .await);
        assert!(hub.has_capability(&HubCapability::OnOff).await);
    }

    #[tokio::test]
    async fn scene_fetch_failure_only_skips_that_capability() {
        struct FailingScenes;
        #[async_trait]
        impl SceneSource for FailingScenes {
            async fn scene_options(&self, instance: &str) -> anyhow::Result<Vec<EnumOption>> {
                anyhow::bail!("scene list for {instance} unavailable")
            }
        }

        let hub = MemoryHub::new("AA:BB");
        let descriptors = vec![
            descriptor("powerSwitch"),
            // no embedded options: must hit the failing source
            scene_descriptor("lightScene", &[]),
            // embedded options: must survive
            scene_descriptor("diyScene", &["My Scene"]),
        ];

        reconcile(&hub, &descriptors, "light", &FailingScenes, listener())
            .await
            .unwrap();

        assert!(!hub
            .has_capability(&HubCapability::LightScenes("light".to_string()))
            .await);
        assert!(hub
            .has_capability(&HubCapability::LightDiyScenes("light".to_string()))
            .await);
        assert!(hub.has_capability(&HubCapability::OnOff).await);
    }

    #[tokio::test]
    async fn scene_slider_options_follow_the_list() {
        let hub = MemoryHub::new("AA:BB");
        let descriptors = vec![scene_descriptor("lightScene", &["Sunrise", "Sunset", "Aurora"])];
        let cap = HubCapability::LightScenes("light".to_string());

        let bindings = reconcile(&hub, &descriptors, "light", &NoScenes, listener())
            .await
            .unwrap();

        let options = hub.capability_options(&cap).unwrap();
        k9::assert_equal!(options.min, 0.);
        k9::assert_equal!(options.max, 2.);
        k9::assert_equal!(options.step, 1.);

        let opt = bindings.scene_value_at(&cap, 1).unwrap();
        k9::assert_equal!(opt.name, "Sunset");
        k9::assert_equal!(opt.value, serde_json::json!(101));
        assert!(bindings.scene_value_at(&cap, 3).is_none());
    }

    #[tokio::test]
    async fn reconcile_resets_stored_scene_indices() {
        let hub = MemoryHub::new("AA:BB");
        let descriptors = vec![scene_descriptor("lightScene", &["Sunrise", "Sunset"])];
        let cap = HubCapability::LightScenes("light".to_string());

        reconcile(&hub, &descriptors, "light", &NoScenes, listener())
            .await
            .unwrap();
        hub.set_capability_value(&cap, serde_json::json!(1))
            .await
            .unwrap();

        reconcile(&hub, &descriptors, "light", &NoScenes, listener())
            .await
            .unwrap();
        k9::assert_equal!(
            hub.get_capability_value(&cap).await,
            Some(JsonValue::Null)
        );
    }
}
