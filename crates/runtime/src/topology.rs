//! Device placement for the components of a text-to-image pipeline
//!
//! A [`PipelineTopology`] names each pipeline component and the device it
//! should live on. Targets declare which components they actually carry
//! through [`TopologyTarget`], so placing a pipeline never probes for
//! attributes at runtime.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;
use tracing::info;

use crate::reprompt::{PromptModel, RePrompt};
use crate::types::{DeviceSpec, ModelError};

/// Named sub-modules of a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineComponent {
    TextEncoder,
    #[serde(rename = "text_encoder_2")]
    TextEncoder2,
    Transformer,
    Vae,
    Refiner,
    Reprompt,
}

impl PipelineComponent {
    pub const ALL: [PipelineComponent; 6] = [
        PipelineComponent::TextEncoder,
        PipelineComponent::TextEncoder2,
        PipelineComponent::Transformer,
        PipelineComponent::Vae,
        PipelineComponent::Refiner,
        PipelineComponent::Reprompt,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineComponent::TextEncoder => "text_encoder",
            PipelineComponent::TextEncoder2 => "text_encoder_2",
            PipelineComponent::Transformer => "transformer",
            PipelineComponent::Vae => "vae",
            PipelineComponent::Refiner => "refiner",
            PipelineComponent::Reprompt => "reprompt",
        }
    }
}

impl fmt::Display for PipelineComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Topology errors
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("Pipeline has no component named {component}")]
    UnknownComponent { component: PipelineComponent },

    #[error("Failed to place {component} on {device}: {source}")]
    Placement {
        component: PipelineComponent,
        device: DeviceSpec,
        #[source]
        source: ModelError,
    },
}

/// One resolved placement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub component: PipelineComponent,
    pub device: DeviceSpec,
}

/// Something whose components can be moved between devices
pub trait TopologyTarget {
    /// Components this target actually has
    fn components(&self) -> Vec<PipelineComponent>;

    fn place(&mut self, component: PipelineComponent, device: DeviceSpec)
        -> Result<(), TopologyError>;
}

/// Target device per pipeline component
///
/// Serialized as a table keyed by component name, e.g.
/// `text_encoder = "cuda:0"`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineTopology {
    devices: BTreeMap<PipelineComponent, DeviceSpec>,
}

impl PipelineTopology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every component on the same device
    pub fn uniform(device: DeviceSpec) -> Self {
        Self {
            devices: PipelineComponent::ALL
                .iter()
                .map(|component| (*component, device))
                .collect(),
        }
    }

    pub fn with(mut self, component: PipelineComponent, device: DeviceSpec) -> Self {
        self.devices.insert(component, device);
        self
    }

    pub fn device_for(&self, component: PipelineComponent) -> Option<DeviceSpec> {
        self.devices.get(&component).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Placements for components that are present and have a device.
    pub fn resolve(&self, present: &[PipelineComponent]) -> Vec<Placement> {
        let present: BTreeSet<_> = present.iter().copied().collect();
        self.devices
            .iter()
            .filter(|(component, _)| present.contains(component))
            .map(|(component, device)| Placement {
                component: *component,
                device: *device,
            })
            .collect()
    }

    /// Move every resolved component of `target`, returning what was placed.
    pub fn apply<T: TopologyTarget + ?Sized>(
        &self,
        target: &mut T,
    ) -> Result<Vec<Placement>, TopologyError> {
        let placements = self.resolve(&target.components());
        for placement in &placements {
            target.place(placement.component, placement.device)?;
            info!(
                component = %placement.component,
                device = %placement.device,
                "Pipeline component placed"
            );
        }
        Ok(placements)
    }
}

impl<M: PromptModel> TopologyTarget for RePrompt<M> {
    fn components(&self) -> Vec<PipelineComponent> {
        vec![PipelineComponent::Reprompt]
    }

    fn place(
        &mut self,
        component: PipelineComponent,
        device: DeviceSpec,
    ) -> Result<(), TopologyError> {
        if component != PipelineComponent::Reprompt {
            return Err(TopologyError::UnknownComponent { component });
        }
        self.to(device)
            .map(|_| ())
            .map_err(|source| TopologyError::Placement {
                component,
                device,
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Pipeline without a second text encoder or refiner
    #[derive(Default)]
    struct FakePipeline {
        placed: Vec<(PipelineComponent, DeviceSpec)>,
    }

    impl TopologyTarget for FakePipeline {
        fn components(&self) -> Vec<PipelineComponent> {
            vec![
                PipelineComponent::TextEncoder,
                PipelineComponent::Transformer,
                PipelineComponent::Vae,
            ]
        }

        fn place(
            &mut self,
            component: PipelineComponent,
            device: DeviceSpec,
        ) -> Result<(), TopologyError> {
            if !self.components().contains(&component) {
                return Err(TopologyError::UnknownComponent { component });
            }
            self.placed.push((component, device));
            Ok(())
        }
    }

    #[test]
    fn test_resolve_skips_absent_components() {
        let topology = PipelineTopology::new()
            .with(PipelineComponent::TextEncoder, DeviceSpec::Cuda(0))
            .with(PipelineComponent::TextEncoder2, DeviceSpec::Cuda(1))
            .with(PipelineComponent::Vae, DeviceSpec::Cuda(1));

        let placements = topology.resolve(&FakePipeline::default().components());
        assert_eq!(
            placements,
            vec![
                Placement {
                    component: PipelineComponent::TextEncoder,
                    device: DeviceSpec::Cuda(0),
                },
                Placement {
                    component: PipelineComponent::Vae,
                    device: DeviceSpec::Cuda(1),
                },
            ]
        );
    }

    #[test]
    fn test_resolve_skips_components_without_device() {
        let topology = PipelineTopology::new().with(PipelineComponent::Vae, DeviceSpec::Cpu);
        let placements = topology.resolve(&PipelineComponent::ALL);
        assert_eq!(placements.len(), 1);
        assert_eq!(placements[0].component, PipelineComponent::Vae);
    }

    #[test]
    fn test_apply_uniform() {
        let mut pipeline = FakePipeline::default();
        let placed = PipelineTopology::uniform(DeviceSpec::Cuda(2))
            .apply(&mut pipeline)
            .unwrap();

        assert_eq!(placed.len(), 3);
        assert!(pipeline
            .placed
            .iter()
            .all(|(_, device)| *device == DeviceSpec::Cuda(2)));
    }

    #[test]
    fn test_empty_topology_places_nothing() {
        let mut pipeline = FakePipeline::default();
        let placed = PipelineTopology::new().apply(&mut pipeline).unwrap();
        assert!(placed.is_empty());
        assert!(pipeline.placed.is_empty());
    }

    #[test]
    fn test_toml_round_trip_uses_component_names() {
        let topology: PipelineTopology = toml::from_str(
            r#"
            text_encoder = "cuda:0"
            text_encoder_2 = "cuda:1"
            reprompt = "cpu"
            "#,
        )
        .unwrap();

        assert_eq!(
            topology.device_for(PipelineComponent::TextEncoder2),
            Some(DeviceSpec::Cuda(1))
        );
        assert_eq!(
            topology.device_for(PipelineComponent::Reprompt),
            Some(DeviceSpec::Cpu)
        );
        assert_eq!(topology.device_for(PipelineComponent::Vae), None);
    }

    #[test]
    fn test_serde_names_match_display_names() {
        for component in PipelineComponent::ALL {
            let encoded = serde_json::to_value(component).unwrap();
            assert_eq!(encoded, serde_json::json!(component.as_str()));

            let decoded: PipelineComponent =
                serde_json::from_value(serde_json::json!(component.to_string())).unwrap();
            assert_eq!(decoded, component);
        }
    }

    #[test]
    fn test_second_text_encoder_by_documented_name() {
        let topology: PipelineTopology = toml::from_str(r#"text_encoder_2 = "cuda:1""#).unwrap();
        assert_eq!(
            topology.device_for(PipelineComponent::TextEncoder2),
            Some(DeviceSpec::Cuda(1))
        );

        let rejected: Result<PipelineTopology, _> = toml::from_str(r#"text_encoder2 = "cuda:1""#);
        assert!(rejected.is_err());
    }

    #[test]
    fn test_unknown_component_name_is_rejected() {
        let result: Result<PipelineTopology, _> = toml::from_str(r#"unet = "cuda:0""#);
        assert!(result.is_err());
    }
}
