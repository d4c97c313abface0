use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::{LumenError, Result};

pub const FLUX_SCHNELL: &str = "black-forest-labs/FLUX.1-schnell";
pub const FLUX_DEV: &str = "black-forest-labs/FLUX.1-dev";

/// Pipeline families the runtime knows how to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    FluxSchnell,
    FluxDev,
}

impl ModelFamily {
    /// Detect model family from a hub repository name
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase();

        if !name_upper.contains("FLUX") {
            return None;
        }
        if name_upper.contains("DEV") {
            Some(Self::FluxDev)
        } else {
            // Schnell is the default when no specific variant is named
            Some(Self::FluxSchnell)
        }
    }

    pub fn capabilities(self) -> Capabilities {
        match self {
            Self::FluxSchnell => Capabilities {
                negative_prompt: false,
                default_steps: 4,
                default_guidance: 0.0,
            },
            Self::FluxDev => Capabilities {
                negative_prompt: false,
                default_steps: 28,
                default_guidance: 3.5,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Capabilities {
    pub negative_prompt: bool,
    pub default_steps: usize,
    pub default_guidance: f64,
}

/// Immutable identity and capability record for one model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelDescriptor {
    /// Hub repository id; doubles as the lookup key.
    pub id: String,
    pub display_name: String,
    pub family: ModelFamily,
    pub capabilities: Capabilities,
}

impl ModelDescriptor {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>, family: ModelFamily) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            family,
            capabilities: family.capabilities(),
        }
    }

    /// Builds a descriptor for an arbitrary hub repository, detecting its family.
    pub fn detect(id: &str) -> Result<Self> {
        let family = ModelFamily::from_name(id).ok_or_else(|| LumenError::Config {
            message: format!("unsupported model family: {id}"),
        })?;
        let display_name = id.rsplit('/').next().unwrap_or(id);
        Ok(Self::new(id, display_name, family))
    }
}

/// Catalog of descriptors, fixed once the process has started.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: BTreeMap<String, Arc<ModelDescriptor>>,
}

impl ModelRegistry {
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        registry.register(ModelDescriptor::new(
            FLUX_SCHNELL,
            "FLUX.1 [schnell]",
            ModelFamily::FluxSchnell,
        ));
        registry.register(ModelDescriptor::new(
            FLUX_DEV,
            "FLUX.1 [dev]",
            ModelFamily::FluxDev,
        ));
        registry
    }

    /// Built-in catalog plus extra repositories named in configuration.
    pub fn with_extra(extra: &[String]) -> Result<Self> {
        let mut registry = Self::builtin();
        for id in extra {
            if registry.models.contains_key(id) {
                continue;
            }
            let descriptor = ModelDescriptor::detect(id)?;
            tracing::debug!(model = %id, family = ?descriptor.family, "registered extra model");
            registry.register(descriptor);
        }
        Ok(registry)
    }

    pub fn register(&mut self, descriptor: ModelDescriptor) {
        self.models
            .insert(descriptor.id.clone(), Arc::new(descriptor));
    }

    pub fn get(&self, id: &str) -> Result<Arc<ModelDescriptor>> {
        self.models
            .get(id)
            .cloned()
            .ok_or_else(|| LumenError::ModelNotFound {
                model: id.to_string(),
            })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.models.contains_key(id)
    }

    pub fn list(&self) -> Vec<Arc<ModelDescriptor>> {
        self.models.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_detection_follows_repo_name() {
        assert_eq!(
            ModelFamily::from_name("black-forest-labs/FLUX.1-dev"),
            Some(ModelFamily::FluxDev)
        );
        assert_eq!(
            ModelFamily::from_name("someone/flux-finetune"),
            Some(ModelFamily::FluxSchnell)
        );
        assert_eq!(ModelFamily::from_name("stabilityai/sdxl"), None);
    }

    #[test]
    fn unknown_model_is_not_found() {
        let registry = ModelRegistry::builtin();
        assert!(registry.get(FLUX_SCHNELL).is_ok());
        assert!(matches!(
            registry.get("nope/missing"),
            Err(LumenError::ModelNotFound { .. })
        ));
    }

    #[test]
    fn extra_models_are_detected_and_unsupported_ones_rejected() {
        let registry = ModelRegistry::with_extra(&["me/FLUX-dev-tuned".to_string()]).unwrap();
        let descriptor = registry.get("me/FLUX-dev-tuned").unwrap();
        assert_eq!(descriptor.family, ModelFamily::FluxDev);
        assert_eq!(descriptor.display_name, "FLUX-dev-tuned");
        assert_eq!(registry.list().len(), 3);

        assert!(ModelRegistry::with_extra(&["me/sd15".to_string()]).is_err());
    }
}
