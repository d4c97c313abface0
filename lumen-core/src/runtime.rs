//! The seam between the residency manager and whatever actually runs the model.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::ModelDescriptor;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

/// Memory location of a loaded model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Unloaded,
    Host,
    Accelerator,
}

serde_plain::derive_display_from_serialize!(Tier);
serde_plain::derive_fromstr_from_deserialize!(Tier);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Bf16,
    F16,
    F32,
}

serde_plain::derive_display_from_serialize!(Precision);
serde_plain::derive_fromstr_from_deserialize!(Precision);

impl Precision {
    pub fn dtype(self) -> candle_core::DType {
        match self {
            Self::Bf16 => candle_core::DType::BF16,
            Self::F16 => candle_core::DType::F16,
            Self::F32 => candle_core::DType::F32,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionBackend {
    #[default]
    Native,
    Flash,
    Sdpa,
}

serde_plain::derive_display_from_serialize!(AttentionBackend);
serde_plain::derive_fromstr_from_deserialize!(AttentionBackend);

/// Optional speed-ups requested at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "feature", content = "value", rename_all = "snake_case")]
pub enum PerformanceFeature {
    AttentionBackend(AttentionBackend),
    Compile,
}

/// Outcome of asking a pipeline to enable a [`PerformanceFeature`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum FeatureSupport {
    Supported,
    Unsupported(String),
}

#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub precision: Precision,
    /// Either [`Tier::Host`] or [`Tier::Accelerator`].
    pub tier: Tier,
    pub cache_dir: Option<PathBuf>,
}

/// One fully-resolved inference call.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceParams {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub width: usize,
    pub height: usize,
    pub steps: usize,
    pub guidance: f64,
    pub seed: u64,
}

/// A constructed pipeline for one descriptor.
///
/// Calls are never concurrent with one another: the residency manager
/// serializes migrations and releases against inference.
pub trait Pipeline: Send + Sync {
    fn infer(&self, params: &InferenceParams) -> Result<DynamicImage>;

    fn move_to(&self, tier: Tier) -> Result<()>;

    fn negotiate(&self, feature: PerformanceFeature) -> FeatureSupport;

    /// Frees every buffer the pipeline holds. The pipeline is unusable afterwards.
    fn release(&self);
}

#[async_trait]
pub trait PipelineRuntime: Send + Sync {
    async fn construct(
        &self,
        descriptor: &ModelDescriptor,
        options: &LoadOptions,
    ) -> Result<Arc<dyn Pipeline>>;
}
