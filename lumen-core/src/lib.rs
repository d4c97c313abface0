pub mod config;
pub mod device_map;
mod error;
mod flux;
pub mod generation;
pub mod history;
pub mod monitor;
pub mod presets;
pub mod registry;
pub mod request;
pub mod residency;
pub mod runtime;
pub mod sessions;
mod util;

pub use config::{ConfigStore, LumenConfig, PerformanceFlags};
pub use device_map::*;
pub use error::{LumenError, Result};
pub use flux::FluxRuntime;
pub use generation::{
    GenerationController, GenerationSession, ProgressPacing, SessionEvent, SessionState,
};
pub use history::{HistoryEntry, HistoryLog, HistoryParams};
pub use monitor::{IdleConfig, IdleMonitor};
pub use presets::{PresetBook, PresetParams, Resolution, RESOLUTIONS};
pub use registry::{Capabilities, ModelDescriptor, ModelFamily, ModelRegistry, FLUX_DEV, FLUX_SCHNELL};
pub use request::{GenerationRequest, PromptStyle};
pub use residency::{
    FeatureReport, IdleAction, ModelLease, ResidencyManager, ResidencySettings, ResidencyStatus,
};
pub use runtime::{
    AttentionBackend, FeatureSupport, InferenceParams, LoadOptions, PerformanceFeature, Pipeline,
    PipelineRuntime, Precision, Tier,
};
pub use sessions::{GeneratedImage, SessionStore, StoredSession};
pub use util::*;
