//! Persisted service settings.
//!
//! Loaded with `figment`: built-in defaults, then the JSON settings file,
//! then `LUMEN_*` environment variables (`__` separates nested keys, e.g.
//! `LUMEN_IDLE__TIMEOUT_SECS=60`). Saving writes the JSON file back.

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Json, Serialized},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::history::write_json;
use crate::{
    registry::FLUX_SCHNELL, AttentionBackend, IdleConfig, LumenError, PerformanceFeature,
    Precision, ProgressPacing, Result,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LumenConfig {
    /// Descriptor used when a request does not name one.
    pub model_id: String,
    /// Hugging Face cache directory; the hub default when unset.
    pub cache_dir: Option<PathBuf>,
    /// Keep weights warm in host memory and demote instead of evicting.
    pub memory_resident: bool,
    pub precision: Precision,
    pub performance: PerformanceFlags,
    pub idle: IdleConfig,
    pub progress: ProgressPacing,
    /// Completed sessions nobody fetched are dropped after this long.
    pub session_ttl_secs: u64,
    pub history_limit: usize,
    /// Directory holding `history.json` and `presets.json`.
    pub data_dir: PathBuf,
    /// Additional hub repositories to register, family detected from the name.
    pub extra_models: Vec<String>,
}

impl Default for LumenConfig {
    fn default() -> Self {
        Self {
            model_id: FLUX_SCHNELL.to_string(),
            cache_dir: None,
            memory_resident: false,
            precision: Precision::default(),
            performance: PerformanceFlags::default(),
            idle: IdleConfig::default(),
            progress: ProgressPacing::default(),
            session_ttl_secs: 3600,
            history_limit: 100,
            data_dir: PathBuf::from("."),
            extra_models: Vec::new(),
        }
    }
}

/// Optional features requested whenever a pipeline is constructed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceFlags {
    pub attention_backend: Option<AttentionBackend>,
    pub compile: bool,
}

impl PerformanceFlags {
    pub fn requested(&self) -> Vec<PerformanceFeature> {
        let mut features = Vec::new();
        if let Some(backend) = self.attention_backend {
            features.push(PerformanceFeature::AttentionBackend(backend));
        }
        if self.compile {
            features.push(PerformanceFeature::Compile);
        }
        features
    }
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<LumenConfig> {
        let config: LumenConfig = Figment::from(Serialized::defaults(LumenConfig::default()))
            .merge(Json::file(&self.path))
            .merge(Env::prefixed("LUMEN_").split("__"))
            .extract()?;
        if config.history_limit == 0 {
            return Err(LumenError::Config {
                message: "history_limit must be at least 1".to_string(),
            });
        }
        Ok(config)
    }

    pub fn save(&self, config: &LumenConfig) -> Result<()> {
        write_json(&self.path, config)?;
        tracing::debug!(path = %self.path.display(), "settings saved");
        Ok(())
    }
}
