use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use lumen_core::{
    ConfigStore, GenerationController, HistoryLog, IdleMonitor, LumenConfig, ModelRegistry,
    PipelineRuntime, PresetBook, ResidencyManager, ResidencySettings, SessionStore,
};
use tokio::sync::Mutex;

/// Everything the handlers share.
pub struct AppState {
    pub residency: Arc<ResidencyManager>,
    pub controller: Arc<GenerationController>,
    pub sessions: Arc<SessionStore>,
    pub history: Arc<HistoryLog>,
    pub presets: PresetBook,
    pub config: Mutex<LumenConfig>,
    pub config_store: ConfigStore,
    /// Serializes settings updates without blocking config reads.
    pub settings_update: Mutex<()>,
}

impl AppState {
    pub fn new(
        config: LumenConfig,
        config_store: ConfigStore,
        runtime: Arc<dyn PipelineRuntime>,
    ) -> Result<Self> {
        let registry = ModelRegistry::with_extra(&config.extra_models)
            .context("failed to build model registry")?;
        registry
            .get(&config.model_id)
            .context("configured default model is not registered")?;

        let residency = Arc::new(ResidencyManager::new(
            Arc::new(registry),
            runtime,
            ResidencySettings::from(&config),
        ));
        let sessions = Arc::new(SessionStore::new());
        let history = Arc::new(
            HistoryLog::open(config.data_dir.join("history.json"), config.history_limit)
                .context("failed to open history")?,
        );
        let presets =
            PresetBook::open(config.data_dir.join("presets.json")).context("failed to open presets")?;
        let controller = Arc::new(GenerationController::new(
            residency.clone(),
            sessions.clone(),
            history.clone(),
            config.progress.clone(),
        ));

        Ok(Self {
            residency,
            controller,
            sessions,
            history,
            presets,
            config: Mutex::new(config),
            config_store,
            settings_update: Mutex::new(()),
        })
    }

    pub async fn idle_monitor(&self) -> IdleMonitor {
        let config = self.config.lock().await;
        IdleMonitor::new(
            self.residency.clone(),
            self.sessions.clone(),
            config.idle.clone(),
            Duration::from_secs(config.session_ttl_secs),
        )
    }
}
