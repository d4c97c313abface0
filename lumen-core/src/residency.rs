//! Ownership of the single loaded-model slot.
//!
//! Three locks, always taken in this order:
//! - `admission`: FIFO queue of generations; a [`ModelLease`] holds it until dropped.
//! - `transition`: held across a whole load, eviction or tier migration.
//! - `slot`: plain mutex over the bookkeeping, never held across an await.
//!
//! Inference runs on the leased pipeline handle with none of them held except
//! admission, so status queries and the idle monitor stay responsive.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::{Duration, Instant};
use tracing::{info, warn};

use crate::{
    FeatureSupport, LoadOptions, LumenConfig, LumenError, ModelDescriptor, ModelRegistry,
    PerformanceFeature, Pipeline, PipelineRuntime, Precision, Result, Tier,
};

#[derive(Debug, Clone, PartialEq)]
pub struct ResidencySettings {
    pub default_model: String,
    pub memory_resident: bool,
    pub precision: Precision,
    pub cache_dir: Option<PathBuf>,
    pub features: Vec<PerformanceFeature>,
}

impl From<&LumenConfig> for ResidencySettings {
    fn from(config: &LumenConfig) -> Self {
        Self {
            default_model: config.model_id.clone(),
            memory_resident: config.memory_resident,
            precision: config.precision,
            cache_dir: config.cache_dir.clone(),
            features: config.performance.requested(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureReport {
    pub feature: PerformanceFeature,
    pub support: FeatureSupport,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResidencyStatus {
    pub model: Option<String>,
    pub display_name: Option<String>,
    pub tier: Tier,
    pub memory_resident: bool,
    pub busy: bool,
    /// Seconds since the last release; absent while unloaded or busy.
    pub idle_secs: Option<f64>,
    pub features: Vec<FeatureReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdleAction {
    Demoted,
    Evicted,
}

struct ResidencySlot {
    descriptor: Option<Arc<ModelDescriptor>>,
    tier: Tier,
    pipeline: Option<Arc<dyn Pipeline>>,
    features: Vec<FeatureReport>,
    last_access: Instant,
    busy: bool,
    /// Set once the idle monitor has acted; cleared by the next acquire.
    idle_handled: bool,
}

impl ResidencySlot {
    fn empty() -> Self {
        Self {
            descriptor: None,
            tier: Tier::Unloaded,
            pipeline: None,
            features: Vec::new(),
            last_access: Instant::now(),
            busy: false,
            idle_handled: false,
        }
    }

    fn resident(&self) -> Option<(Arc<ModelDescriptor>, Arc<dyn Pipeline>)> {
        Some((self.descriptor.clone()?, self.pipeline.clone()?))
    }
}

pub struct ResidencyManager {
    registry: Arc<ModelRegistry>,
    runtime: Arc<dyn PipelineRuntime>,
    settings: RwLock<ResidencySettings>,
    slot: Mutex<ResidencySlot>,
    transition: AsyncMutex<()>,
    admission: Arc<AsyncMutex<()>>,
}

/// Exclusive use of the resident pipeline. Dropping it is `release()`.
pub struct ModelLease {
    descriptor: Arc<ModelDescriptor>,
    pipeline: Arc<dyn Pipeline>,
    manager: Arc<ResidencyManager>,
    _admission: OwnedMutexGuard<()>,
}

impl ModelLease {
    pub fn descriptor(&self) -> &Arc<ModelDescriptor> {
        &self.descriptor
    }

    pub fn pipeline(&self) -> Arc<dyn Pipeline> {
        self.pipeline.clone()
    }
}

impl Drop for ModelLease {
    fn drop(&mut self) {
        self.manager.release();
    }
}

impl ResidencyManager {
    pub fn new(
        registry: Arc<ModelRegistry>,
        runtime: Arc<dyn PipelineRuntime>,
        settings: ResidencySettings,
    ) -> Self {
        Self {
            registry,
            runtime,
            settings: RwLock::new(settings),
            slot: Mutex::new(ResidencySlot::empty()),
            transition: AsyncMutex::new(()),
            admission: Arc::new(AsyncMutex::new(())),
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn settings(&self) -> ResidencySettings {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Waits for its turn in the admission queue, then makes `model` (or the
    /// default) resident at `target` and marks the slot busy.
    ///
    /// An unknown model fails before anything is queued or touched. A
    /// different resident model is evicted completely before loading starts.
    pub async fn acquire(self: &Arc<Self>, model: Option<&str>, target: Tier) -> Result<ModelLease> {
        if target == Tier::Unloaded {
            return Err(LumenError::InvalidTier {
                requested: target,
                reason: "acquire needs a resident tier".to_string(),
            });
        }
        let model_id = model
            .map(str::to_string)
            .unwrap_or_else(|| self.settings().default_model);
        let descriptor = self.registry.get(&model_id)?;

        let admission = self.admission.clone().lock_owned().await;
        let _transition = self.transition.lock().await;
        let pipeline = self.ensure_resident(&descriptor, target).await?;
        {
            let mut slot = self.slot();
            slot.busy = true;
            slot.last_access = Instant::now();
            slot.idle_handled = false;
        }
        Ok(ModelLease {
            descriptor,
            pipeline,
            manager: self.clone(),
            _admission: admission,
        })
    }

    /// Stamps the access time and clears `busy`.
    fn release(&self) {
        let mut slot = self.slot();
        slot.busy = false;
        slot.last_access = Instant::now();
    }

    /// True unless `model` (or the default) is already compute-ready.
    pub fn needs_load(&self, model: Option<&str>) -> bool {
        let model_id = model
            .map(str::to_string)
            .unwrap_or_else(|| self.settings().default_model);
        let slot = self.slot();
        !matches!(
            (&slot.descriptor, slot.tier),
            (Some(d), Tier::Accelerator) if d.id == model_id
        )
    }

    /// Moves the resident model between host and accelerator memory.
    /// Returns whether anything moved.
    pub async fn move_to_tier(&self, target: Tier) -> Result<bool> {
        let settings = self.settings();
        match target {
            Tier::Unloaded => {
                return Err(LumenError::InvalidTier {
                    requested: target,
                    reason: "use evict to unload".to_string(),
                })
            }
            Tier::Host if !settings.memory_resident => {
                return Err(LumenError::InvalidTier {
                    requested: target,
                    reason: "memory-resident mode is disabled".to_string(),
                })
            }
            _ => {}
        }

        let _transition = self.transition.lock().await;
        let (descriptor, pipeline, tier) = {
            let slot = self.slot();
            if slot.busy {
                return Err(LumenError::SlotBusy);
            }
            let Some((descriptor, pipeline)) = slot.resident() else {
                return Err(LumenError::InvalidTier {
                    requested: target,
                    reason: "no model is loaded".to_string(),
                });
            };
            (descriptor, pipeline, slot.tier)
        };
        if tier == target {
            return Ok(false);
        }
        self.migrate(&descriptor, &pipeline, target).await?;
        if target == Tier::Accelerator {
            let mut slot = self.slot();
            slot.last_access = Instant::now();
            slot.idle_handled = false;
        }
        Ok(true)
    }

    /// Fully unloads the resident model. Returns whether anything was loaded.
    pub async fn evict(&self) -> Result<bool> {
        let _transition = self.transition.lock().await;
        {
            let slot = self.slot();
            if slot.busy {
                return Err(LumenError::SlotBusy);
            }
            if slot.pipeline.is_none() {
                return Ok(false);
            }
        }
        self.evict_resident(&self.settings()).await;
        Ok(true)
    }

    /// Applies new settings once in-flight generations are done. The resident
    /// model is evicted so the next acquire loads under the new settings.
    pub async fn reconfigure(&self, settings: ResidencySettings) -> Result<()> {
        self.registry.get(&settings.default_model)?;
        let _admission = self.admission.lock().await;
        let _transition = self.transition.lock().await;
        let loaded = self.slot().pipeline.is_some();
        if loaded {
            self.evict_resident(&self.settings()).await;
        }
        info!(
            default_model = %settings.default_model,
            memory_resident = settings.memory_resident,
            "residency settings updated"
        );
        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = settings;
        Ok(())
    }

    /// One idle-monitor pass. Acts at most once per idle period and never
    /// while the slot is busy or a transition is in flight.
    pub async fn reclaim_idle(&self, idle_timeout: Duration) -> Option<IdleAction> {
        let Ok(_transition) = self.transition.try_lock() else {
            return None;
        };
        let settings = self.settings();
        let (descriptor, pipeline, tier) = {
            let mut slot = self.slot();
            if slot.busy || slot.idle_handled {
                return None;
            }
            let (descriptor, pipeline) = slot.resident()?;
            if slot.last_access.elapsed() < idle_timeout {
                return None;
            }
            slot.idle_handled = true;
            (descriptor, pipeline, slot.tier)
        };

        if settings.memory_resident {
            if tier == Tier::Host {
                return None;
            }
            info!(model = %descriptor.id, "idle timeout reached, demoting to host memory");
            match self.migrate(&descriptor, &pipeline, Tier::Host).await {
                Ok(()) => Some(IdleAction::Demoted),
                Err(e) => {
                    warn!(model = %descriptor.id, error = %e, "idle demotion failed");
                    None
                }
            }
        } else {
            info!(model = %descriptor.id, "idle timeout reached, evicting");
            self.evict_resident(&settings).await;
            Some(IdleAction::Evicted)
        }
    }

    pub fn status(&self) -> ResidencyStatus {
        let memory_resident = self.settings().memory_resident;
        let slot = self.slot();
        let idle_secs = (slot.pipeline.is_some() && !slot.busy)
            .then(|| slot.last_access.elapsed().as_secs_f64());
        ResidencyStatus {
            model: slot.descriptor.as_ref().map(|d| d.id.clone()),
            display_name: slot.descriptor.as_ref().map(|d| d.display_name.clone()),
            tier: slot.tier,
            memory_resident,
            busy: slot.busy,
            idle_secs,
            features: slot.features.clone(),
        }
    }

    async fn ensure_resident(
        &self,
        descriptor: &Arc<ModelDescriptor>,
        target: Tier,
    ) -> Result<Arc<dyn Pipeline>> {
        let settings = self.settings();
        // Without memory-resident mode the host tier does not exist.
        let target = if settings.memory_resident {
            target
        } else {
            Tier::Accelerator
        };

        let (resident, tier) = {
            let slot = self.slot();
            (slot.resident(), slot.tier)
        };
        if let Some((current, pipeline)) = resident {
            if current.id == descriptor.id {
                if tier == Tier::Host && target == Tier::Accelerator {
                    self.migrate(descriptor, &pipeline, Tier::Accelerator).await?;
                }
                return Ok(pipeline);
            }
            info!(from = %current.id, to = %descriptor.id, "switching models");
            self.evict_resident(&settings).await;
        }

        let (pipeline, loaded_tier) = self.load(descriptor, &settings).await?;
        if loaded_tier == Tier::Host && target == Tier::Accelerator {
            self.migrate(descriptor, &pipeline, Tier::Accelerator).await?;
        }
        Ok(pipeline)
    }

    async fn load(
        &self,
        descriptor: &Arc<ModelDescriptor>,
        settings: &ResidencySettings,
    ) -> Result<(Arc<dyn Pipeline>, Tier)> {
        let tier = if settings.memory_resident {
            Tier::Host
        } else {
            Tier::Accelerator
        };
        let options = LoadOptions {
            precision: settings.precision,
            tier,
            cache_dir: settings.cache_dir.clone(),
        };
        info!(model = %descriptor.id, %tier, precision = %settings.precision, "loading model");
        let started = Instant::now();
        let pipeline = self
            .runtime
            .construct(descriptor, &options)
            .await
            .map_err(|e| {
                warn!(model = %descriptor.id, error = %format!("{e:#}"), "model load failed");
                LumenError::unavailable(&descriptor.id, &e)
            })?;

        let features = settings
            .features
            .iter()
            .map(|&feature| {
                let support = pipeline.negotiate(feature);
                match &support {
                    FeatureSupport::Supported => info!(?feature, "performance feature enabled"),
                    FeatureSupport::Unsupported(reason) => {
                        warn!(?feature, %reason, "performance feature unavailable, continuing without it")
                    }
                }
                FeatureReport { feature, support }
            })
            .collect();

        {
            let mut slot = self.slot();
            slot.descriptor = Some(descriptor.clone());
            slot.tier = tier;
            slot.pipeline = Some(pipeline.clone());
            slot.features = features;
            slot.last_access = Instant::now();
            slot.idle_handled = false;
        }
        info!(
            model = %descriptor.id,
            %tier,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "model loaded"
        );
        Ok((pipeline, tier))
    }

    async fn migrate(
        &self,
        descriptor: &ModelDescriptor,
        pipeline: &Arc<dyn Pipeline>,
        to: Tier,
    ) -> Result<()> {
        let started = Instant::now();
        self.slot().busy = true;
        let moving = pipeline.clone();
        let outcome = tokio::task::spawn_blocking(move || moving.move_to(to))
            .await
            .map_err(anyhow::Error::from)
            .and_then(|moved| moved);
        let mut slot = self.slot();
        slot.busy = false;
        match outcome {
            Ok(()) => {
                slot.tier = to;
                info!(
                    model = %descriptor.id,
                    tier = %to,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "model moved"
                );
                Ok(())
            }
            Err(e) => Err(LumenError::unavailable(&descriptor.id, &e)),
        }
    }

    /// Demotes (memory-resident mode only), releases and resets the slot.
    /// Callers hold the transition lock and have checked `busy`.
    async fn evict_resident(&self, settings: &ResidencySettings) {
        let Some((descriptor, pipeline)) = self.slot().resident() else {
            return;
        };
        let tier = self.slot().tier;
        if settings.memory_resident && tier == Tier::Accelerator {
            if let Err(e) = self.migrate(&descriptor, &pipeline, Tier::Host).await {
                warn!(model = %descriptor.id, error = %e, "demotion before eviction failed");
            }
        }
        pipeline.release();
        *self.slot() = ResidencySlot::empty();
        info!(model = %descriptor.id, "model evicted");
    }

    fn slot(&self) -> MutexGuard<'_, ResidencySlot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::mock::{Journal, MockRuntime};
    use crate::{AttentionBackend, ModelFamily};

    const A: &str = "test/flux-a";
    const B: &str = "test/flux-b";
    const BROKEN: &str = "test/flux-broken";

    fn registry() -> Arc<ModelRegistry> {
        let mut registry = ModelRegistry::default();
        for id in [A, B, BROKEN] {
            registry.register(ModelDescriptor::new(id, id, ModelFamily::FluxSchnell));
        }
        Arc::new(registry)
    }

    fn settings(memory_resident: bool) -> ResidencySettings {
        ResidencySettings {
            default_model: A.to_string(),
            memory_resident,
            precision: Precision::F32,
            cache_dir: None,
            features: Vec::new(),
        }
    }

    fn manager_with(settings: ResidencySettings) -> (Arc<ResidencyManager>, Journal) {
        let runtime = MockRuntime::new().with_broken_model(BROKEN);
        let journal = runtime.journal();
        let manager = ResidencyManager::new(registry(), Arc::new(runtime), settings);
        (Arc::new(manager), journal)
    }

    fn entries(journal: &Journal) -> Vec<String> {
        journal.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn cold_acquire_loads_once_and_reuses() {
        let (manager, journal) = manager_with(settings(false));
        drop(manager.acquire(None, Tier::Accelerator).await.unwrap());
        drop(manager.acquire(Some(A), Tier::Accelerator).await.unwrap());

        assert_eq!(entries(&journal), vec![format!("construct:{A}:accelerator")]);
        let status = manager.status();
        assert_eq!(status.model.as_deref(), Some(A));
        assert_eq!(status.tier, Tier::Accelerator);
        assert!(!status.busy);
        assert!(!manager.needs_load(None));
        assert!(manager.needs_load(Some(B)));
    }

    #[tokio::test]
    async fn switching_evicts_before_loading() {
        let (manager, journal) = manager_with(settings(false));
        drop(manager.acquire(Some(A), Tier::Accelerator).await.unwrap());
        drop(manager.acquire(Some(B), Tier::Accelerator).await.unwrap());

        assert_eq!(
            entries(&journal),
            vec![
                format!("construct:{A}:accelerator"),
                format!("release:{A}"),
                format!("construct:{B}:accelerator"),
            ]
        );
        assert_eq!(manager.status().model.as_deref(), Some(B));
    }

    #[tokio::test]
    async fn memory_resident_loads_to_host_then_promotes() {
        let (manager, journal) = manager_with(settings(true));
        let lease = manager.acquire(Some(A), Tier::Accelerator).await.unwrap();
        assert_eq!(manager.status().tier, Tier::Accelerator);
        drop(lease);

        assert!(manager.move_to_tier(Tier::Host).await.unwrap());
        assert!(!manager.move_to_tier(Tier::Host).await.unwrap());
        assert_eq!(manager.status().tier, Tier::Host);

        assert!(manager.evict().await.unwrap());
        assert!(!manager.evict().await.unwrap());
        assert_eq!(
            entries(&journal),
            vec![
                format!("construct:{A}:host"),
                format!("move:{A}:accelerator"),
                format!("move:{A}:host"),
                format!("release:{A}"),
            ]
        );
        assert_eq!(manager.status().tier, Tier::Unloaded);
    }

    #[tokio::test]
    async fn memory_resident_eviction_demotes_before_release() {
        let (manager, journal) = manager_with(settings(true));
        drop(manager.acquire(Some(A), Tier::Accelerator).await.unwrap());
        assert!(manager.evict().await.unwrap());
        assert_eq!(
            entries(&journal),
            vec![
                format!("construct:{A}:host"),
                format!("move:{A}:accelerator"),
                format!("move:{A}:host"),
                format!("release:{A}"),
            ]
        );
        assert_eq!(manager.status().tier, Tier::Unloaded);
    }

    #[tokio::test]
    async fn memory_resident_switch_demotes_before_release() {
        let (manager, journal) = manager_with(settings(true));
        drop(manager.acquire(Some(A), Tier::Accelerator).await.unwrap());
        drop(manager.acquire(Some(B), Tier::Accelerator).await.unwrap());

        let log = entries(&journal);
        let demoted = log.iter().position(|e| *e == format!("move:{A}:host")).unwrap();
        let released = log.iter().position(|e| *e == format!("release:{A}")).unwrap();
        let loaded = log.iter().position(|e| *e == format!("construct:{B}:host")).unwrap();
        assert!(demoted < released);
        assert!(released < loaded);
        assert_eq!(manager.status().model.as_deref(), Some(B));
        assert_eq!(manager.status().tier, Tier::Accelerator);
    }

    #[tokio::test]
    async fn warm_preload_stays_in_host_memory() {
        let (manager, journal) = manager_with(settings(true));
        drop(manager.acquire(Some(A), Tier::Host).await.unwrap());
        assert_eq!(manager.status().tier, Tier::Host);
        assert!(manager.needs_load(Some(A)));

        drop(manager.acquire(Some(A), Tier::Accelerator).await.unwrap());
        assert_eq!(
            entries(&journal),
            vec![format!("construct:{A}:host"), format!("move:{A}:accelerator")]
        );
    }

    #[tokio::test]
    async fn unknown_model_leaves_slot_untouched() {
        let (manager, journal) = manager_with(settings(false));
        drop(manager.acquire(Some(A), Tier::Accelerator).await.unwrap());
        let err = manager
            .acquire(Some("nope/missing"), Tier::Accelerator)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, LumenError::ModelNotFound { .. }));
        assert_eq!(entries(&journal).len(), 1);
        assert_eq!(manager.status().model.as_deref(), Some(A));
    }

    #[tokio::test]
    async fn construction_failure_is_unavailable() {
        let (manager, _) = manager_with(settings(false));
        let err = manager
            .acquire(Some(BROKEN), Tier::Accelerator)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, LumenError::Unavailable { .. }));
        assert_eq!(manager.status().tier, Tier::Unloaded);
        assert!(manager.acquire(Some(A), Tier::Accelerator).await.is_ok());
    }

    #[tokio::test]
    async fn busy_slot_refuses_migration_and_eviction() {
        let (manager, _) = manager_with(settings(true));
        let lease = manager.acquire(Some(A), Tier::Accelerator).await.unwrap();
        assert!(manager.status().busy);
        assert!(matches!(manager.evict().await, Err(LumenError::SlotBusy)));
        assert!(matches!(
            manager.move_to_tier(Tier::Host).await,
            Err(LumenError::SlotBusy)
        ));
        drop(lease);
        assert!(manager.move_to_tier(Tier::Host).await.unwrap());
    }

    #[tokio::test]
    async fn host_tier_requires_memory_resident_mode() {
        let (manager, _) = manager_with(settings(false));
        drop(manager.acquire(Some(A), Tier::Host).await.unwrap());
        assert_eq!(manager.status().tier, Tier::Accelerator);
        assert!(matches!(
            manager.move_to_tier(Tier::Host).await,
            Err(LumenError::InvalidTier { .. })
        ));
        assert!(!manager.move_to_tier(Tier::Accelerator).await.unwrap());
    }

    #[tokio::test]
    async fn admission_queue_serializes_generations() {
        let (manager, journal) = manager_with(settings(false));
        let lease_a = manager.acquire(Some(A), Tier::Accelerator).await.unwrap();

        let contender = manager.clone();
        let waiting = tokio::spawn(async move {
            contender
                .acquire(Some(B), Tier::Accelerator)
                .await
                .map(|lease| lease.descriptor().id.clone())
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!waiting.is_finished());
        assert_eq!(manager.status().model.as_deref(), Some(A));
        assert!(!entries(&journal).contains(&format!("release:{A}")));

        drop(lease_a);
        assert_eq!(waiting.await.unwrap().unwrap(), B);
        assert_eq!(
            entries(&journal),
            vec![
                format!("construct:{A}:accelerator"),
                format!("release:{A}"),
                format!("construct:{B}:accelerator"),
            ]
        );
    }

    #[tokio::test]
    async fn feature_negotiation_is_reported() {
        let (manager, _) = manager_with(ResidencySettings {
            features: vec![
                PerformanceFeature::AttentionBackend(AttentionBackend::Flash),
                PerformanceFeature::Compile,
                PerformanceFeature::AttentionBackend(AttentionBackend::Native),
            ],
            ..settings(false)
        });
        drop(manager.acquire(None, Tier::Accelerator).await.unwrap());
        let supported: Vec<bool> = manager
            .status()
            .features
            .iter()
            .map(|r| r.support == FeatureSupport::Supported)
            .collect();
        assert_eq!(supported, vec![false, false, true]);
    }

    #[tokio::test]
    async fn reconfigure_evicts_and_applies() {
        let (manager, journal) = manager_with(settings(false));
        drop(manager.acquire(None, Tier::Accelerator).await.unwrap());
        manager
            .reconfigure(ResidencySettings {
                default_model: B.to_string(),
                ..settings(true)
            })
            .await
            .unwrap();
        assert_eq!(manager.status().tier, Tier::Unloaded);
        assert!(manager.status().memory_resident);

        drop(manager.acquire(None, Tier::Accelerator).await.unwrap());
        assert_eq!(entries(&journal).last().unwrap(), &format!("move:{B}:accelerator"));

        let err = manager
            .reconfigure(ResidencySettings {
                default_model: "nope/missing".to_string(),
                ..settings(true)
            })
            .await;
        assert!(matches!(err, Err(LumenError::ModelNotFound { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_slot_is_evicted_once() {
        let (manager, journal) = manager_with(settings(false));
        drop(manager.acquire(Some(A), Tier::Accelerator).await.unwrap());
        let timeout = Duration::from_secs(30);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(manager.reclaim_idle(timeout).await, None);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(manager.reclaim_idle(timeout).await, Some(IdleAction::Evicted));
        assert_eq!(manager.reclaim_idle(timeout).await, None);
        assert_eq!(manager.status().tier, Tier::Unloaded);
        assert_eq!(entries(&journal).last().unwrap(), &format!("release:{A}"));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_demotion_does_not_rearm_until_next_acquire() {
        let (manager, _) = manager_with(settings(true));
        drop(manager.acquire(Some(A), Tier::Accelerator).await.unwrap());
        let timeout = Duration::from_secs(30);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(manager.reclaim_idle(timeout).await, Some(IdleAction::Demoted));
        assert_eq!(manager.status().tier, Tier::Host);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(manager.reclaim_idle(timeout).await, None);

        drop(manager.acquire(Some(A), Tier::Accelerator).await.unwrap());
        assert_eq!(manager.status().tier, Tier::Accelerator);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(manager.reclaim_idle(timeout).await, Some(IdleAction::Demoted));
    }

    #[tokio::test(start_paused = true)]
    async fn manual_promotion_rearms_idle_demotion() {
        let (manager, _) = manager_with(settings(true));
        drop(manager.acquire(Some(A), Tier::Accelerator).await.unwrap());
        let timeout = Duration::from_secs(30);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(manager.reclaim_idle(timeout).await, Some(IdleAction::Demoted));

        assert!(manager.move_to_tier(Tier::Accelerator).await.unwrap());
        assert_eq!(manager.reclaim_idle(timeout).await, None);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(manager.reclaim_idle(timeout).await, Some(IdleAction::Demoted));
        assert_eq!(manager.status().tier, Tier::Host);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_slot_is_never_reclaimed() {
        let (manager, _) = manager_with(settings(false));
        let lease = manager.acquire(Some(A), Tier::Accelerator).await.unwrap();
        let timeout = Duration::from_secs(30);

        tokio::time::advance(Duration::from_secs(120)).await;
        assert_eq!(manager.reclaim_idle(timeout).await, None);

        drop(lease);
        assert_eq!(manager.reclaim_idle(timeout).await, None);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(manager.reclaim_idle(timeout).await, Some(IdleAction::Evicted));
    }
}
