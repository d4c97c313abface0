//! Runs one request's batch of images against the residency slot and
//! streams progress while the blocking inference calls proceed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    image_to_data_uri, request::resolve_seed, GeneratedImage, GenerationRequest, HistoryEntry,
    HistoryLog, HistoryParams, InferenceParams, LumenError, ModelDescriptor, Pipeline,
    ResidencyManager, Result, SessionStore, StoredSession, Tier,
};

const EVENT_BUFFER: usize = 64;
/// Estimated progress never reaches 100 before the call returns.
const PROGRESS_CAP: u8 = 95;

/// Progress is estimated, not measured: `steps * seconds_per_step`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressPacing {
    pub seconds_per_step: f64,
    pub tick_millis: u64,
}

impl Default for ProgressPacing {
    fn default() -> Self {
        Self {
            seconds_per_step: 0.5,
            tick_millis: 500,
        }
    }
}

impl ProgressPacing {
    pub fn estimate(&self, steps: usize) -> Duration {
        Duration::try_from_secs_f64(steps as f64 * self.seconds_per_step).unwrap_or_default()
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_millis.max(10))
    }
}

fn estimated_percent(elapsed: Duration, estimate: Duration) -> u8 {
    if estimate.is_zero() {
        return PROGRESS_CAP;
    }
    let percent = elapsed.as_secs_f64() / estimate.as_secs_f64() * 100.0;
    percent.min(PROGRESS_CAP as f64) as u8
}

/// Frames of the streaming protocol, serialized as `{"type": ..., ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Log {
        message: String,
    },
    Progress {
        /// Percent of the current image.
        progress: u8,
        current: usize,
        total: usize,
        /// Seconds since the session started.
        elapsed: f64,
    },
    Complete {
        session_id: Uuid,
        elapsed: f64,
    },
    Error {
        message: String,
    },
}

impl SessionEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Running,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationSession {
    pub id: Uuid,
    pub images: Vec<GeneratedImage>,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    /// Seconds from start to the last image.
    pub elapsed: f64,
}

impl GenerationSession {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            images: Vec::new(),
            state: SessionState::Running,
            created_at: Utc::now(),
            elapsed: 0.0,
        }
    }
}

/// Sends protocol frames. Neither a vanished nor a stalled receiver holds
/// up the session: intermediate frames are dropped when the buffer is full.
struct Emitter(Option<mpsc::Sender<SessionEvent>>);

impl Emitter {
    fn emit(&self, event: SessionEvent) {
        let Some(tx) = &self.0 else {
            return;
        };
        if let Err(TrySendError::Full(event)) = tx.try_send(event) {
            debug!(?event, "event buffer full, dropping frame");
        }
    }

    fn log(&self, message: impl Into<String>) {
        let message = message.into();
        debug!(%message, "session log");
        self.emit(SessionEvent::Log { message });
    }

    /// Terminal frame; waits for buffer space. Only called once the lease
    /// has been dropped.
    async fn finish(&self, event: SessionEvent) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(event).await;
        }
    }
}

pub struct GenerationController {
    residency: Arc<ResidencyManager>,
    sessions: Arc<SessionStore>,
    history: Arc<HistoryLog>,
    pacing: ProgressPacing,
}

impl GenerationController {
    pub fn new(
        residency: Arc<ResidencyManager>,
        sessions: Arc<SessionStore>,
        history: Arc<HistoryLog>,
        pacing: ProgressPacing,
    ) -> Self {
        Self {
            residency,
            sessions,
            history,
            pacing,
        }
    }

    /// Validates `request` and starts a streaming session.
    ///
    /// The stream ends with exactly one `complete` or `error` frame. On
    /// `complete` the images wait in the session store under `session_id`.
    pub fn start(self: &Arc<Self>, request: GenerationRequest) -> Result<mpsc::Receiver<SessionEvent>> {
        request.validate()?;
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let controller = self.clone();
        tokio::spawn(async move {
            let events = Emitter(Some(tx));
            let mut session = GenerationSession::new();
            match controller.render(&request, &mut session, &events).await {
                Ok(()) => {
                    let id = session.id;
                    controller.sessions.put(
                        id,
                        StoredSession {
                            images: std::mem::take(&mut session.images),
                            created_at: session.created_at,
                        },
                    );
                    info!(session = %id, elapsed = session.elapsed, "session complete");
                    events
                        .finish(SessionEvent::Complete {
                            session_id: id,
                            elapsed: session.elapsed,
                        })
                        .await;
                }
                Err(e) => {
                    session.state = SessionState::Failed;
                    warn!(session = %session.id, error = %e, "session failed");
                    events
                        .finish(SessionEvent::Error {
                            message: e.to_string(),
                        })
                        .await;
                }
            }
        });
        Ok(rx)
    }

    /// Runs a session to completion without streaming and returns it directly.
    pub async fn generate(&self, request: GenerationRequest) -> Result<GenerationSession> {
        request.validate()?;
        let mut session = GenerationSession::new();
        self.render(&request, &mut session, &Emitter(None)).await?;
        Ok(session)
    }

    async fn render(
        &self,
        request: &GenerationRequest,
        session: &mut GenerationSession,
        events: &Emitter,
    ) -> Result<()> {
        let started = Instant::now();
        let model = request.model.as_deref();
        if self.residency.needs_load(model) {
            let name = model
                .map(str::to_string)
                .unwrap_or_else(|| self.residency.settings().default_model);
            events.log(format!("Loading model {name}..."));
        }
        let lease = self.residency.acquire(model, Tier::Accelerator).await?;
        let descriptor = lease.descriptor().clone();
        events.log(format!("Model {} ready", descriptor.display_name));

        let prompt = request.effective_prompt();
        if request.enhance_prompt || request.style.is_some() {
            events.log(format!("Enhanced prompt: {prompt}"));
        }
        let negative_prompt = match request.negative() {
            Some(_) if !descriptor.capabilities.negative_prompt => {
                events.log(format!(
                    "{} does not support negative prompts, ignoring it",
                    descriptor.display_name
                ));
                None
            }
            other => other.map(str::to_string),
        };
        let steps = request.steps_for(&descriptor.capabilities);
        let guidance = request.guidance_for(&descriptor.capabilities);
        let total = request.num_images;

        for index in 0..total {
            let seed = resolve_seed(request.seed);
            let params = InferenceParams {
                prompt: prompt.clone(),
                negative_prompt: negative_prompt.clone(),
                width: request.width(),
                height: request.height(),
                steps,
                guidance,
                seed,
            };
            events.log(format!("Generating image {}/{total} (seed {seed})", index + 1));
            let image = self
                .render_one(lease.pipeline(), params, index + 1, total, started, events)
                .await?;
            session.images.push(GeneratedImage { image, seed });
        }
        drop(lease);

        session.elapsed = started.elapsed().as_secs_f64();
        self.record_history(request, &descriptor);
        session.state = SessionState::Complete;
        events.log(format!(
            "Generated {total} image(s) in {:.1}s",
            session.elapsed
        ));
        Ok(())
    }

    async fn render_one(
        &self,
        pipeline: Arc<dyn Pipeline>,
        params: InferenceParams,
        current: usize,
        total: usize,
        session_started: Instant,
        events: &Emitter,
    ) -> Result<String> {
        let estimate = self.pacing.estimate(params.steps);
        let seed = params.seed;
        let image_started = Instant::now();
        let mut job = tokio::task::spawn_blocking(move || {
            let image = pipeline.infer(&params)?;
            image_to_data_uri(&image)
        });

        let mut ticker = tokio::time::interval(self.pacing.tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        let joined = loop {
            tokio::select! {
                joined = &mut job => break joined,
                _ = ticker.tick() => {
                    events.emit(SessionEvent::Progress {
                        progress: estimated_percent(image_started.elapsed(), estimate),
                        current,
                        total,
                        elapsed: session_started.elapsed().as_secs_f64(),
                    });
                }
            }
        };
        let encoded = joined
            .map_err(|e| LumenError::Inference {
                message: format!("inference worker failed: {e}"),
            })?
            .map_err(|e| LumenError::Inference {
                message: format!("{e:#}"),
            })?;

        let took = image_started.elapsed().as_secs_f64();
        events.emit(SessionEvent::Progress {
            progress: 100,
            current,
            total,
            elapsed: session_started.elapsed().as_secs_f64(),
        });
        events.log(format!("Image {current}/{total} done in {took:.1}s (seed {seed})"));
        Ok(encoded)
    }

    fn record_history(&self, request: &GenerationRequest, descriptor: &ModelDescriptor) {
        let entry = HistoryEntry {
            timestamp: Utc::now(),
            prompt: request.prompt.clone(),
            negative_prompt: request.negative().map(str::to_string),
            params: HistoryParams {
                model: descriptor.id.clone(),
                width: request.width(),
                height: request.height(),
                steps: request.steps_for(&descriptor.capabilities),
                guidance_scale: request.guidance_for(&descriptor.capabilities),
                seed: request.seed,
                num_images: request.num_images,
                enhance_prompt: request.enhance_prompt,
            },
        };
        if let Err(e) = self.history.append(entry) {
            warn!(error = %e, "failed to record history");
        }
    }
}
