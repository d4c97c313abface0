//! In-process pipeline runtime that renders flat colour fields.
//!
//! Every call is recorded in a shared journal so tests can assert on the
//! exact order of constructs, migrations, inferences and releases.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use image::{DynamicImage, Rgb, RgbImage};
use rand::{rngs::StdRng, Rng, SeedableRng};

use super::{
    AttentionBackend, FeatureSupport, InferenceParams, LoadOptions, PerformanceFeature, Pipeline,
    PipelineRuntime, Tier,
};
use crate::ModelDescriptor;

pub type Journal = Arc<Mutex<Vec<String>>>;

#[derive(Default)]
pub struct MockRuntime {
    journal: Journal,
    broken: HashSet<String>,
    infer_delay: Duration,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every inference call sleeps this long on its blocking worker.
    pub fn with_infer_delay(mut self, delay: Duration) -> Self {
        self.infer_delay = delay;
        self
    }

    /// Construction of `model` fails as if its weights were missing.
    pub fn with_broken_model(mut self, model: &str) -> Self {
        self.broken.insert(model.to_string());
        self
    }

    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }
}

#[async_trait]
impl PipelineRuntime for MockRuntime {
    async fn construct(
        &self,
        descriptor: &ModelDescriptor,
        options: &LoadOptions,
    ) -> Result<Arc<dyn Pipeline>> {
        if self.broken.contains(&descriptor.id) {
            bail!("weights for {} are missing", descriptor.id);
        }
        record(&self.journal, format!("construct:{}:{}", descriptor.id, options.tier));
        Ok(Arc::new(MockPipeline {
            model: descriptor.id.clone(),
            tier: Mutex::new(options.tier),
            journal: self.journal.clone(),
            delay: self.infer_delay,
        }))
    }
}

struct MockPipeline {
    model: String,
    tier: Mutex<Tier>,
    journal: Journal,
    delay: Duration,
}

impl Pipeline for MockPipeline {
    fn infer(&self, params: &InferenceParams) -> Result<DynamicImage> {
        if *self.tier.lock().unwrap() != Tier::Accelerator {
            bail!("{} is not accelerator resident", self.model);
        }
        record(&self.journal, format!("infer:{}:{}", self.model, params.seed));
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let salt = params
            .prompt
            .bytes()
            .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
        let mut rng = StdRng::seed_from_u64(params.seed ^ salt);
        let pixel = Rgb([rng.gen(), rng.gen(), rng.gen()]);
        Ok(DynamicImage::ImageRgb8(RgbImage::from_pixel(
            params.width as u32,
            params.height as u32,
            pixel,
        )))
    }

    fn move_to(&self, tier: Tier) -> Result<()> {
        record(&self.journal, format!("move:{}:{}", self.model, tier));
        *self.tier.lock().unwrap() = tier;
        Ok(())
    }

    fn negotiate(&self, feature: PerformanceFeature) -> FeatureSupport {
        match feature {
            PerformanceFeature::AttentionBackend(AttentionBackend::Native) => {
                FeatureSupport::Supported
            }
            PerformanceFeature::AttentionBackend(other) => {
                FeatureSupport::Unsupported(format!("{other} attention not built in"))
            }
            PerformanceFeature::Compile => {
                FeatureSupport::Unsupported("mock pipelines run eagerly".to_string())
            }
        }
    }

    fn release(&self) {
        record(&self.journal, format!("release:{}", self.model));
        *self.tier.lock().unwrap() = Tier::Unloaded;
    }
}

fn record(journal: &Journal, entry: String) {
    journal.lock().unwrap().push(entry);
}
