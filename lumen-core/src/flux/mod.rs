//! FLUX.1 pipelines on candle.
//!
//! In memory-resident mode the weights are read once into host memory and
//! the accelerator copy is rebuilt from them on every promotion. Otherwise
//! the safetensors are mapped directly onto the device and the host tier
//! does not exist.

mod weights;

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{bail, Context, Error, Result};
use async_trait::async_trait;
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::Module;
use candle_transformers::models::clip::text_model::{
    Activation, ClipTextConfig, ClipTextTransformer,
};
use candle_transformers::models::flux::{
    autoencoder::{self, AutoEncoder},
    model::{self, Flux},
    sampling,
};
use candle_transformers::models::t5::{self, T5EncoderModel};
use hf_hub::api::tokio::ApiBuilder;
use image::DynamicImage;
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use weights::{ComponentBuilders, FluxFiles, HostWeights};

use crate::{
    select_best_device, tensor_to_image, AttentionBackend, DeviceMap, FeatureSupport,
    InferenceParams, LoadOptions, ModelDescriptor, ModelFamily, PerformanceFeature, Pipeline,
    PipelineRuntime, Precision, Tier,
};

/// Constructs candle FLUX pipelines on the best available device.
pub struct FluxRuntime {
    device_map: DeviceMap,
}

impl FluxRuntime {
    pub fn new(device_map: DeviceMap) -> Self {
        Self { device_map }
    }
}

#[async_trait]
impl PipelineRuntime for FluxRuntime {
    async fn construct(
        &self,
        descriptor: &ModelDescriptor,
        options: &LoadOptions,
    ) -> Result<Arc<dyn Pipeline>> {
        let device = select_best_device(self.device_map).context("failed to set up device")?;
        let dtype = match options.precision {
            Precision::Bf16 => device.bf16_default_to_f32(),
            precision => precision.dtype(),
        };

        let mut api = ApiBuilder::new().with_progress(false);
        if let Some(dir) = &options.cache_dir {
            api = api.with_cache_dir(dir.clone());
        }
        let api = api.build().context("failed to set up hub client")?;
        let files = FluxFiles::fetch(&api, &descriptor.id, descriptor.family).await?;

        let model = descriptor.id.clone();
        let family = descriptor.family;
        let tier = options.tier;
        let pipeline = tokio::task::spawn_blocking(move || {
            FluxPipeline::load(model, family, files, device, dtype, tier)
        })
        .await
        .context("model loader panicked")??;
        Ok(Arc::new(pipeline))
    }
}

struct Models {
    t5: T5EncoderModel,
    clip: ClipTextTransformer,
    autoencoder: AutoEncoder,
    flux: Flux,
}

impl Models {
    fn build(builders: ComponentBuilders, family: ModelFamily, t5_config: &t5::Config) -> Result<Self> {
        let t5 = T5EncoderModel::load(builders.t5, t5_config).context("failed to load T5 model")?;
        let clip = ClipTextTransformer::new(builders.clip.pp("text_model"), &clip_config())
            .context("failed to load CLIP model")?;
        let (autoencoder_config, flux_config) = match family {
            ModelFamily::FluxSchnell => (autoencoder::Config::schnell(), model::Config::schnell()),
            ModelFamily::FluxDev => (autoencoder::Config::dev(), model::Config::dev()),
        };
        let autoencoder = AutoEncoder::new(&autoencoder_config, builders.autoencoder)
            .context("failed to load autoencoder")?;
        let flux = Flux::new(&flux_config, builders.transformer).context("failed to load flux model")?;
        Ok(Self {
            t5,
            clip,
            autoencoder,
            flux,
        })
    }
}

fn clip_config() -> ClipTextConfig {
    ClipTextConfig {
        vocab_size: 49408,
        projection_dim: 768,
        activation: Activation::QuickGelu,
        intermediate_size: 3072,
        embed_dim: 768,
        max_position_embeddings: 77,
        pad_with: None,
        num_hidden_layers: 12,
        num_attention_heads: 12,
    }
}

#[derive(Default)]
struct Stage {
    host: Option<HostWeights>,
    active: Option<Models>,
    released: bool,
}

pub struct FluxPipeline {
    model: String,
    family: ModelFamily,
    device: Device,
    dtype: DType,
    t5_config: t5::Config,
    t5_tokenizer: Tokenizer,
    clip_tokenizer: Tokenizer,
    stage: Mutex<Stage>,
}

impl FluxPipeline {
    fn load(
        model: String,
        family: ModelFamily,
        files: FluxFiles,
        device: Device,
        dtype: DType,
        tier: Tier,
    ) -> Result<Self> {
        let config_str =
            std::fs::read_to_string(&files.t5_config).context("failed to read T5 config")?;
        let t5_config: t5::Config =
            serde_json::from_str(&config_str).context("failed to parse T5 config")?;
        let t5_tokenizer = Tokenizer::from_file(&files.t5_tokenizer)
            .map_err(Error::msg)
            .context("failed to load T5 tokenizer")?;
        let clip_tokenizer = Tokenizer::from_file(&files.clip_tokenizer)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;

        let stage = match tier {
            Tier::Host => Stage {
                host: Some(HostWeights::load(&files, dtype)?),
                ..Stage::default()
            },
            Tier::Accelerator => {
                let builders = ComponentBuilders::mmaped(&files, dtype, &device)?;
                Stage {
                    active: Some(Models::build(builders, family, &t5_config)?),
                    ..Stage::default()
                }
            }
            Tier::Unloaded => bail!("a pipeline cannot be constructed unloaded"),
        };
        info!(%model, %tier, ?dtype, device = ?device, "flux pipeline constructed");

        Ok(Self {
            model,
            family,
            device,
            dtype,
            t5_config,
            t5_tokenizer,
            clip_tokenizer,
            stage: Mutex::new(stage),
        })
    }

    fn stage(&self) -> MutexGuard<'_, Stage> {
        self.stage.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn t5_pad_len(&self) -> usize {
        match self.family {
            ModelFamily::FluxSchnell => 256,
            ModelFamily::FluxDev => 512,
        }
    }

    fn tokens(&self, tokenizer: &Tokenizer, prompt: &str, pad_to: Option<usize>) -> Result<Tensor> {
        let mut ids = tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        if let Some(len) = pad_to {
            ids.resize(len, 0);
        }
        Ok(Tensor::new(ids.as_slice(), &self.device)?.unsqueeze(0)?)
    }
}

fn negotiate(feature: PerformanceFeature) -> FeatureSupport {
    match feature {
        PerformanceFeature::AttentionBackend(AttentionBackend::Native) => {
            FeatureSupport::Supported
        }
        PerformanceFeature::AttentionBackend(backend) => FeatureSupport::Unsupported(format!(
            "no fused kernel path for {backend} attention"
        )),
        PerformanceFeature::Compile => {
            FeatureSupport::Unsupported("candle executes eagerly".to_string())
        }
    }
}

/// Initial latent drawn from `seed` on the CPU, so a seed gives the same
/// noise on every device.
fn seeded_noise(seed: u64, height: usize, width: usize, device: &Device) -> Result<Tensor> {
    let (h, w) = (height.div_ceil(16) * 2, width.div_ceil(16) * 2);
    let mut rng = StdRng::seed_from_u64(seed);
    let values: Vec<f32> = (0..16 * h * w)
        .map(|_| StandardNormal.sample(&mut rng))
        .collect();
    Ok(Tensor::from_vec(values, (1, 16, h, w), &Device::Cpu)?.to_device(device)?)
}

impl Pipeline for FluxPipeline {
    fn infer(&self, params: &InferenceParams) -> Result<DynamicImage> {
        let mut stage = self.stage();
        let Some(models) = stage.active.as_mut() else {
            bail!("{} is not on the accelerator", self.model);
        };

        let noise = seeded_noise(params.seed, params.height, params.width, &self.device)?
            .to_dtype(self.dtype)?;

        let t5_tokens = self.tokens(&self.t5_tokenizer, &params.prompt, Some(self.t5_pad_len()))?;
        let t5_emb = models.t5.forward(&t5_tokens)?.to_dtype(self.dtype)?;
        let clip_tokens = self.tokens(&self.clip_tokenizer, &params.prompt, None)?;
        let clip_emb = models.clip.forward(&clip_tokens)?.to_dtype(self.dtype)?;

        let state = sampling::State::new(&t5_emb, &clip_emb, &noise)?;
        let timesteps = match self.family {
            ModelFamily::FluxSchnell => sampling::get_schedule(params.steps, None),
            ModelFamily::FluxDev => {
                sampling::get_schedule(params.steps, Some((state.img.dim(1)?, 0.5, 1.15)))
            }
        };
        let latent = sampling::denoise(
            &models.flux,
            &state.img,
            &state.img_ids,
            &state.txt,
            &state.txt_ids,
            &state.vec,
            &timesteps,
            params.guidance,
        )?;
        let unpacked = sampling::unpack(&latent, params.height, params.width)?;
        debug!(seed = params.seed, "generated latent image");

        let decoded = models.autoencoder.decode(&unpacked)?;
        let img = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.to_dtype(DType::U8)?;
        tensor_to_image(&img.i(0)?)
    }

    fn move_to(&self, tier: Tier) -> Result<()> {
        let mut stage = self.stage();
        if stage.released {
            bail!("{} has been released", self.model);
        }
        match tier {
            Tier::Accelerator if stage.active.is_some() => {}
            Tier::Accelerator => {
                let Some(host) = stage.host.as_ref() else {
                    bail!("{} has no host copy to promote", self.model);
                };
                let builders = host.builders(self.dtype, &self.device);
                stage.active = Some(Models::build(builders, self.family, &self.t5_config)?);
            }
            Tier::Host => {
                if stage.host.is_none() {
                    bail!("{} was loaded without a host copy", self.model);
                }
                stage.active = None;
            }
            Tier::Unloaded => bail!("use release to unload {}", self.model),
        }
        debug!(model = %self.model, %tier, "flux pipeline moved");
        Ok(())
    }

    fn negotiate(&self, feature: PerformanceFeature) -> FeatureSupport {
        negotiate(feature)
    }

    fn release(&self) {
        let mut stage = self.stage();
        *stage = Stage {
            released: true,
            ..Stage::default()
        };
        debug!(model = %self.model, "flux pipeline released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noise_is_a_function_of_the_seed() {
        let a = seeded_noise(42, 256, 264, &Device::Cpu).unwrap();
        let b = seeded_noise(42, 256, 264, &Device::Cpu).unwrap();
        let c = seeded_noise(43, 256, 264, &Device::Cpu).unwrap();
        assert_eq!(a.dims(), &[1, 16, 32, 34]);
        let a = a.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(a, b.flatten_all().unwrap().to_vec1::<f32>().unwrap());
        assert_ne!(a, c.flatten_all().unwrap().to_vec1::<f32>().unwrap());
    }

    #[test]
    fn only_native_attention_is_offered() {
        let native = PerformanceFeature::AttentionBackend(AttentionBackend::Native);
        let flash = PerformanceFeature::AttentionBackend(AttentionBackend::Flash);
        assert_eq!(negotiate(native), FeatureSupport::Supported);
        assert!(matches!(negotiate(flash), FeatureSupport::Unsupported(r) if r.contains("flash")));
        assert!(matches!(
            negotiate(PerformanceFeature::Compile),
            FeatureSupport::Unsupported(_)
        ));
    }
}
