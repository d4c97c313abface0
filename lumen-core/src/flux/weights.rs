use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use hf_hub::api::tokio::Api;
use hf_hub::{Repo, RepoType};

use crate::ModelFamily;

/// Local paths of everything a FLUX pipeline is built from.
pub(super) struct FluxFiles {
    pub t5_weights: PathBuf,
    pub t5_config: PathBuf,
    pub t5_tokenizer: PathBuf,
    pub clip_weights: PathBuf,
    pub clip_tokenizer: PathBuf,
    pub autoencoder: PathBuf,
    pub transformer: PathBuf,
}

impl FluxFiles {
    pub async fn fetch(api: &Api, model_id: &str, family: ModelFamily) -> Result<Self> {
        let t5_repo = api.repo(Repo::with_revision(
            "google/t5-v1_1-xxl".to_string(),
            RepoType::Model,
            "refs/pr/2".to_string(),
        ));
        let t5_weights = t5_repo
            .get("model.safetensors")
            .await
            .context("failed to get T5 model file")?;
        let t5_config = t5_repo
            .get("config.json")
            .await
            .context("failed to get T5 config")?;
        let t5_tokenizer = api
            .model("lmz/mt5-tokenizers".to_string())
            .get("t5-v1_1-xxl.tokenizer.json")
            .await
            .context("failed to get T5 tokenizer")?;

        let clip_repo = api.repo(Repo::model("openai/clip-vit-large-patch14".to_string()));
        let clip_weights = clip_repo
            .get("model.safetensors")
            .await
            .context("failed to get CLIP model file")?;
        let clip_tokenizer = clip_repo
            .get("tokenizer.json")
            .await
            .context("failed to get CLIP tokenizer")?;

        let bf_repo = api.repo(Repo::model(model_id.to_string()));
        let autoencoder = bf_repo
            .get("ae.safetensors")
            .await
            .context("failed to get autoencoder model file")?;
        let transformer_file = match family {
            ModelFamily::FluxSchnell => "flux1-schnell.safetensors",
            ModelFamily::FluxDev => "flux1-dev.safetensors",
        };
        let transformer = bf_repo
            .get(transformer_file)
            .await
            .context("failed to get flux model file")?;

        Ok(Self {
            t5_weights,
            t5_config,
            t5_tokenizer,
            clip_weights,
            clip_tokenizer,
            autoencoder,
            transformer,
        })
    }
}

/// One var builder per model component.
pub(super) struct ComponentBuilders {
    pub t5: VarBuilder<'static>,
    pub clip: VarBuilder<'static>,
    pub autoencoder: VarBuilder<'static>,
    pub transformer: VarBuilder<'static>,
}

impl ComponentBuilders {
    /// Maps the files straight onto `device`, skipping the host copy.
    pub fn mmaped(files: &FluxFiles, dtype: DType, device: &Device) -> Result<Self> {
        let mmap = |path: &Path, what: &str| -> Result<VarBuilder<'static>> {
            unsafe { VarBuilder::from_mmaped_safetensors(&[path], dtype, device) }
                .with_context(|| format!("failed to build {what} var builder"))
        };
        Ok(Self {
            t5: mmap(&files.t5_weights, "T5")?,
            clip: mmap(&files.clip_weights, "CLIP")?,
            autoencoder: mmap(&files.autoencoder, "autoencoder")?,
            transformer: mmap(&files.transformer, "flux")?,
        })
    }
}

/// Weights held in host memory so the accelerator copy can be rebuilt
/// without touching disk.
pub(super) struct HostWeights {
    t5: HashMap<String, Tensor>,
    clip: HashMap<String, Tensor>,
    autoencoder: HashMap<String, Tensor>,
    transformer: HashMap<String, Tensor>,
}

impl HostWeights {
    pub fn load(files: &FluxFiles, dtype: DType) -> Result<Self> {
        Ok(Self {
            t5: load_host(&files.t5_weights, dtype)?,
            clip: load_host(&files.clip_weights, dtype)?,
            autoencoder: load_host(&files.autoencoder, dtype)?,
            transformer: load_host(&files.transformer, dtype)?,
        })
    }

    /// Builders that copy each tensor onto `device` as the model asks for it.
    pub fn builders(&self, dtype: DType, device: &Device) -> ComponentBuilders {
        let from = |tensors: &HashMap<String, Tensor>| {
            VarBuilder::from_tensors(tensors.clone(), dtype, device)
        };
        ComponentBuilders {
            t5: from(&self.t5),
            clip: from(&self.clip),
            autoencoder: from(&self.autoencoder),
            transformer: from(&self.transformer),
        }
    }
}

fn load_host(path: &Path, dtype: DType) -> Result<HashMap<String, Tensor>> {
    let tensors = candle_core::safetensors::load(path, &Device::Cpu)
        .with_context(|| format!("failed to read {}", path.display()))?;
    tensors
        .into_iter()
        .map(|(name, tensor)| Ok((name, tensor.to_dtype(dtype)?)))
        .collect()
}
