use serde::{Deserialize, Serialize};

use crate::{Capabilities, LumenError, Result};

pub const DIMENSION_ALIGN: usize = 16;
pub const MIN_DIMENSION: usize = 256;
pub const MAX_DIMENSION: usize = 4096;
pub const DEFAULT_DIMENSION: usize = 1024;
pub const MAX_STEPS: usize = 100;
pub const MAX_GUIDANCE: f64 = 30.0;
pub const MAX_IMAGES: usize = 12;
/// Seed value asking for a freshly drawn seed per image.
pub const RANDOM_SEED: i64 = -1;

const QUALITY_PREFIX: &str = "masterpiece, best quality, highly detailed, sharp focus, ";

/// Art styles whose keywords are appended to the prompt.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PromptStyle {
    #[default]
    Photorealistic,
    Anime,
    #[serde(alias = "oil painting")]
    OilPainting,
    #[serde(alias = "digital art")]
    DigitalArt,
    Watercolor,
    Sketch,
}

impl PromptStyle {
    pub fn keywords(self) -> &'static str {
        match self {
            Self::Photorealistic => {
                "masterpiece, highly detailed, 8k, photorealistic, professional photography"
            }
            Self::Anime => "anime style, highly detailed, vibrant colors, studio quality",
            Self::OilPainting => {
                "oil painting, classical art style, rich colors, textured brushstrokes"
            }
            Self::DigitalArt => {
                "digital art, concept art, highly detailed, trending on artstation"
            }
            Self::Watercolor => "watercolor painting, soft colors, artistic, delicate brushwork",
            Self::Sketch => "pencil sketch, detailed linework, artistic drawing",
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default)]
    pub width: Option<usize>,
    #[serde(default)]
    pub height: Option<usize>,
    #[serde(default, alias = "num_inference_steps")]
    pub steps: Option<usize>,
    #[serde(default, alias = "guidance")]
    pub guidance_scale: Option<f64>,
    #[serde(default = "random_seed")]
    pub seed: i64,
    #[serde(default = "single_image")]
    pub num_images: usize,
    /// Overrides the configured default model.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub enhance_prompt: bool,
    #[serde(default)]
    pub style: Option<PromptStyle>,
}

fn random_seed() -> i64 {
    RANDOM_SEED
}

fn single_image() -> usize {
    1
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            width: None,
            height: None,
            steps: None,
            guidance_scale: None,
            seed: RANDOM_SEED,
            num_images: 1,
            model: None,
            enhance_prompt: false,
            style: None,
        }
    }

    /// Checks every bound; nothing here touches the residency slot.
    pub fn validate(&self) -> Result<()> {
        if self.prompt.trim().is_empty() {
            return Err(LumenError::validation("prompt", "prompt is empty"));
        }
        check_dimension("width", self.width())?;
        check_dimension("height", self.height())?;
        if let Some(steps) = self.steps {
            if !(1..=MAX_STEPS).contains(&steps) {
                return Err(LumenError::validation(
                    "steps",
                    format!("must be between 1 and {MAX_STEPS}, got {steps}"),
                ));
            }
        }
        if let Some(guidance) = self.guidance_scale {
            if !guidance.is_finite() || !(0.0..=MAX_GUIDANCE).contains(&guidance) {
                return Err(LumenError::validation(
                    "guidance_scale",
                    format!("must be between 0 and {MAX_GUIDANCE}, got {guidance}"),
                ));
            }
        }
        if self.seed < RANDOM_SEED {
            return Err(LumenError::validation(
                "seed",
                format!("must be -1 or non-negative, got {}", self.seed),
            ));
        }
        if !(1..=MAX_IMAGES).contains(&self.num_images) {
            return Err(LumenError::validation(
                "num_images",
                format!("must be between 1 and {MAX_IMAGES}, got {}", self.num_images),
            ));
        }
        Ok(())
    }

    pub fn width(&self) -> usize {
        self.width.unwrap_or(DEFAULT_DIMENSION)
    }

    pub fn height(&self) -> usize {
        self.height.unwrap_or(DEFAULT_DIMENSION)
    }

    pub fn steps_for(&self, capabilities: &Capabilities) -> usize {
        self.steps.unwrap_or(capabilities.default_steps)
    }

    pub fn guidance_for(&self, capabilities: &Capabilities) -> f64 {
        self.guidance_scale.unwrap_or(capabilities.default_guidance)
    }

    /// The prompt actually sent to the pipeline.
    pub fn effective_prompt(&self) -> String {
        let mut prompt = if self.enhance_prompt {
            format!("{QUALITY_PREFIX}{}", self.prompt.trim())
        } else {
            self.prompt.trim().to_string()
        };
        if let Some(style) = self.style {
            prompt.push_str(", ");
            prompt.push_str(style.keywords());
        }
        prompt
    }

    /// Negative prompt, if non-blank.
    pub fn negative(&self) -> Option<&str> {
        self.negative_prompt
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

pub(crate) fn check_dimension(field: &'static str, value: usize) -> Result<()> {
    if value == 0 || value % DIMENSION_ALIGN != 0 {
        return Err(LumenError::validation(
            field,
            format!("must be a positive multiple of {DIMENSION_ALIGN}, got {value}"),
        ));
    }
    if !(MIN_DIMENSION..=MAX_DIMENSION).contains(&value) {
        return Err(LumenError::validation(
            field,
            format!("must be between {MIN_DIMENSION} and {MAX_DIMENSION}, got {value}"),
        ));
    }
    Ok(())
}

/// `-1` draws a fresh seed in `[0, 2^32)`, anything else is used verbatim.
pub fn resolve_seed(seed: i64) -> u64 {
    if seed == RANDOM_SEED {
        rand::random::<u32>() as u64
    } else {
        seed as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ModelFamily;

    fn sized(width: usize, height: usize) -> GenerationRequest {
        GenerationRequest {
            width: Some(width),
            height: Some(height),
            ..GenerationRequest::new("a lighthouse at dusk")
        }
    }

    #[test]
    fn dimensions_must_be_aligned_and_in_range() {
        assert!(sized(512, 768).validate().is_ok());
        assert!(sized(256, 4096).validate().is_ok());
        for (w, h) in [(500, 512), (512, 1000), (240, 512), (512, 4112), (0, 512)] {
            assert!(
                matches!(sized(w, h).validate(), Err(LumenError::Validation { .. })),
                "{w}x{h} should be rejected"
            );
        }
    }

    #[test]
    fn bounds_on_steps_images_guidance_and_seed() {
        let base = sized(512, 512);
        let cases = [
            GenerationRequest { steps: Some(0), ..base.clone() },
            GenerationRequest { steps: Some(MAX_STEPS + 1), ..base.clone() },
            GenerationRequest { num_images: 0, ..base.clone() },
            GenerationRequest { num_images: MAX_IMAGES + 1, ..base.clone() },
            GenerationRequest { guidance_scale: Some(f64::NAN), ..base.clone() },
            GenerationRequest { guidance_scale: Some(-1.0), ..base.clone() },
            GenerationRequest { seed: -2, ..base.clone() },
            GenerationRequest { prompt: "   ".into(), ..base.clone() },
        ];
        for case in cases {
            assert!(case.validate().is_err(), "{case:?}");
        }
        assert!(GenerationRequest { num_images: MAX_IMAGES, seed: 7, ..base }
            .validate()
            .is_ok());
    }

    #[test]
    fn wire_format_defaults_and_aliases() {
        let req: GenerationRequest = serde_json::from_str(
            r#"{"prompt":"cat","num_inference_steps":8,"negative_prompt":"  "}"#,
        )
        .unwrap();
        assert_eq!(req.steps, Some(8));
        assert_eq!(req.seed, RANDOM_SEED);
        assert_eq!(req.num_images, 1);
        assert_eq!(req.width(), DEFAULT_DIMENSION);
        assert_eq!(req.negative(), None);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn defaults_come_from_capabilities() {
        let caps = ModelFamily::FluxDev.capabilities();
        let req = GenerationRequest::new("x");
        assert_eq!(req.steps_for(&caps), 28);
        assert_eq!(req.guidance_for(&caps), 3.5);
    }

    #[test]
    fn seed_resolution() {
        assert_eq!(resolve_seed(42), 42);
        assert_eq!(resolve_seed(0), 0);
        for _ in 0..64 {
            assert!(resolve_seed(RANDOM_SEED) < (1u64 << 32));
        }
    }

    #[test]
    fn enhancement_prefixes_quality_keywords() {
        let mut req = GenerationRequest::new(" sunset over ocean ");
        assert_eq!(req.effective_prompt(), "sunset over ocean");
        req.enhance_prompt = true;
        let enhanced = req.effective_prompt();
        assert!(enhanced.starts_with(QUALITY_PREFIX));
        assert!(enhanced.ends_with("sunset over ocean"));
    }

    #[test]
    fn style_appends_its_keywords() {
        let req: GenerationRequest =
            serde_json::from_str(r#"{"prompt": "a fox", "style": "oil painting"}"#).unwrap();
        assert_eq!(req.style, Some(PromptStyle::OilPainting));
        assert_eq!(
            req.effective_prompt(),
            "a fox, oil painting, classical art style, rich colors, textured brushstrokes"
        );

        let req = GenerationRequest {
            enhance_prompt: true,
            style: Some(PromptStyle::Sketch),
            ..GenerationRequest::new("a fox")
        };
        let prompt = req.effective_prompt();
        assert!(prompt.starts_with(QUALITY_PREFIX));
        assert!(prompt.ends_with("a fox, pencil sketch, detailed linework, artistic drawing"));

        assert!(serde_json::from_str::<GenerationRequest>(r#"{"prompt": "a fox", "style": "cubism"}"#)
            .is_err());
    }
}
