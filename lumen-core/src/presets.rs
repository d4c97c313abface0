//! Named parameter presets and the built-in resolution table.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::history::write_json;
use crate::request::check_dimension;
use crate::{LumenError, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresetParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance_scale: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_images: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enhance_prompt: Option<bool>,
}

#[derive(Debug)]
pub struct PresetBook {
    path: Option<PathBuf>,
    presets: Mutex<BTreeMap<String, PresetParams>>,
}

impl PresetBook {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let presets = match std::fs::read_to_string(&path) {
            Ok(json) => serde_json::from_str(&json)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(LumenError::persist(&path, e)),
        };
        Ok(Self {
            path: Some(path),
            presets: Mutex::new(presets),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            presets: Mutex::new(BTreeMap::new()),
        }
    }

    /// Inserts or replaces the preset called `name`.
    pub fn upsert(&self, name: &str, params: PresetParams) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(LumenError::validation("name", "preset name is empty"));
        }
        if let Some(width) = params.width {
            check_dimension("width", width)?;
        }
        if let Some(height) = params.height {
            check_dimension("height", height)?;
        }
        let mut presets = self.presets.lock().unwrap_or_else(|e| e.into_inner());
        presets.insert(name.to_string(), params);
        self.persist(&presets)
    }

    pub fn list(&self) -> BTreeMap<String, PresetParams> {
        self.presets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Returns whether a preset was removed.
    pub fn delete(&self, name: &str) -> Result<bool> {
        let mut presets = self.presets.lock().unwrap_or_else(|e| e.into_inner());
        let removed = presets.remove(name).is_some();
        if removed {
            self.persist(&presets)?;
        }
        Ok(removed)
    }

    fn persist(&self, presets: &BTreeMap<String, PresetParams>) -> Result<()> {
        match &self.path {
            Some(path) => write_json(path, presets),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Resolution {
    pub aspect: &'static str,
    pub width: usize,
    pub height: usize,
    pub label: &'static str,
}

const fn res(aspect: &'static str, width: usize, height: usize, label: &'static str) -> Resolution {
    Resolution {
        aspect,
        width,
        height,
        label,
    }
}

/// Common sizes grouped by aspect ratio; all are multiples of 16.
pub const RESOLUTIONS: &[Resolution] = &[
    res("1:1", 512, 512, "Small square"),
    res("1:1", 768, 768, "Medium square"),
    res("1:1", 1024, 1024, "Standard square"),
    res("1:1", 1536, 1536, "Large square"),
    res("1:1", 2048, 2048, "Extra large square"),
    res("3:4", 768, 1024, "Small portrait"),
    res("3:4", 1152, 1536, "Medium portrait"),
    res("3:4", 1536, 2048, "Large portrait"),
    res("4:3", 1024, 768, "Small landscape"),
    res("4:3", 1536, 1152, "Medium landscape"),
    res("4:3", 2048, 1536, "Large landscape"),
    res("16:9", 1280, 720, "HD 720p"),
    res("16:9", 1920, 1088, "Full HD"),
    res("16:9", 2560, 1440, "QHD"),
    res("9:16", 720, 1280, "Vertical HD"),
    res("9:16", 1088, 1920, "Vertical Full HD"),
    res("9:16", 1440, 2560, "Vertical QHD"),
    res("21:9", 1344, 576, "Small ultrawide"),
    res("21:9", 1680, 720, "Medium ultrawide"),
    res("21:9", 2352, 1008, "Large ultrawide"),
    res("9:21", 576, 1344, "Vertical small ultrawide"),
    res("9:21", 720, 1680, "Vertical medium ultrawide"),
    res("32:9", 1792, 512, "Small extreme wide"),
    res("32:9", 2560, 720, "Medium extreme wide"),
    res("9:32", 512, 1792, "Vertical small extreme wide"),
];
