use std::fs;
use std::path::PathBuf;

use serde_json::{json, Value};

use crate::classifier::{ModelLoader, ModelSignature};
use crate::provision::MIN_ARTIFACT_BYTES;
use korosi_contracts::Settings;

#[derive(Debug, Clone, PartialEq)]
pub enum LoadCheck {
    Skipped,
    Loaded(ModelSignature),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SystemStatus {
    pub model_path: PathBuf,
    pub model_size_bytes: Option<u64>,
    pub model_url: Option<String>,
    pub api_key_len: Option<usize>,
    pub load: LoadCheck,
}

impl SystemStatus {
    pub fn model_present(&self) -> bool {
        self.model_size_bytes.is_some()
    }

    pub fn model_size_ok(&self) -> bool {
        self.model_size_bytes
            .map(|size| size >= MIN_ARTIFACT_BYTES)
            .unwrap_or(false)
    }

    pub fn model_size_mb(&self) -> Option<f64> {
        self.model_size_bytes
            .map(|size| size as f64 / (1024.0 * 1024.0))
    }

    pub fn api_key_configured(&self) -> bool {
        self.api_key_len.is_some()
    }

    pub fn all_passed(&self) -> bool {
        self.model_size_ok()
            && self.api_key_configured()
            && !matches!(self.load, LoadCheck::Failed(_))
    }

    pub fn to_json(&self) -> Value {
        let load = match &self.load {
            LoadCheck::Skipped => json!({"status": "skipped"}),
            LoadCheck::Loaded(signature) => json!({
                "status": "loaded",
                "input_shape": signature.input,
                "output_shape": signature.output,
            }),
            LoadCheck::Failed(message) => json!({"status": "failed", "error": message}),
        };
        json!({
            "model_path": self.model_path.to_string_lossy(),
            "model_present": self.model_present(),
            "model_size_bytes": self.model_size_bytes,
            "model_size_ok": self.model_size_ok(),
            "model_url": self.model_url,
            "api_key_configured": self.api_key_configured(),
            "api_key_len": self.api_key_len,
            "load": load,
            "all_passed": self.all_passed(),
        })
    }
}

/// Inspects the local setup without touching the network. The API key is
/// reported by length only.
pub fn check_system(settings: &Settings, loader: Option<&dyn ModelLoader>) -> SystemStatus {
    let model_size_bytes = fs::metadata(&settings.model_path)
        .ok()
        .filter(|meta| meta.is_file())
        .map(|meta| meta.len());
    let load = match loader {
        None => LoadCheck::Skipped,
        Some(_) if model_size_bytes.is_none() => {
            LoadCheck::Failed("model file not found".to_string())
        }
        Some(loader) => match loader.load(&settings.model_path) {
            Ok(model) => LoadCheck::Loaded(model.signature()),
            Err(err) => LoadCheck::Failed(err.to_string()),
        },
    };
    SystemStatus {
        model_path: settings.model_path.clone(),
        model_size_bytes,
        model_url: settings.model_url.clone(),
        api_key_len: settings
            .gemini_api_key
            .as_ref()
            .map(|key| key.chars().count()),
        load,
    }
}
