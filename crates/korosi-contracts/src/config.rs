use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_MODEL_PATH: &str = "saved_model.onnx";
pub const DEFAULT_MODEL_URL: &str =
    "https://www.dropbox.com/scl/fi/y1vur4zdwhlik4pw2r73s/saved_model.keras?dl=1";
pub const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-1.5-flash";
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 900;

/// Process configuration assembled from the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub model_path: PathBuf,
    /// `None` means local-only provisioning: never download.
    pub model_url: Option<String>,
    pub model_sha256: Option<String>,
    pub download_timeout: Duration,
    pub gemini_api_key: Option<String>,
    pub gemini_api_base: String,
    pub gemini_model: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from(DEFAULT_MODEL_PATH),
            model_url: Some(DEFAULT_MODEL_URL.to_string()),
            model_sha256: None,
            download_timeout: Duration::from_secs(DEFAULT_DOWNLOAD_TIMEOUT_SECS),
            gemini_api_key: None,
            gemini_api_base: DEFAULT_GEMINI_API_BASE.to_string(),
            gemini_model: DEFAULT_GEMINI_MODEL.to_string(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = Self::default();

        Self {
            model_path: get("MODEL_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.model_path),
            model_url: get("MODEL_URL").or(defaults.model_url),
            model_sha256: get("MODEL_SHA256").map(|value| value.to_ascii_lowercase()),
            download_timeout: get("KOROSI_DOWNLOAD_TIMEOUT_SECS")
                .and_then(|value| value.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.download_timeout),
            gemini_api_key: get("GEMINI_API_KEY").or_else(|| get("GOOGLE_API_KEY")),
            gemini_api_base: get("GEMINI_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or(defaults.gemini_api_base),
            gemini_model: get("GEMINI_MODEL").unwrap_or(defaults.gemini_model),
        }
    }

    pub fn local_only(mut self) -> Self {
        self.model_url = None;
        self
    }

    pub fn has_api_key(&self) -> bool {
        self.gemini_api_key.is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::time::Duration;

    use super::*;

    fn settings_from(pairs: &[(&str, &str)]) -> Settings {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        Settings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let settings = settings_from(&[]);
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.model_url.as_deref(), Some(DEFAULT_MODEL_URL));
        assert!(!settings.has_api_key());
    }

    #[test]
    fn blank_values_count_as_unset() {
        let settings = settings_from(&[("GEMINI_API_KEY", "   "), ("MODEL_URL", "")]);
        assert_eq!(settings.gemini_api_key, None);
        assert_eq!(settings.model_url.as_deref(), Some(DEFAULT_MODEL_URL));
    }

    #[test]
    fn overrides_are_trimmed_and_normalized() {
        let settings = settings_from(&[
            ("MODEL_PATH", "/srv/models/corrosion.onnx"),
            ("MODEL_URL", " https://example.test/model.onnx "),
            ("MODEL_SHA256", "ABCDEF"),
            ("KOROSI_DOWNLOAD_TIMEOUT_SECS", "30"),
            ("GEMINI_API_BASE", "http://127.0.0.1:9000/v1beta/"),
            ("GEMINI_MODEL", "gemini-2.0-flash"),
        ]);
        assert_eq!(
            settings.model_path,
            PathBuf::from("/srv/models/corrosion.onnx")
        );
        assert_eq!(
            settings.model_url.as_deref(),
            Some("https://example.test/model.onnx")
        );
        assert_eq!(settings.model_sha256.as_deref(), Some("abcdef"));
        assert_eq!(settings.download_timeout, Duration::from_secs(30));
        assert_eq!(settings.gemini_api_base, "http://127.0.0.1:9000/v1beta");
        assert_eq!(settings.gemini_model, "gemini-2.0-flash");
    }

    #[test]
    fn google_api_key_is_fallback_credential() {
        let settings = settings_from(&[("GOOGLE_API_KEY", "g-key")]);
        assert_eq!(settings.gemini_api_key.as_deref(), Some("g-key"));

        let settings = settings_from(&[("GOOGLE_API_KEY", "g-key"), ("GEMINI_API_KEY", "k")]);
        assert_eq!(settings.gemini_api_key.as_deref(), Some("k"));
    }

    #[test]
    fn invalid_timeout_falls_back_to_default() {
        let settings = settings_from(&[("KOROSI_DOWNLOAD_TIMEOUT_SECS", "0")]);
        assert_eq!(
            settings.download_timeout,
            Duration::from_secs(DEFAULT_DOWNLOAD_TIMEOUT_SECS)
        );
        let settings = settings_from(&[("KOROSI_DOWNLOAD_TIMEOUT_SECS", "soon")]);
        assert_eq!(
            settings.download_timeout,
            Duration::from_secs(DEFAULT_DOWNLOAD_TIMEOUT_SECS)
        );
    }

    #[test]
    fn local_only_drops_url() {
        let settings = settings_from(&[("MODEL_URL", "https://example.test/m.onnx")]).local_only();
        assert_eq!(settings.model_url, None);
    }
}
