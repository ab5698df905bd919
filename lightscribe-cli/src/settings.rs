//! Persistent CLI settings (JSON file), overridable per run by flags.

use std::fs;
use std::path::{Path, PathBuf};

use lightscribe_core::{TranscribeOptions, TranscriberConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct CliSettings {
    pub model: String,
    pub models_dir: Option<PathBuf>,
    /// Never download; only use files already on disk.
    pub offline: bool,
    pub cache_capacity: usize,
    pub context_tokens: usize,
    pub audio_cache_dir: Option<PathBuf>,
    pub transcribe: TranscribeOptions,
}

impl Default for CliSettings {
    fn default() -> Self {
        let config = TranscriberConfig::default();
        Self {
            model: "small".into(),
            models_dir: None,
            offline: false,
            cache_capacity: config.cache_capacity,
            context_tokens: config.context_tokens,
            audio_cache_dir: None,
            transcribe: TranscribeOptions::default(),
        }
    }
}

impl CliSettings {
    pub fn normalize(&mut self) {
        self.model = normalize_model_name(&self.model);
        self.cache_capacity = self.cache_capacity.clamp(1, 8);
        self.context_tokens = self.context_tokens.min(447);
        self.models_dir = self.models_dir.take().filter(|p| !p.as_os_str().is_empty());
        self.audio_cache_dir = self
            .audio_cache_dir
            .take()
            .filter(|p| !p.as_os_str().is_empty());

        let t = &mut self.transcribe;
        t.batch_size = t.batch_size.clamp(1, 64);
        t.language = t
            .language
            .as_ref()
            .map(|l| l.trim().to_ascii_lowercase())
            .filter(|l| !l.is_empty());
        t.initial_prompt = t
            .initial_prompt
            .as_ref()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());
    }

    /// Core configuration; environment overrides still apply on top.
    pub fn transcriber_config(&self) -> TranscriberConfig {
        let env = TranscriberConfig::from_env();
        TranscriberConfig {
            cache_capacity: self.cache_capacity,
            context_tokens: self.context_tokens,
            audio_cache_dir: self.audio_cache_dir.clone().or(env.audio_cache_dir),
        }
    }
}

/// Accept common aliases of catalog names, keeping any `@quant` suffix.
/// Local model directories pass through untouched.
pub fn normalize_model_name(raw: &str) -> String {
    if Path::new(raw.trim()).is_dir() {
        return raw.trim().to_string();
    }
    let raw = raw.trim().to_ascii_lowercase();
    let (name, quant) = match raw.split_once('@') {
        Some((name, quant)) => (name.to_string(), Some(quant.to_string())),
        None => (raw.clone(), None),
    };
    let name = match name.trim_start_matches("whisper-") {
        "" => "small".to_string(),
        "turbo" => "large-v3-turbo".to_string(),
        "large" => "large-v3".to_string(),
        "distil" => "distil-large-v3".to_string(),
        other => match other.strip_suffix("-en") {
            Some(base) => format!("{base}.en"),
            None => other.to_string(),
        },
    };
    match quant {
        Some(q) => format!("{name}@{q}"),
        None => name,
    }
}

pub fn load_settings(path: &Path) -> CliSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<CliSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &CliSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}
