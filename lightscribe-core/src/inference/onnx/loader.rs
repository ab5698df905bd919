//! `OnnxModelLoader` — registry lookup, download, session build.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use super::{HfTokenizer, OnnxSpeechModel};
use crate::error::LoadError;
use crate::inference::{ModelHandle, ModelLoader, ModelMetadata, TextTokenizer};
use crate::registry::{self, ModelSource, ResolvedModel};

const HF_ENDPOINT: &str = "https://huggingface.co";
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// The subset of a Whisper `config.json` the backend needs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct WhisperConfig {
    num_mel_bins: usize,
    vocab_size: usize,
    max_source_positions: usize,
    max_target_positions: usize,
}

impl Default for WhisperConfig {
    fn default() -> Self {
        let m = ModelMetadata::default();
        Self {
            num_mel_bins: m.n_mels,
            vocab_size: m.vocabulary_size,
            max_source_positions: m.max_audio_frames / 2,
            max_target_positions: m.max_text_context,
        }
    }
}

impl WhisperConfig {
    /// The encoder halves the mel frame rate, so one source position
    /// covers two frames.
    fn metadata(&self, tokenizer: &HfTokenizer) -> ModelMetadata {
        ModelMetadata {
            vocabulary_size: self.vocab_size,
            is_multilingual: self.vocab_size >= 51_865
                && tokenizer.special_tokens().languages.len() > 1,
            max_audio_frames: self.max_source_positions * 2,
            n_mels: self.num_mel_bins,
            max_text_context: self.max_target_positions,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OnnxModelLoader {
    models_dir: PathBuf,
    allow_download: bool,
    endpoint: String,
}

impl Default for OnnxModelLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl OnnxModelLoader {
    /// Models under [`registry::default_models_dir`], downloading missing
    /// files. `LIGHTSCRIBE_HF_ENDPOINT` overrides the hub address.
    pub fn new() -> Self {
        Self {
            models_dir: registry::default_models_dir(),
            allow_download: true,
            endpoint: std::env::var("LIGHTSCRIBE_HF_ENDPOINT")
                .ok()
                .map(|e| e.trim().trim_end_matches('/').to_string())
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| HF_ENDPOINT.to_string()),
        }
    }

    pub fn with_models_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.models_dir = dir.into();
        self
    }

    /// Never touch the network; missing files are `ModelNotFound`.
    pub fn offline(mut self) -> Self {
        self.allow_download = false;
        self
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    fn ensure_files(&self, model: &ResolvedModel) -> Result<(), LoadError> {
        let dir = model.dir();
        let missing: Vec<String> = model
            .required_files()
            .into_iter()
            .filter(|f| !dir.join(f).is_file())
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let not_found = || LoadError::ModelNotFound {
            model_id: model.model_id.clone(),
        };
        let repo = match &model.source {
            ModelSource::Hub { repo, .. } if self.allow_download => repo,
            _ => {
                warn!(model_id = %model.model_id, ?missing, dir = %dir.display(), "model files missing");
                return Err(not_found());
            }
        };

        let client = reqwest::blocking::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .map_err(|e| {
                warn!(error = %e, "download client build failed");
                not_found()
            })?;
        for file in &missing {
            let url = format!("{}/{repo}/resolve/main/{file}", self.endpoint);
            info!(model_id = %model.model_id, %url, "downloading model file");
            download(&client, &url, &dir.join(file)).map_err(|e| {
                warn!(model_id = %model.model_id, %url, error = %e, "model download failed");
                not_found()
            })?;
        }
        Ok(())
    }
}

/// Stream `url` into `dest` through a `.part` file renamed on success.
fn download(client: &reqwest::blocking::Client, url: &str, dest: &Path) -> anyhow::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let partial = dest.with_extension("part");
    let mut response = client.get(url).send()?.error_for_status()?;
    let mut file = fs::File::create(&partial)?;
    let bytes = response.copy_to(&mut file)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&partial, dest)?;
    info!(path = %dest.display(), bytes, "model file saved");
    Ok(())
}

fn read_config(path: &Path) -> io::Result<WhisperConfig> {
    let raw = fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

impl ModelLoader for OnnxModelLoader {
    fn load(&self, model_id: &str) -> Result<ModelHandle, LoadError> {
        let resolved = registry::resolve(model_id, &self.models_dir)?;
        self.ensure_files(&resolved)?;

        let dir = resolved.dir();
        let format_err = |reason: String| LoadError::ModelFormat {
            model_id: model_id.to_string(),
            reason,
        };
        let files = resolved.required_files();
        let (config, tokenizer, encoder, decoder) =
            (dir.join(&files[0]), dir.join(&files[1]), dir.join(&files[2]), dir.join(&files[3]));

        let config = read_config(&config).map_err(|e| format_err(format!("config.json: {e}")))?;
        let tokenizer = HfTokenizer::from_file(&tokenizer).map_err(|e| format_err(e.to_string()))?;
        let metadata = config.metadata(&tokenizer);
        if tokenizer.vocab_size() > metadata.vocabulary_size {
            return Err(format_err(format!(
                "tokenizer has {} entries but the model only {}",
                tokenizer.vocab_size(),
                metadata.vocabulary_size
            )));
        }

        let eot = tokenizer.special_tokens().eot;
        let model = OnnxSpeechModel::from_files(&encoder, &decoder, metadata.n_mels, eot)
            .map_err(|e| format_err(e.to_string()))?;
        info!(
            model_id,
            dir = %dir.display(),
            quantization = ?resolved.quantization,
            n_mels = metadata.n_mels,
            multilingual = metadata.is_multilingual,
            "ONNX model loaded"
        );
        Ok(ModelHandle::new(model, tokenizer, metadata))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_fills_missing_fields() {
        let cfg: WhisperConfig =
            serde_json::from_str(r#"{"num_mel_bins": 128, "vocab_size": 51866}"#).unwrap();
        assert_eq!(cfg.num_mel_bins, 128);
        assert_eq!(cfg.vocab_size, 51_866);
        assert_eq!(cfg.max_source_positions, 1_500);
        assert_eq!(cfg.max_target_positions, 448);
    }

    #[test]
    fn offline_loader_reports_missing_files_as_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let loader = OnnxModelLoader::new().with_models_dir(dir.path()).offline();
        assert_eq!(
            loader.load("tiny").unwrap_err(),
            LoadError::ModelNotFound {
                model_id: "tiny".into()
            }
        );
    }

    #[test]
    fn corrupt_local_model_is_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("onnx")).unwrap();
        for f in [
            "config.json",
            "tokenizer.json",
            "onnx/encoder_model.onnx",
            "onnx/decoder_model.onnx",
        ] {
            fs::write(dir.path().join(f), b"not a model").unwrap();
        }
        let id = dir.path().to_string_lossy().into_owned();
        let err = OnnxModelLoader::new().offline().load(&id).unwrap_err();
        assert!(matches!(err, LoadError::ModelFormat { .. }), "{err:?}");
    }
}
