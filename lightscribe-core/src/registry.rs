//! Named model catalog and model-id resolution.
//!
//! A model id is either a catalog name with an optional quantization
//! suffix (`small`, `small@q8`, `large-v3@fp16`) or the path of a local
//! directory holding an exported model.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::LoadError;

/// Weight precision of the ONNX export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Quantization {
    Full,
    Fp16,
    Q8,
}

impl Quantization {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "full" | "fp32" => Some(Self::Full),
            "fp16" | "f16" => Some(Self::Fp16),
            "q8" | "int8" | "8bit" => Some(Self::Q8),
            _ => None,
        }
    }

    /// Suffix of the exported `.onnx` file names.
    pub fn file_suffix(self) -> &'static str {
        match self {
            Self::Full => "",
            Self::Fp16 => "_fp16",
            Self::Q8 => "_quantized",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSpec {
    pub name: &'static str,
    pub repo: &'static str,
    pub english_only: bool,
    pub quantizations: &'static [Quantization],
}

const ALL: &[Quantization] = &[Quantization::Full, Quantization::Fp16, Quantization::Q8];
const FULL_ONLY: &[Quantization] = &[Quantization::Full];

const fn spec(
    name: &'static str,
    repo: &'static str,
    english_only: bool,
    quantizations: &'static [Quantization],
) -> ModelSpec {
    ModelSpec {
        name,
        repo,
        english_only,
        quantizations,
    }
}

static CATALOG: &[ModelSpec] = &[
    spec("tiny", "onnx-community/whisper-tiny", false, ALL),
    spec("tiny.en", "onnx-community/whisper-tiny.en", true, ALL),
    spec("base", "onnx-community/whisper-base", false, ALL),
    spec("base.en", "onnx-community/whisper-base.en", true, ALL),
    spec("small", "onnx-community/whisper-small", false, ALL),
    spec("small.en", "onnx-community/whisper-small.en", true, ALL),
    spec("medium", "onnx-community/whisper-medium-ONNX", false, ALL),
    spec("medium.en", "onnx-community/whisper-medium.en", true, ALL),
    spec("large-v2", "onnx-community/whisper-large-v2", false, ALL),
    spec("large-v3", "onnx-community/whisper-large-v3", false, ALL),
    spec("large-v3-turbo", "onnx-community/whisper-large-v3-turbo", false, ALL),
    spec("distil-small.en", "distil-whisper/distil-small.en", true, FULL_ONLY),
    spec("distil-medium.en", "distil-whisper/distil-medium.en", true, FULL_ONLY),
    spec("distil-large-v2", "distil-whisper/distil-large-v2", false, FULL_ONLY),
    spec("distil-large-v3", "distil-whisper/distil-large-v3", false, FULL_ONLY),
];

pub fn catalog() -> &'static [ModelSpec] {
    CATALOG
}

/// Where a resolved model's files come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// Hugging Face hub repository, cached under `cache_dir`.
    Hub { repo: String, cache_dir: PathBuf },
    Local(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModel {
    pub model_id: String,
    pub source: ModelSource,
    pub quantization: Quantization,
}

impl ResolvedModel {
    /// Directory the model files live in (or will be downloaded to).
    pub fn dir(&self) -> &Path {
        match &self.source {
            ModelSource::Hub { cache_dir, .. } => cache_dir,
            ModelSource::Local(dir) => dir,
        }
    }

    /// Repository-relative paths of every file the ONNX backend needs.
    pub fn required_files(&self) -> Vec<String> {
        let suffix = self.quantization.file_suffix();
        vec![
            "config.json".to_string(),
            "tokenizer.json".to_string(),
            format!("onnx/encoder_model{suffix}.onnx"),
            format!("onnx/decoder_model{suffix}.onnx"),
        ]
    }
}

/// Resolve `model_id` against the catalog, falling back to a local
/// directory. Hub models are cached under `models_dir`.
///
/// # Errors
/// `ModelNotFound` for unknown names, unknown quantizations, or a
/// quantization the model is not published in.
pub fn resolve(model_id: &str, models_dir: &Path) -> Result<ResolvedModel, LoadError> {
    let not_found = || LoadError::ModelNotFound {
        model_id: model_id.to_string(),
    };
    let trimmed = model_id.trim();
    let (name, quant) = match trimmed.rsplit_once('@') {
        Some((name, quant)) => (name, Quantization::parse(quant).ok_or_else(not_found)?),
        None => (trimmed, Quantization::Full),
    };

    if let Some(spec) = CATALOG.iter().find(|s| s.name.eq_ignore_ascii_case(name)) {
        if !spec.quantizations.contains(&quant) {
            return Err(not_found());
        }
        let dir_name = match quant {
            Quantization::Full => spec.name.to_string(),
            _ => format!("{}{}", spec.name, quant.file_suffix()),
        };
        return Ok(ResolvedModel {
            model_id: trimmed.to_string(),
            source: ModelSource::Hub {
                repo: spec.repo.to_string(),
                cache_dir: models_dir.join(dir_name),
            },
            quantization: quant,
        });
    }

    let local = PathBuf::from(name);
    if local.is_dir() {
        return Ok(ResolvedModel {
            model_id: trimmed.to_string(),
            source: ModelSource::Local(local),
            quantization: quant,
        });
    }
    Err(not_found())
}

/// `LIGHTSCRIBE_MODEL_DIR`, else the platform data directory.
pub fn default_models_dir() -> PathBuf {
    if let Ok(explicit) = std::env::var("LIGHTSCRIBE_MODEL_DIR") {
        if !explicit.trim().is_empty() {
            return PathBuf::from(explicit.trim());
        }
    }
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(|p| PathBuf::from(p).join("Lightscribe").join("models"))
            .unwrap_or_else(|| PathBuf::from("models"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("lightscribe")
            .join("models")
    }
}
