//! Spoken-language detection from the first encoded window.

use tracing::debug;

use super::policy::log_softmax;
use crate::error::{Result, ScribeError};
use crate::inference::{DecoderRow, EncodedAudio, KvCache, ModelMetadata, SpecialTokens, SpeechModel};

/// Language assumed for English-only models and vocabularies without
/// language tokens.
pub const FALLBACK_LANGUAGE: &str = "en";

#[derive(Debug, Clone, PartialEq)]
pub struct DetectedLanguage {
    pub code: String,
    /// Probability mass of the winning token among language tokens.
    pub probability: f64,
}

/// Run one decoder step with `[SOT]` on batch row 0 of `audio` and pick the
/// most likely language token.
///
/// # Errors
/// Backend failures, or `Inference` if `audio` holds no rows.
pub fn detect_language(
    model: &mut dyn SpeechModel,
    audio: &EncodedAudio,
    specials: &SpecialTokens,
    metadata: &ModelMetadata,
) -> Result<DetectedLanguage> {
    if !metadata.is_multilingual || specials.languages.is_empty() {
        return Ok(DetectedLanguage {
            code: FALLBACK_LANGUAGE.to_string(),
            probability: 1.0,
        });
    }
    if audio.batch_len() == 0 {
        return Err(ScribeError::Inference(
            "language detection needs at least one encoded window".into(),
        ));
    }

    let prefix = [specials.sot];
    let mut cache = KvCache::new();
    let mut rows = [DecoderRow {
        audio_row: 0,
        tokens: &prefix,
        kv_cache: &mut cache,
    }];
    let logits = model.forward(audio, &mut rows)?;
    if logits.nrows() == 0 {
        return Err(ScribeError::Inference("empty logits for language detection".into()));
    }

    let row = logits.row(0);
    let candidates: Vec<f32> = specials
        .languages
        .iter()
        .map(|(_, t)| row.get(*t as usize).copied().unwrap_or(f32::NEG_INFINITY))
        .collect();
    let logprobs = log_softmax(&candidates);
    let (best, lp) = logprobs
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, lp)| lp.is_finite())
        .fold(None, |acc: Option<(usize, f64)>, (i, lp)| match acc {
            Some((_, b)) if b >= lp => acc,
            _ => Some((i, lp)),
        })
        .unwrap_or((0, f64::NEG_INFINITY));

    let code = specials.languages[best].0.clone();
    let probability = lp.exp();
    debug!(language = %code, probability, "detected language");
    Ok(DetectedLanguage { code, probability })
}
