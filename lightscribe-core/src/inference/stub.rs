//! `StubModel` — deterministic backend that needs no model files.
//!
//! Every encoded window decodes to one timestamped segment,
//! `<|0.00|> stub window N <|30.00|>`, where `N` counts windows across the
//! model's lifetime. The closing timestamp is clamped to the window's real
//! audio by the segment assembler. Lets the CLI (`--stub`) and tests run the
//! full pipeline end-to-end.

use ndarray::{Array2, Array3, ArrayView3};
use tracing::debug;

use super::{
    DecoderRow, EncodedAudio, ModelHandle, ModelLoader, ModelMetadata, SpecialTokens, SpeechModel,
    TextTokenizer, TokenId,
};
use crate::error::{LoadError, Result, ScribeError};

/// Byte-level text tokens occupy `0..256`.
const EOT: TokenId = 256;
const TIMESTAMP_BEGIN: TokenId = 264;
/// 30 s in 0.02 s steps.
const LAST_TIMESTAMP: TokenId = 1_500;
const VOCAB: usize = (TIMESTAMP_BEGIN + LAST_TIMESTAMP + 1) as usize;

fn stub_specials() -> SpecialTokens {
    SpecialTokens {
        eot: EOT,
        sot: 257,
        sot_prev: 258,
        transcribe: 259,
        translate: 260,
        no_timestamps: 261,
        no_speech: Some(262),
        timestamp_begin: TIMESTAMP_BEGIN,
        blank: Some(u32::from(b' ')),
        languages: vec![("en".into(), 263)],
        non_speech: Vec::new(),
    }
}

pub fn stub_metadata() -> ModelMetadata {
    ModelMetadata {
        vocabulary_size: VOCAB,
        ..ModelMetadata::default()
    }
}

/// A fresh stub model and tokenizer behind one handle.
pub fn stub_handle() -> ModelHandle {
    ModelHandle::new(StubModel::new(), StubTokenizer::new(), stub_metadata())
}

/// Byte-level tokenizer matching [`StubModel`]'s vocabulary.
#[derive(Debug, Clone)]
pub struct StubTokenizer {
    specials: SpecialTokens,
}

impl StubTokenizer {
    pub fn new() -> Self {
        Self {
            specials: stub_specials(),
        }
    }
}

impl Default for StubTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl TextTokenizer for StubTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>> {
        Ok(text.bytes().map(TokenId::from).collect())
    }

    fn decode(&self, tokens: &[TokenId]) -> Result<String> {
        let bytes = tokens
            .iter()
            .map(|&t| {
                u8::try_from(t).map_err(|_| ScribeError::Inference(format!("token {t} is not text")))
            })
            .collect::<Result<Vec<u8>>>()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn special_tokens(&self) -> &SpecialTokens {
        &self.specials
    }
}

pub struct StubModel {
    specials: SpecialTokens,
    windows_encoded: usize,
}

impl StubModel {
    pub fn new() -> Self {
        Self {
            specials: stub_specials(),
            windows_encoded: 0,
        }
    }

    fn script(&self, window: usize, timestamps: bool) -> Vec<TokenId> {
        let mut tokens = Vec::new();
        if timestamps {
            tokens.push(TIMESTAMP_BEGIN);
        }
        tokens.extend(format!("stub window {window}").bytes().map(TokenId::from));
        if timestamps {
            tokens.push(TIMESTAMP_BEGIN + LAST_TIMESTAMP);
        }
        tokens
    }
}

impl Default for StubModel {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeechModel for StubModel {
    fn encode(&mut self, mel: ArrayView3<'_, f32>) -> Result<EncodedAudio> {
        let batch = mel.shape()[0];
        let mut features = Array3::zeros((batch, 1, 1));
        for b in 0..batch {
            features[[b, 0, 0]] = (self.windows_encoded + b) as f32;
        }
        self.windows_encoded += batch;
        debug!(batch, "StubModel::encode");
        Ok(EncodedAudio::new(features))
    }

    fn forward(&mut self, audio: &EncodedAudio, rows: &mut [DecoderRow<'_>]) -> Result<Array2<f32>> {
        let mut logits = Array2::zeros((rows.len(), VOCAB));
        for (i, row) in rows.iter_mut().enumerate() {
            if row.tokens == [self.specials.sot] {
                logits[[i, self.specials.languages[0].1 as usize]] = 10.0;
                continue;
            }
            if row.kv_cache.is_empty() {
                row.kv_cache.insert(0usize);
            }
            let Some(step) = row.kv_cache.get_mut::<usize>() else {
                return Err(ScribeError::Inference("foreign decoder state".into()));
            };
            let window = audio
                .features
                .get([row.audio_row, 0, 0])
                .copied()
                .unwrap_or_default() as usize;
            let timestamps = !row.tokens.contains(&self.specials.no_timestamps);
            let next = self
                .script(window, timestamps)
                .get(*step)
                .copied()
                .unwrap_or(EOT);
            logits[[i, next as usize]] = 10.0;
            *step += 1;
        }
        Ok(logits)
    }
}

/// Loader that answers every model id with a fresh stub.
#[derive(Debug, Clone, Copy, Default)]
pub struct StubLoader;

impl ModelLoader for StubLoader {
    fn load(&self, model_id: &str) -> std::result::Result<ModelHandle, LoadError> {
        debug!(model_id, "StubLoader::load");
        Ok(stub_handle())
    }
}
