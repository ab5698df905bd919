//! ONNX Runtime Whisper backend.
//!
//! Expects the Hugging Face export layout: `encoder_model*.onnx` with input
//! `input_features` and output `last_hidden_state`, `decoder_model*.onnx`
//! with inputs `input_ids`, `encoder_hidden_states` and output `logits`.
//!
//! The decoder is run over each row's full token history every step; rows
//! of different lengths are right-padded and logits are read at each row's
//! last real position. The causal mask keeps padding from leaking into
//! earlier positions, so `DecoderRow::kv_cache` stays empty.

mod loader;
mod session;
mod tokenizer;

pub use loader::OnnxModelLoader;
pub use tokenizer::HfTokenizer;

use std::path::Path;

use ndarray::{Array2, Array3, ArrayView3, Axis};
use ort::session::Session;
use ort::value::{TensorRef, Value};
use tracing::debug;

use self::session::{create_session, SessionTuning};
use super::{DecoderRow, EncodedAudio, SpeechModel, TokenId};
use crate::error::{Result, ScribeError};

fn session_err(e: ort::Error) -> ScribeError {
    ScribeError::OnnxSession(e.to_string())
}

pub struct OnnxSpeechModel {
    encoder: Session,
    decoder: Session,
    n_mels: usize,
    /// Token written into padded positions; never read back.
    pad_token: TokenId,
}

impl OnnxSpeechModel {
    /// Build encoder and decoder sessions, tuned from the environment.
    ///
    /// # Errors
    /// `OnnxSession` when either graph fails to load.
    pub fn from_files(
        encoder_path: &Path,
        decoder_path: &Path,
        n_mels: usize,
        pad_token: TokenId,
    ) -> Result<Self> {
        let tuning = SessionTuning::from_env();
        Ok(Self {
            encoder: create_session(encoder_path, tuning)?,
            decoder: create_session(decoder_path, tuning)?,
            n_mels,
            pad_token,
        })
    }
}

impl SpeechModel for OnnxSpeechModel {
    fn encode(&mut self, mel: ArrayView3<'_, f32>) -> Result<EncodedAudio> {
        if mel.shape()[1] != self.n_mels {
            return Err(ScribeError::Inference(format!(
                "encoder expects {} mel bins, got {}",
                self.n_mels,
                mel.shape()[1]
            )));
        }
        let batch = mel.shape()[0];
        let mel_val = Value::from_array(mel.to_owned()).map_err(session_err)?;
        let out = self
            .encoder
            .run(ort::inputs!["input_features" => mel_val])
            .map_err(session_err)?;
        let (shape, data) = out["last_hidden_state"]
            .try_extract_tensor::<f32>()
            .map_err(session_err)?;

        if shape.len() != 3 || shape[0] as usize != batch {
            return Err(ScribeError::Inference(format!(
                "unexpected encoder output shape {:?} for batch {batch}",
                &shape[..]
            )));
        }
        let (frames, d_model) = (shape[1] as usize, shape[2] as usize);
        let features = Array3::from_shape_vec((batch, frames, d_model), data.to_vec())
            .map_err(|e| ScribeError::Inference(e.to_string()))?;
        debug!(batch, frames, d_model, "encoder pass");
        Ok(EncodedAudio::new(features))
    }

    fn forward(&mut self, audio: &EncodedAudio, rows: &mut [DecoderRow<'_>]) -> Result<Array2<f32>> {
        let n = rows.len();
        let seq = rows.iter().map(|r| r.tokens.len()).max().unwrap_or(0);
        if n == 0 || rows.iter().any(|r| r.tokens.is_empty()) {
            return Err(ScribeError::Inference("decoder called without tokens".into()));
        }
        if let Some(row) = rows.iter().find(|r| r.audio_row >= audio.batch_len()) {
            return Err(ScribeError::Inference(format!(
                "row refers to audio {} of {}",
                row.audio_row,
                audio.batch_len()
            )));
        }

        let mut input_ids = vec![i64::from(self.pad_token); n * seq];
        for (i, row) in rows.iter().enumerate() {
            for (j, &t) in row.tokens.iter().enumerate() {
                input_ids[i * seq + j] = i64::from(t);
            }
        }
        let audio_rows: Vec<usize> = rows.iter().map(|r| r.audio_row).collect();
        let hidden = audio.features.select(Axis(0), &audio_rows);

        let input_ids =
            TensorRef::from_array_view(([n as i64, seq as i64], input_ids.as_slice()))
                .map_err(session_err)?;
        let hidden = Value::from_array(hidden).map_err(session_err)?;
        let out = self
            .decoder
            .run(ort::inputs![
                "input_ids"             => input_ids,
                "encoder_hidden_states" => hidden,
            ])
            .map_err(session_err)?;
        let (shape, data) = out["logits"]
            .try_extract_tensor::<f32>()
            .map_err(session_err)?;
        if shape.len() != 3 || shape[0] as usize != n || shape[1] as usize != seq {
            return Err(ScribeError::Inference(format!(
                "unexpected logits shape {:?} for {n} rows of {seq} tokens",
                &shape[..]
            )));
        }

        let vocab = shape[2] as usize;
        let mut logits = Array2::<f32>::zeros((n, vocab));
        for (i, row) in rows.iter().enumerate() {
            let start = (i * seq + row.tokens.len() - 1) * vocab;
            logits
                .row_mut(i)
                .assign(&ndarray::ArrayView1::from(&data[start..start + vocab]));
        }
        Ok(logits)
    }
}
