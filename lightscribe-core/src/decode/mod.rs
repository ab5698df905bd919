//! Batched autoregressive decoding.
//!
//! ## Lock-step loop
//!
//! ```text
//! prefix (prompt · SOT · lang · task) ──► N × DecodeState
//!        │
//!        ▼  every step: one forward() over the live rows only
//!   logits ─► LogitPolicy (suppress / timestamp rules) ─► log_softmax (f64)
//!        │                                                  │
//!        ▼                                                  ▼
//!   argmax (T = 0) or temperature sampling        cumulative log-prob
//!        │
//!        ▼
//!   EOT / token budget / repetition ─► finished (frozen, left out of compute)
//! ```
//!
//! After the batch, each sequence whose average log-probability falls below
//! the threshold (or that looped) is re-decoded alone at the next
//! temperature of the ladder; the best attempt is kept.

pub mod batch;
pub mod language;
pub mod policy;

pub use batch::BatchedDecoder;
pub use language::{detect_language, DetectedLanguage};

use serde::{Deserialize, Serialize};

use crate::inference::{KvCache, DecoderRow, TokenId};

/// Transcribe in the spoken language or translate to English.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Task {
    #[default]
    Transcribe,
    Translate,
}

/// Why a sequence stopped growing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FinishReason {
    /// Emitted end-of-text.
    EndOfText,
    /// Reached the per-sequence token budget.
    TokenBudget,
    /// The generated tail kept repeating a short pattern.
    Repetition,
    /// The hard step ceiling ended the batch first. Output is partial.
    StepLimit,
}

/// Resolved settings for one decoder run.
#[derive(Debug, Clone)]
pub struct DecodingOptions {
    pub task: Task,
    /// Language code for the prefix; `None` on English-only models.
    pub language: Option<String>,
    /// First entry decodes the batch; the rest form the fallback ladder.
    pub temperatures: Vec<f32>,
    /// Maximum generated tokens per sequence.
    pub sample_len: usize,
    /// Hard ceiling on lock-step iterations.
    pub max_steps: usize,
    pub without_timestamps: bool,
    /// Suppressed at every step. `None` uses the tokenizer's non-speech set.
    pub suppress_tokens: Option<Vec<TokenId>>,
    pub suppress_blank: bool,
    /// Latest allowed first timestamp, in seconds.
    pub max_initial_timestamp: Option<f32>,
    /// Average log-probability below which a sequence is re-decoded.
    pub logprob_threshold: Option<f64>,
    pub max_fallback_attempts: usize,
    /// Stop a sequence whose tail loops on a short pattern.
    pub break_on_repetition: bool,
    pub seed: Option<u64>,
}

impl Default for DecodingOptions {
    fn default() -> Self {
        Self {
            task: Task::Transcribe,
            language: Some("en".into()),
            temperatures: vec![0.0, 0.2, 0.4, 0.6, 0.8, 1.0],
            sample_len: 224,
            max_steps: 224,
            without_timestamps: false,
            suppress_tokens: None,
            suppress_blank: true,
            max_initial_timestamp: Some(1.0),
            logprob_threshold: Some(-1.0),
            max_fallback_attempts: 5,
            break_on_repetition: true,
            seed: None,
        }
    }
}

/// Per-sequence mutable record, alive for one batch.
#[derive(Debug)]
pub struct DecodeState {
    /// Prefix followed by every sampled token (EOT included once emitted).
    pub tokens: Vec<TokenId>,
    /// Length of the prefix inside `tokens`.
    pub sample_begin: usize,
    pub cumulative_logprob: f64,
    pub finished: Option<FinishReason>,
    pub kv_cache: KvCache,
    /// Row of the encoded batch this sequence reads.
    pub audio_row: usize,
}

impl DecodeState {
    pub fn new(audio_row: usize, prefix: Vec<TokenId>) -> Self {
        Self {
            sample_begin: prefix.len(),
            tokens: prefix,
            cumulative_logprob: 0.0,
            finished: None,
            kv_cache: KvCache::new(),
            audio_row,
        }
    }

    pub fn is_live(&self) -> bool {
        self.finished.is_none()
    }

    pub fn generated(&self) -> &[TokenId] {
        &self.tokens[self.sample_begin..]
    }

    pub(crate) fn as_row(&mut self) -> DecoderRow<'_> {
        DecoderRow {
            audio_row: self.audio_row,
            tokens: &self.tokens,
            kv_cache: &mut self.kv_cache,
        }
    }
}

/// What one sequence produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodingResult {
    /// Sampled tokens without the prefix and without end-of-text.
    pub tokens: Vec<TokenId>,
    pub sum_logprob: f64,
    pub avg_logprob: f64,
    pub temperature: f32,
    pub finish_reason: FinishReason,
    /// No attempt cleared the confidence threshold.
    pub low_confidence: bool,
    /// Decoding passes spent on this sequence (1 without fallback).
    pub attempts: usize,
}

impl DecodingResult {
    /// The step ceiling cut this sequence short.
    pub fn incomplete(&self) -> bool {
        self.finish_reason == FinishReason::StepLimit
    }

    pub(crate) fn from_state(state: DecodeState, eot: TokenId, temperature: f32) -> Self {
        let mut tokens = state.tokens[state.sample_begin..].to_vec();
        if let Some(pos) = tokens.iter().position(|&t| t == eot) {
            tokens.truncate(pos);
        }
        let avg_logprob = state.cumulative_logprob / (tokens.len() + 1) as f64;
        Self {
            tokens,
            sum_logprob: state.cumulative_logprob,
            avg_logprob,
            temperature,
            finish_reason: state.finished.unwrap_or(FinishReason::StepLimit),
            low_confidence: false,
            attempts: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_strips_prefix_and_eot() {
        let mut state = DecodeState::new(0, vec![9, 8, 7]);
        state.tokens.extend([1, 2, 50]);
        state.cumulative_logprob = -1.5;
        state.finished = Some(FinishReason::EndOfText);
        let r = DecodingResult::from_state(state, 50, 0.0);
        assert_eq!(r.tokens, vec![1, 2]);
        assert!((r.avg_logprob + 0.5).abs() < 1e-12);
        assert!(!r.incomplete());
    }

    #[test]
    fn unfinished_state_is_reported_as_step_limit() {
        let state = DecodeState::new(3, vec![1]);
        let r = DecodingResult::from_state(state, 50, 0.4);
        assert_eq!(r.finish_reason, FinishReason::StepLimit);
        assert!(r.incomplete());
        assert_eq!(r.temperature, 0.4);
    }

    #[test]
    fn task_serializes_lowercase() {
        assert_eq!(serde_json::to_value(Task::Translate).unwrap(), "translate");
    }
}
