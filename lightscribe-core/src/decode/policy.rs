//! Per-step logit filtering and token selection.
//!
//! Filters run in a fixed order on a copy of one row of logits:
//!
//! 1. blank / end-of-text suppression at the first sampled position;
//! 2. control tokens and the configured suppress set, at every step;
//! 3. timestamp rules: pairing, non-decreasing values, a leading timestamp
//!    no later than `max_initial_timestamp`, and timestamps winning over
//!    text when their total probability dominates.
//!
//! Log-probabilities are computed in f64 from the filtered row.

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;

use super::DecodingOptions;
use crate::audio::{FRAMES_PER_SECOND, FRAMES_PER_TIMESTAMP};
use crate::inference::{SpecialTokens, TokenId};

/// Shortest loop (in tokens) the repetition guard reacts to.
const MIN_LOOP_TOKENS: usize = 16;
const MAX_LOOP_PATTERN: usize = 8;

pub struct LogitPolicy {
    eot: TokenId,
    timestamp_begin: TokenId,
    blank: Option<TokenId>,
    suppress: Vec<TokenId>,
    suppress_blank: bool,
    timestamps: bool,
    max_initial_timestamp_index: Option<u32>,
    sample_begin: usize,
}

impl LogitPolicy {
    pub fn new(specials: &SpecialTokens, options: &DecodingOptions, sample_begin: usize) -> Self {
        let mut suppress: Vec<TokenId> = options
            .suppress_tokens
            .clone()
            .unwrap_or_else(|| specials.non_speech.clone());
        suppress.extend([
            specials.sot,
            specials.sot_prev,
            specials.transcribe,
            specials.translate,
            specials.no_timestamps,
        ]);
        suppress.extend(specials.no_speech);
        suppress.extend(specials.languages.iter().map(|(_, t)| *t));
        suppress.retain(|&t| t != specials.eot);
        suppress.sort_unstable();
        suppress.dedup();

        let steps_per_second = (FRAMES_PER_SECOND / FRAMES_PER_TIMESTAMP) as f32;
        Self {
            eot: specials.eot,
            timestamp_begin: specials.timestamp_begin,
            blank: specials.blank,
            suppress,
            suppress_blank: options.suppress_blank,
            timestamps: !options.without_timestamps,
            max_initial_timestamp_index: options
                .max_initial_timestamp
                .map(|secs| (secs.max(0.0) * steps_per_second).round() as u32),
            sample_begin,
        }
    }

    /// Mask disallowed tokens in `logits` (set to `-inf`) given the full
    /// token history of one sequence.
    pub fn apply(&self, tokens: &[TokenId], logits: &mut [f32]) {
        let sampled = tokens.get(self.sample_begin..).unwrap_or(&[]);
        let vocab = logits.len();
        let ts_begin = (self.timestamp_begin as usize).min(vocab);
        let eot = (self.eot as usize).min(vocab);

        if self.suppress_blank && sampled.is_empty() {
            mask(logits, self.eot);
            if let Some(blank) = self.blank {
                mask(logits, blank);
            }
        }

        for &t in &self.suppress {
            mask(logits, t);
        }

        if !self.timestamps {
            logits[ts_begin..].fill(f32::NEG_INFINITY);
            return;
        }

        let is_ts = |t: TokenId| t >= self.timestamp_begin;
        let last_was_ts = sampled.last().is_some_and(|&t| is_ts(t));
        let penultimate_was_ts = sampled.len() < 2 || is_ts(sampled[sampled.len() - 2]);

        // Timestamps come in pairs, except directly before end-of-text.
        if last_was_ts {
            if penultimate_was_ts {
                logits[ts_begin..].fill(f32::NEG_INFINITY);
            } else {
                logits[..eot].fill(f32::NEG_INFINITY);
            }
        }

        // Timestamps never decrease within a sequence.
        if let Some(&last_ts) = sampled.iter().rev().find(|&&t| is_ts(t)) {
            let floor = if last_was_ts && !penultimate_was_ts {
                last_ts
            } else {
                last_ts + 1
            };
            let floor = (floor as usize).min(vocab);
            logits[ts_begin..floor.max(ts_begin)].fill(f32::NEG_INFINITY);
        }

        if sampled.is_empty() {
            logits[..ts_begin].fill(f32::NEG_INFINITY);
            if let Some(max_index) = self.max_initial_timestamp_index {
                let last_allowed = (self.timestamp_begin as usize + max_index as usize + 1).min(vocab);
                logits[last_allowed..].fill(f32::NEG_INFINITY);
            }
        }

        // If timestamps are collectively more likely than any single text
        // token, sample a timestamp.
        if ts_begin < vocab {
            let logprobs = log_softmax(logits);
            let ts_mass = log_sum_exp(&logprobs[ts_begin..]);
            let max_text = logprobs[..ts_begin]
                .iter()
                .copied()
                .fold(f64::NEG_INFINITY, f64::max);
            if ts_mass > max_text {
                logits[..ts_begin].fill(f32::NEG_INFINITY);
            }
        }
    }
}

fn mask(logits: &mut [f32], token: TokenId) {
    if let Some(v) = logits.get_mut(token as usize) {
        *v = f32::NEG_INFINITY;
    }
}

/// Numerically stable `log_softmax` in f64.
pub fn log_softmax(logits: &[f32]) -> Vec<f64> {
    let max = logits
        .iter()
        .copied()
        .fold(f32::NEG_INFINITY, f32::max) as f64;
    if !max.is_finite() {
        return vec![f64::NEG_INFINITY; logits.len()];
    }
    let sum: f64 = logits.iter().map(|&v| (v as f64 - max).exp()).sum();
    let log_z = max + sum.ln();
    logits.iter().map(|&v| v as f64 - log_z).collect()
}

fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return f64::NEG_INFINITY;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

/// Pick the next token: arg-max at temperature zero, otherwise sample from
/// `softmax(logits / temperature)`. Falls back to `eot` if every token is
/// masked.
pub fn select_token(logits: &[f32], temperature: f32, eot: TokenId, rng: &mut StdRng) -> TokenId {
    if temperature <= 0.0 {
        return argmax(logits).unwrap_or(eot);
    }

    let scaled: Vec<f32> = logits.iter().map(|&v| v / temperature).collect();
    let weights: Vec<f64> = log_softmax(&scaled)
        .into_iter()
        .map(|lp| if lp.is_finite() { lp.exp() } else { 0.0 })
        .collect();
    match WeightedIndex::new(&weights) {
        Ok(dist) => dist.sample(rng) as TokenId,
        Err(_) => argmax(logits).unwrap_or(eot),
    }
}

fn argmax(logits: &[f32]) -> Option<TokenId> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &v) in logits.iter().enumerate() {
        if v == f32::NEG_INFINITY || v.is_nan() {
            continue;
        }
        if best.is_none_or(|(_, b)| v > b) {
            best = Some((i, v));
        }
    }
    best.map(|(i, _)| i as TokenId)
}

/// Detect a short n-gram loop at the end of `generated`, e.g.
/// `[a,b,a,b,a,b,…]` or `[x,x,x,…]`.
pub fn has_repeating_tail_pattern(generated: &[TokenId]) -> bool {
    let len = generated.len();
    for n in 1..=MAX_LOOP_PATTERN {
        let cycles = MIN_LOOP_TOKENS.div_ceil(n).max(3);
        if len < n * cycles {
            continue;
        }
        let tail = &generated[len - n..];
        if (2..=cycles).all(|c| &generated[len - c * n..len - (c - 1) * n] == tail) {
            return true;
        }
    }
    false
}
