//! Per-request transcription options and process-level configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::audio::ClipRange;
use crate::decode::{DecodingOptions, Task};
use crate::error::{Result, ScribeError};
use crate::inference::TokenId;

/// Default temperature ladder: greedy first, then increasingly random.
pub const DEFAULT_TEMPERATURES: [f32; 6] = [0.0, 0.2, 0.4, 0.6, 0.8, 1.0];

/// A single temperature or an ordered fallback ladder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Temperature {
    Fixed(f32),
    Ladder(Vec<f32>),
}

impl Default for Temperature {
    fn default() -> Self {
        Self::Ladder(DEFAULT_TEMPERATURES.to_vec())
    }
}

impl Temperature {
    pub fn ladder(&self) -> Vec<f32> {
        match self {
            Self::Fixed(t) => vec![*t],
            Self::Ladder(ts) => ts.clone(),
        }
    }
}

/// Options for one `transcribe` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TranscribeOptions {
    /// Language code, or `None` / `"auto"` to detect it.
    pub language: Option<String>,
    pub task: Task,
    /// Windows decoded together per forward pass.
    pub batch_size: usize,
    pub temperature: Temperature,
    pub initial_prompt: Option<String>,
    /// Restrict transcription to these `(start_sec, end_sec)` ranges.
    pub clip_timestamps: Option<Vec<ClipRange>>,
    /// Feed each batch's trailing text to the next batch as a prompt.
    pub condition_on_previous_text: bool,
    pub without_timestamps: bool,
    /// Generated-token budget per window.
    pub sample_len: usize,
    /// Hard ceiling on decoding steps per batch.
    pub max_decode_steps: usize,
    /// Re-decode windows whose average log-probability falls below this.
    pub logprob_threshold: Option<f64>,
    pub max_fallback_attempts: usize,
    /// Windows accepted above this temperature pass no context on.
    pub prompt_reset_temperature: f32,
    /// `None` suppresses the tokenizer's non-speech symbols.
    pub suppress_tokens: Option<Vec<TokenId>>,
    pub suppress_blank: bool,
    /// Latest allowed first timestamp (seconds).
    pub max_initial_timestamp: Option<f32>,
    /// Fixes the sampling RNG for reproducible runs.
    pub seed: Option<u64>,
}

impl Default for TranscribeOptions {
    fn default() -> Self {
        Self {
            language: None,
            task: Task::Transcribe,
            batch_size: 12,
            temperature: Temperature::default(),
            initial_prompt: None,
            clip_timestamps: None,
            condition_on_previous_text: true,
            without_timestamps: false,
            sample_len: 224,
            max_decode_steps: 224,
            logprob_threshold: Some(-1.0),
            max_fallback_attempts: 5,
            prompt_reset_temperature: 0.5,
            suppress_tokens: None,
            suppress_blank: true,
            max_initial_timestamp: Some(1.0),
            seed: None,
        }
    }
}

impl TranscribeOptions {
    /// # Errors
    /// `InvalidOptions` describing the first offending field.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(ScribeError::InvalidOptions(msg));

        if self.batch_size == 0 {
            return invalid("batchSize must be greater than 0".into());
        }
        let ladder = self.temperature.ladder();
        if ladder.is_empty() {
            return invalid("temperature ladder is empty".into());
        }
        if let Some(t) = ladder.iter().find(|t| !t.is_finite() || **t < 0.0) {
            return invalid(format!("temperature {t} must be finite and non-negative"));
        }
        if self.sample_len == 0 {
            return invalid("sampleLen must be greater than 0".into());
        }
        if self.max_decode_steps == 0 {
            return invalid("maxDecodeSteps must be greater than 0".into());
        }
        if let Some(clips) = &self.clip_timestamps {
            if let Some((s, e)) = clips
                .iter()
                .find(|(s, e)| !s.is_finite() || !e.is_finite() || *s < 0.0 || e <= s)
            {
                return invalid(format!("clip range ({s}, {e}) is malformed"));
            }
            if let Some(pair) = clips.windows(2).find(|p| p[1].0 < p[0].1) {
                return invalid(format!(
                    "clip ranges must be ascending and disjoint: ({}, {}) then ({}, {})",
                    pair[0].0, pair[0].1, pair[1].0, pair[1].1
                ));
            }
        }
        if self
            .max_initial_timestamp
            .is_some_and(|t| !t.is_finite() || t < 0.0)
        {
            return invalid("maxInitialTimestamp must be non-negative".into());
        }
        if self.language.as_deref().is_some_and(|l| l.trim().is_empty()) {
            return invalid("language must not be blank".into());
        }
        Ok(())
    }

    /// Explicit language code, or `None` when detection is requested.
    pub fn requested_language(&self) -> Option<&str> {
        self.language
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.eq_ignore_ascii_case("auto"))
    }

    pub(crate) fn decoding_options(&self, language: Option<String>) -> DecodingOptions {
        DecodingOptions {
            task: self.task,
            language,
            temperatures: self.temperature.ladder(),
            sample_len: self.sample_len,
            max_steps: self.max_decode_steps,
            without_timestamps: self.without_timestamps,
            suppress_tokens: self.suppress_tokens.clone(),
            suppress_blank: self.suppress_blank,
            max_initial_timestamp: self.max_initial_timestamp,
            logprob_threshold: self.logprob_threshold,
            max_fallback_attempts: self.max_fallback_attempts,
            break_on_repetition: true,
            seed: self.seed,
        }
    }
}

/// Process-wide settings of a [`crate::Transcriber`].
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriberConfig {
    /// Models kept resident. Default: 1.
    pub cache_capacity: usize,
    /// Trailing text tokens carried into the next batch's prompt. Default: 223.
    pub context_tokens: usize,
    /// Where decoded non-WAV audio is cached; `None` disables the cache.
    pub audio_cache_dir: Option<PathBuf>,
}

impl Default for TranscriberConfig {
    fn default() -> Self {
        Self {
            cache_capacity: crate::cache::DEFAULT_CAPACITY,
            context_tokens: 223,
            audio_cache_dir: None,
        }
    }
}

impl TranscriberConfig {
    /// Defaults overridden by `LIGHTSCRIBE_CACHE_CAPACITY`,
    /// `LIGHTSCRIBE_CONTEXT_TOKENS` and `LIGHTSCRIBE_AUDIO_CACHE_DIR`.
    /// Unparseable values are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            cache_capacity: lookup("LIGHTSCRIBE_CACHE_CAPACITY")
                .and_then(|v| v.trim().parse::<usize>().ok())
                .filter(|&n| n > 0)
                .unwrap_or(defaults.cache_capacity),
            context_tokens: lookup("LIGHTSCRIBE_CONTEXT_TOKENS")
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(defaults.context_tokens),
            audio_cache_dir: lookup("LIGHTSCRIBE_AUDIO_CACHE_DIR")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .or(defaults.audio_cache_dir),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        TranscribeOptions::default().validate().unwrap();
    }

    #[test]
    fn json_uses_camel_case_and_fills_defaults() {
        let opts: TranscribeOptions = serde_json::from_str(
            r#"{"batchSize": 4, "temperature": 0.3, "clipTimestamps": [[10, 20]], "task": "translate"}"#,
        )
        .expect("parse options");
        assert_eq!(opts.batch_size, 4);
        assert_eq!(opts.temperature, Temperature::Fixed(0.3));
        assert_eq!(opts.clip_timestamps, Some(vec![(10.0, 20.0)]));
        assert_eq!(opts.task, Task::Translate);
        assert!(opts.condition_on_previous_text);
        assert_eq!(opts.sample_len, 224);

        let ladder: TranscribeOptions =
            serde_json::from_str(r#"{"temperature": [0.0, 0.5]}"#).expect("parse ladder");
        assert_eq!(ladder.temperature.ladder(), vec![0.0, 0.5]);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let bad = [
            TranscribeOptions {
                batch_size: 0,
                ..Default::default()
            },
            TranscribeOptions {
                temperature: Temperature::Ladder(vec![]),
                ..Default::default()
            },
            TranscribeOptions {
                temperature: Temperature::Fixed(-0.1),
                ..Default::default()
            },
            TranscribeOptions {
                clip_timestamps: Some(vec![(5.0, 5.0)]),
                ..Default::default()
            },
            TranscribeOptions {
                clip_timestamps: Some(vec![(20.0, 30.0), (0.0, 10.0)]),
                ..Default::default()
            },
            TranscribeOptions {
                clip_timestamps: Some(vec![(0.0, 10.0), (5.0, 15.0)]),
                ..Default::default()
            },
            TranscribeOptions {
                max_decode_steps: 0,
                ..Default::default()
            },
            TranscribeOptions {
                language: Some("  ".into()),
                ..Default::default()
            },
        ];
        for opts in bad {
            assert!(
                matches!(opts.validate(), Err(ScribeError::InvalidOptions(_))),
                "{opts:?}"
            );
        }
    }

    #[test]
    fn touching_clips_are_accepted() {
        let opts = TranscribeOptions {
            clip_timestamps: Some(vec![(0.0, 10.0), (10.0, 20.0), (25.0, 30.0)]),
            ..Default::default()
        };
        opts.validate().unwrap();
    }

    #[test]
    fn auto_language_means_detection() {
        let mut opts = TranscribeOptions::default();
        assert_eq!(opts.requested_language(), None);
        opts.language = Some("Auto".into());
        assert_eq!(opts.requested_language(), None);
        opts.language = Some("de".into());
        assert_eq!(opts.requested_language(), Some("de"));
    }

    #[test]
    fn decoding_options_carry_the_ladder() {
        let opts = TranscribeOptions {
            temperature: Temperature::Fixed(0.4),
            seed: Some(9),
            ..Default::default()
        };
        let d = opts.decoding_options(Some("fr".into()));
        assert_eq!(d.temperatures, vec![0.4]);
        assert_eq!(d.language.as_deref(), Some("fr"));
        assert_eq!(d.seed, Some(9));
        assert_eq!(d.max_steps, 224);
    }

    #[test]
    fn config_reads_overrides_and_ignores_garbage() {
        let cfg = TranscriberConfig::from_lookup(|key| match key {
            "LIGHTSCRIBE_CACHE_CAPACITY" => Some("3".into()),
            "LIGHTSCRIBE_CONTEXT_TOKENS" => Some("many".into()),
            "LIGHTSCRIBE_AUDIO_CACHE_DIR" => Some("/tmp/ls".into()),
            _ => None,
        });
        assert_eq!(cfg.cache_capacity, 3);
        assert_eq!(cfg.context_tokens, 223);
        assert_eq!(cfg.audio_cache_dir, Some(PathBuf::from("/tmp/ls")));

        let zero = TranscriberConfig::from_lookup(|key| {
            (key == "LIGHTSCRIBE_CACHE_CAPACITY").then(|| "0".to_string())
        });
        assert_eq!(zero.cache_capacity, 1);
    }
}
