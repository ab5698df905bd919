use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use super::policy::{has_repeating_tail_pattern, log_softmax, select_token, LogitPolicy};
use super::{DecodeState, DecodingOptions, DecodingResult, FinishReason, Task};
use crate::error::{Result, ScribeError};
use crate::inference::{DecoderRow, EncodedAudio, ModelMetadata, SpecialTokens, SpeechModel, TokenId};

static DEBUG_DECODE: OnceLock<bool> = OnceLock::new();

fn is_debug_decode() -> bool {
    *DEBUG_DECODE.get_or_init(|| {
        std::env::var("LIGHTSCRIBE_DEBUG_DECODE")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    })
}

/// Decodes every window of an encoded batch in lock-step.
///
/// Holds the model exclusively for its lifetime; the caller obtains the
/// `&mut dyn SpeechModel` from a locked [`crate::inference::ModelHandle`].
pub struct BatchedDecoder<'a> {
    model: &'a mut dyn SpeechModel,
    specials: &'a SpecialTokens,
    metadata: &'a ModelMetadata,
    options: &'a DecodingOptions,
    cancel: Option<&'a AtomicBool>,
    rng: StdRng,
}

impl<'a> BatchedDecoder<'a> {
    pub fn new(
        model: &'a mut dyn SpeechModel,
        specials: &'a SpecialTokens,
        metadata: &'a ModelMetadata,
        options: &'a DecodingOptions,
    ) -> Self {
        let rng = options
            .seed
            .map(StdRng::seed_from_u64)
            .unwrap_or_else(StdRng::from_entropy);
        Self {
            model,
            specials,
            metadata,
            options,
            cancel: None,
            rng,
        }
    }

    /// Abort between steps once `flag` becomes `true`.
    pub fn with_cancel(mut self, flag: &'a AtomicBool) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Decoder prefix: optional previous-text block, then start-of-transcript,
    /// language and task markers.
    pub fn initial_tokens(&self, prompt: &[TokenId]) -> Vec<TokenId> {
        let s = self.specials;
        let mut tokens = Vec::new();

        let max_prompt = (self.metadata.max_text_context / 2).saturating_sub(1);
        if !prompt.is_empty() && max_prompt > 0 {
            tokens.push(s.sot_prev);
            let keep = prompt.len().min(max_prompt);
            tokens.extend_from_slice(&prompt[prompt.len() - keep..]);
        }

        tokens.push(s.sot);
        if self.metadata.is_multilingual {
            if let Some(lang) = self
                .options
                .language
                .as_deref()
                .and_then(|code| s.language_token(code))
            {
                tokens.push(lang);
            }
            tokens.push(match self.options.task {
                Task::Transcribe => s.transcribe,
                Task::Translate => s.translate,
            });
        }
        if self.options.without_timestamps {
            tokens.push(s.no_timestamps);
        }
        tokens
    }

    /// Decode every row of `audio`, re-decoding low-confidence rows along the
    /// temperature ladder. Results are in row order.
    ///
    /// # Errors
    /// `Cancelled` if the cancel flag is raised, or any backend failure.
    pub fn decode(&mut self, audio: &EncodedAudio, prompt: &[TokenId]) -> Result<Vec<DecodingResult>> {
        let temperatures = self.options.temperatures.clone();
        let first = temperatures.first().copied().unwrap_or(0.0);
        let rows: Vec<usize> = (0..audio.batch_len()).collect();

        let mut results = self.run_batch(audio, &rows, prompt, first)?;

        for (row, result) in results.iter_mut().enumerate() {
            if !self.needs_fallback(result) {
                continue;
            }
            let mut best = result.clone();
            let mut passed = false;
            let mut attempts = 1;

            for &temperature in temperatures
                .iter()
                .skip(1)
                .take(self.options.max_fallback_attempts)
            {
                let Some(retry) = self.run_batch(audio, &[row], prompt, temperature)?.pop() else {
                    break;
                };
                attempts += 1;
                let retry_passes = !self.needs_fallback(&retry);
                debug!(
                    row,
                    temperature,
                    avg_logprob = retry.avg_logprob,
                    passes = retry_passes,
                    "fallback attempt"
                );
                if retry_passes || retry.avg_logprob > best.avg_logprob {
                    best = retry;
                }
                if retry_passes {
                    passed = true;
                    break;
                }
            }

            best.attempts = attempts;
            best.low_confidence = !passed;
            *result = best;
        }

        Ok(results)
    }

    /// One lock-step pass over `rows` (indices into `audio`) at a single
    /// temperature. Finished rows are left out of every later forward call.
    ///
    /// # Errors
    /// `Cancelled`, or `Inference` if the backend returns a logits matrix
    /// whose row count does not match the live rows.
    pub fn run_batch(
        &mut self,
        audio: &EncodedAudio,
        rows: &[usize],
        prompt: &[TokenId],
        temperature: f32,
    ) -> Result<Vec<DecodingResult>> {
        let prefix = self.initial_tokens(prompt);
        let sample_begin = prefix.len();
        let budget = self
            .options
            .sample_len
            .min(self.metadata.max_text_context.saturating_sub(sample_begin));
        let eot = self.specials.eot;
        let policy = LogitPolicy::new(self.specials, self.options, sample_begin);

        let mut states: Vec<DecodeState> = rows
            .iter()
            .map(|&row| DecodeState::new(row, prefix.clone()))
            .collect();
        if budget == 0 {
            for state in &mut states {
                state.finished = Some(FinishReason::TokenBudget);
            }
        }

        for step in 0..self.options.max_steps {
            let live: Vec<usize> = states
                .iter()
                .enumerate()
                .filter(|(_, s)| s.is_live())
                .map(|(i, _)| i)
                .collect();
            if live.is_empty() {
                break;
            }
            self.check_cancelled()?;

            let logits = {
                let mut live_rows: Vec<DecoderRow<'_>> = states
                    .iter_mut()
                    .filter(|s| s.is_live())
                    .map(DecodeState::as_row)
                    .collect();
                self.model.forward(audio, &mut live_rows)?
            };
            if logits.nrows() != live.len() {
                return Err(ScribeError::Inference(format!(
                    "backend returned {} logit rows for {} live sequences",
                    logits.nrows(),
                    live.len()
                )));
            }

            for (row, &index) in live.iter().enumerate() {
                let state = &mut states[index];
                let mut scores = logits.row(row).to_vec();
                policy.apply(&state.tokens, &mut scores);
                let logprobs = log_softmax(&scores);
                let next = select_token(&scores, temperature, eot, &mut self.rng);

                if let Some(lp) = logprobs.get(next as usize).filter(|lp| lp.is_finite()) {
                    state.cumulative_logprob += lp;
                }
                state.tokens.push(next);

                if next == eot {
                    state.finished = Some(FinishReason::EndOfText);
                } else if state.generated().len() >= budget {
                    state.finished = Some(FinishReason::TokenBudget);
                } else if self.options.break_on_repetition
                    && has_repeating_tail_pattern(state.generated())
                {
                    state.finished = Some(FinishReason::Repetition);
                }
            }

            if is_debug_decode() {
                debug!(
                    step,
                    live = live.len(),
                    temperature,
                    last = ?live.iter().map(|&i| states[i].tokens.last().copied()).collect::<Vec<_>>(),
                    "decode step"
                );
            }
        }

        let stopped_early = states.iter().filter(|s| s.is_live()).count();
        if stopped_early > 0 {
            debug!(
                rows = stopped_early,
                max_steps = self.options.max_steps,
                "step ceiling reached with live sequences"
            );
        }

        Ok(states
            .into_iter()
            .map(|state| DecodingResult::from_state(state, eot, temperature))
            .collect())
    }

    fn needs_fallback(&self, result: &DecodingResult) -> bool {
        result.finish_reason == FinishReason::Repetition
            || self
                .options
                .logprob_threshold
                .is_some_and(|threshold| result.avg_logprob < threshold)
    }

    fn check_cancelled(&self) -> Result<()> {
        match self.cancel {
            Some(flag) if flag.load(Ordering::Relaxed) => Err(ScribeError::Cancelled),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array3, ArrayView3};

    const EOT: TokenId = 50;
    const TS: TokenId = 60;
    const VOCAB: usize = 120;

    fn specials() -> SpecialTokens {
        SpecialTokens {
            eot: EOT,
            sot: 51,
            sot_prev: 52,
            transcribe: 53,
            translate: 54,
            no_timestamps: 55,
            no_speech: Some(56),
            timestamp_begin: TS,
            blank: None,
            languages: vec![("en".into(), 57), ("de".into(), 58)],
            non_speech: Vec::new(),
        }
    }

    fn metadata() -> ModelMetadata {
        ModelMetadata {
            vocabulary_size: VOCAB,
            ..Default::default()
        }
    }

    fn text_options() -> DecodingOptions {
        DecodingOptions {
            without_timestamps: true,
            seed: Some(3),
            ..Default::default()
        }
    }

    /// Emits `scripts[audio_row][step]` with a strong logit, then EOT.
    /// Rows listed in `hesitant` produce flat logits on their first pass.
    struct ScriptedModel {
        scripts: Vec<Vec<TokenId>>,
        hesitant: Vec<usize>,
        passes: Vec<usize>,
        forward_rows: Vec<usize>,
        extra_row: bool,
    }

    impl ScriptedModel {
        fn new(scripts: Vec<Vec<TokenId>>) -> Self {
            let passes = vec![0; scripts.len()];
            Self {
                scripts,
                hesitant: Vec::new(),
                passes,
                forward_rows: Vec::new(),
                extra_row: false,
            }
        }
    }

    impl SpeechModel for ScriptedModel {
        fn encode(&mut self, mel: ArrayView3<'_, f32>) -> Result<EncodedAudio> {
            Ok(EncodedAudio::new(Array3::zeros((mel.shape()[0], 1, 1))))
        }

        fn forward(&mut self, _audio: &EncodedAudio, rows: &mut [DecoderRow<'_>]) -> Result<Array2<f32>> {
            self.forward_rows.push(rows.len());
            let n = rows.len() + usize::from(self.extra_row);
            let mut logits = Array2::zeros((n, VOCAB));
            for (i, row) in rows.iter_mut().enumerate() {
                if row.kv_cache.is_empty() {
                    row.kv_cache.insert(0usize);
                    self.passes[row.audio_row] += 1;
                }
                let step = row.kv_cache.get_mut::<usize>().expect("step counter");
                let hesitant =
                    self.hesitant.contains(&row.audio_row) && self.passes[row.audio_row] == 1;
                if !hesitant {
                    let token = self.scripts[row.audio_row].get(*step).copied().unwrap_or(EOT);
                    logits[[i, token as usize]] = 20.0;
                }
                *step += 1;
            }
            Ok(logits)
        }
    }

    fn encoded(rows: usize) -> EncodedAudio {
        EncodedAudio::new(Array3::zeros((rows, 1, 1)))
    }

    #[test]
    fn prefix_layout_and_prompt_truncation() {
        let mut model = ScriptedModel::new(vec![]);
        let sp = specials();
        let md = ModelMetadata {
            max_text_context: 10,
            ..metadata()
        };
        let opts = DecodingOptions {
            language: Some("DE".into()),
            task: Task::Translate,
            without_timestamps: true,
            ..Default::default()
        };
        let decoder = BatchedDecoder::new(&mut model, &sp, &md, &opts);
        assert_eq!(
            decoder.initial_tokens(&[1, 2, 3, 4, 5, 6]),
            vec![52, 3, 4, 5, 6, 51, 58, 54, 55]
        );
        assert_eq!(decoder.initial_tokens(&[]), vec![51, 58, 54, 55]);
    }

    #[test]
    fn english_only_prefix_has_no_language_or_task() {
        let mut model = ScriptedModel::new(vec![]);
        let sp = specials();
        let md = ModelMetadata {
            is_multilingual: false,
            ..metadata()
        };
        let opts = DecodingOptions::default();
        let decoder = BatchedDecoder::new(&mut model, &sp, &md, &opts);
        assert_eq!(decoder.initial_tokens(&[]), vec![51]);
    }

    #[test]
    fn finished_rows_leave_the_forward_batch() {
        let mut model = ScriptedModel::new(vec![vec![1], vec![1, 2, 3], vec![4, 5]]);
        let (sp, md, opts) = (specials(), metadata(), text_options());
        let results = BatchedDecoder::new(&mut model, &sp, &md, &opts)
            .decode(&encoded(3), &[])
            .unwrap();

        assert_eq!(results[0].tokens, vec![1]);
        assert_eq!(results[1].tokens, vec![1, 2, 3]);
        assert_eq!(results[2].tokens, vec![4, 5]);
        assert!(results.iter().all(|r| r.finish_reason == FinishReason::EndOfText));
        assert!(results.iter().all(|r| r.attempts == 1 && !r.low_confidence));
        assert_eq!(model.forward_rows, vec![3, 3, 2, 1]);
    }

    #[test]
    fn token_budget_caps_generation() {
        let mut model = ScriptedModel::new(vec![(1..30).collect()]);
        let (sp, md) = (specials(), metadata());
        let opts = DecodingOptions {
            sample_len: 3,
            ..text_options()
        };
        let results = BatchedDecoder::new(&mut model, &sp, &md, &opts)
            .decode(&encoded(1), &[])
            .unwrap();
        assert_eq!(results[0].tokens, vec![1, 2, 3]);
        assert_eq!(results[0].finish_reason, FinishReason::TokenBudget);
    }

    #[test]
    fn step_ceiling_marks_rows_incomplete() {
        let mut model = ScriptedModel::new(vec![(1..30).collect(), vec![7]]);
        let (sp, md) = (specials(), metadata());
        let opts = DecodingOptions {
            max_steps: 4,
            ..text_options()
        };
        let results = BatchedDecoder::new(&mut model, &sp, &md, &opts)
            .decode(&encoded(2), &[])
            .unwrap();
        assert!(results[0].incomplete());
        assert_eq!(results[0].tokens.len(), 4);
        assert!(!results[1].incomplete());
        assert!(model.forward_rows.len() <= 4);
    }

    #[test]
    fn looping_row_is_cut_and_retried() {
        let mut model = ScriptedModel::new(vec![vec![9; 40]]);
        let (sp, md) = (specials(), metadata());
        let opts = DecodingOptions {
            temperatures: vec![0.0],
            ..text_options()
        };
        let results = BatchedDecoder::new(&mut model, &sp, &md, &opts)
            .decode(&encoded(1), &[])
            .unwrap();
        assert_eq!(results[0].finish_reason, FinishReason::Repetition);
        assert_eq!(results[0].tokens.len(), 16);
        assert!(results[0].low_confidence);
    }

    #[test]
    fn low_confidence_row_falls_back_alone() {
        let mut model = ScriptedModel::new(vec![vec![1, 2], vec![3, 4]]);
        model.hesitant = vec![1];
        let (sp, md) = (specials(), metadata());
        let opts = DecodingOptions {
            sample_len: 20,
            ..text_options()
        };
        let results = BatchedDecoder::new(&mut model, &sp, &md, &opts)
            .decode(&encoded(2), &[])
            .unwrap();

        assert_eq!(results[0].attempts, 1);
        assert_eq!(results[0].temperature, 0.0);
        assert_eq!(results[1].tokens, vec![3, 4]);
        assert_eq!(results[1].attempts, 2);
        assert_eq!(results[1].temperature, 0.2);
        assert!(!results[1].low_confidence);
        assert_eq!(model.passes, vec![1, 2]);
    }

    #[test]
    fn exhausted_ladder_keeps_best_and_flags_it() {
        let mut model = ScriptedModel::new(vec![vec![1]]);
        model.hesitant = vec![0];
        let (sp, md) = (specials(), metadata());
        let opts = DecodingOptions {
            temperatures: vec![0.0, 0.5, 1.0],
            logprob_threshold: Some(0.5),
            sample_len: 6,
            ..text_options()
        };
        let results = BatchedDecoder::new(&mut model, &sp, &md, &opts)
            .decode(&encoded(1), &[])
            .unwrap();
        assert_eq!(results[0].attempts, 3);
        assert!(results[0].low_confidence);
        // the confident retry beats the flat first pass
        assert_eq!(results[0].tokens, vec![1]);
    }

    #[test]
    fn timestamp_rules_shape_the_sequence() {
        let mut model = ScriptedModel::new(vec![vec![TS, 5, 6, TS + 2]]);
        let (sp, md) = (specials(), metadata());
        let opts = DecodingOptions {
            seed: Some(1),
            ..Default::default()
        };
        let results = BatchedDecoder::new(&mut model, &sp, &md, &opts)
            .decode(&encoded(1), &[])
            .unwrap();
        assert_eq!(results[0].tokens, vec![TS, 5, 6, TS + 2]);
        assert_eq!(results[0].finish_reason, FinishReason::EndOfText);
    }

    #[test]
    fn earlier_timestamps_are_never_emitted() {
        // The model keeps preferring timestamps below the last one.
        let mut model = ScriptedModel::new(vec![vec![TS + 4, 5, TS + 2, TS + 1]]);
        let (sp, md) = (specials(), metadata());
        let opts = DecodingOptions {
            temperatures: vec![0.0],
            logprob_threshold: None,
            max_initial_timestamp: None,
            ..Default::default()
        };
        let results = BatchedDecoder::new(&mut model, &sp, &md, &opts)
            .decode(&encoded(1), &[])
            .unwrap();

        let tokens = &results[0].tokens;
        assert_eq!(tokens, &vec![TS + 4, 5, TS + 5, TS + 5]);
        let stamps: Vec<TokenId> = tokens.iter().copied().filter(|&t| t >= TS).collect();
        assert!(stamps.windows(2).all(|p| p[0] <= p[1]), "{stamps:?}");
        assert_eq!(results[0].finish_reason, FinishReason::EndOfText);
    }

    #[test]
    fn raised_flag_cancels_before_the_next_step() {
        let mut model = ScriptedModel::new(vec![vec![1, 2]]);
        let (sp, md, opts) = (specials(), metadata(), text_options());
        let flag = AtomicBool::new(true);
        let err = BatchedDecoder::new(&mut model, &sp, &md, &opts)
            .with_cancel(&flag)
            .decode(&encoded(1), &[]);
        assert!(matches!(err, Err(ScribeError::Cancelled)));
        assert!(model.forward_rows.is_empty());
    }

    #[test]
    fn mismatched_logit_rows_are_rejected() {
        let mut model = ScriptedModel::new(vec![vec![1]]);
        model.extra_row = true;
        let (sp, md, opts) = (specials(), metadata(), text_options());
        let err = BatchedDecoder::new(&mut model, &sp, &md, &opts).decode(&encoded(1), &[]);
        assert!(matches!(err, Err(ScribeError::Inference(_))));
    }
}
