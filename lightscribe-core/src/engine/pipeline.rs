//! Blocking transcription pipeline for one request.
//!
//! ## Stages
//!
//! ```text
//! 1. Plan windows over the waveform (or the clip ranges)
//! 2. For each batch of `batch_size` windows:
//!    a. Stack log-mel windows → [n, n_mels, frames] and encode
//!    b. Detect the language once, on the first window, if not given
//!    c. Decode all rows in lock-step with the shared prompt
//!    d. Assemble per-window segments; keep the last non-empty context
//!    e. Broadcast a TranscribeProgress event
//! 3. Rebase and merge every window into one TranscriptionResult
//! ```
//!
//! The model mutex is held for encode + decode of one batch, so concurrent
//! requests on the same model interleave at batch granularity.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use ndarray::{Array3, Axis};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    audio::{mel::MelFrontend, AudioWindow, AudioWindower, HOP_LENGTH},
    decode::{detect_language, language::FALLBACK_LANGUAGE, BatchedDecoder},
    error::{Result, ScribeError},
    inference::{ModelHandle, SpecialTokens, TextTokenizer, TokenId},
    options::TranscribeOptions,
    result::{TranscribeProgress, TranscriptionResult, WindowSummary},
    segment::{merge_windows, SegmentAssembler, WindowTranscript},
};

/// Everything one pipeline run needs, passed as one struct.
pub(crate) struct PipelineContext<'a> {
    pub model_id: &'a str,
    pub model: ModelHandle,
    pub samples: &'a [f32],
    pub options: &'a TranscribeOptions,
    pub context_tokens: usize,
    pub cancel: Option<&'a AtomicBool>,
    pub progress_tx: &'a broadcast::Sender<TranscribeProgress>,
}

pub(crate) fn run(ctx: PipelineContext<'_>) -> Result<TranscriptionResult> {
    let started = Instant::now();
    let options = ctx.options;
    let metadata = ctx.model.metadata().clone();
    let tokenizer = ctx.model.tokenizer();
    let specials = tokenizer.special_tokens().clone();

    let frontend = MelFrontend::new(metadata.n_mels);
    let windower = AudioWindower::new(
        ctx.samples,
        metadata.max_audio_frames * HOP_LENGTH,
        options.clip_timestamps.as_deref(),
        &frontend,
    )?;
    let total_windows = windower.len();
    let batch_size = options.batch_size.max(1);
    let total_batches = total_windows.div_ceil(batch_size);

    let mut language = options
        .requested_language()
        .map(|l| l.to_ascii_lowercase());
    if let Some(code) = &language {
        check_language(&specials, code)?;
    }
    let mut prompt = initial_prompt(tokenizer, options.initial_prompt.as_deref())?;

    let assembler = SegmentAssembler::new(tokenizer, ctx.context_tokens)
        .condition_on_previous_text(options.condition_on_previous_text)
        .prompt_reset_temperature(options.prompt_reset_temperature);

    let mut transcripts: Vec<(usize, WindowTranscript)> = Vec::with_capacity(total_windows);
    let mut summaries: Vec<WindowSummary> = Vec::with_capacity(total_windows);
    let mut windows = windower.iter();

    for batch in 0..total_batches {
        if ctx.cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
            return Err(ScribeError::Cancelled);
        }
        let chunk: Vec<AudioWindow> = windows.by_ref().take(batch_size).collect();
        let mel = stack_windows(&chunk, metadata.n_mels, windower.window_frames());

        let results = {
            let mut model = ctx.model.lock();
            let encoded = model.encode(mel.view())?;
            if encoded.batch_len() != chunk.len() {
                return Err(ScribeError::Inference(format!(
                    "encoder returned {} rows for {} windows",
                    encoded.batch_len(),
                    chunk.len()
                )));
            }

            if language.is_none() {
                let detected = detect_language(&mut *model, &encoded, &specials, &metadata)?;
                info!(
                    model_id = ctx.model_id,
                    language = %detected.code,
                    probability = detected.probability,
                    "language detected"
                );
                language = Some(detected.code);
            }

            let mut decoding = options.decoding_options(language.clone());
            decoding.seed = options.seed.map(|s| s.wrapping_add(batch as u64));
            let mut decoder = BatchedDecoder::new(&mut *model, &specials, &metadata, &decoding);
            if let Some(flag) = ctx.cancel {
                decoder = decoder.with_cancel(flag);
            }
            decoder.decode(&encoded, &prompt)?
        };

        let mut batch_segments = Vec::new();
        let batch_start = transcripts.len();
        for (window, result) in chunk.iter().zip(&results) {
            let transcript = assembler.assemble(result, window.content_frames)?;
            if result.incomplete() {
                warn!(
                    model_id = ctx.model_id,
                    start_frame = window.start_frame_offset,
                    "step ceiling reached; window output is partial"
                );
            }
            if result.low_confidence {
                warn!(
                    model_id = ctx.model_id,
                    start_frame = window.start_frame_offset,
                    avg_logprob = result.avg_logprob,
                    attempts = result.attempts,
                    "no attempt cleared the log-probability threshold"
                );
            }
            summaries.push(WindowSummary {
                start_frame_offset: window.start_frame_offset,
                temperature: result.temperature,
                avg_logprob: result.avg_logprob,
                incomplete: result.incomplete(),
                low_confidence: result.low_confidence,
                attempts: result.attempts,
            });
            batch_segments.extend(
                transcript
                    .segments
                    .iter()
                    .cloned()
                    .map(|s| s.rebased(window.start_frame_offset)),
            );
            transcripts.push((window.start_frame_offset, transcript));
        }

        let carry = batch_context(transcripts[batch_start..].iter().map(|(_, t)| t));
        prompt = match carry {
            Some(text) => tokenizer.encode(&format!(" {text}"))?,
            None => Vec::new(),
        };

        debug!(
            model_id = ctx.model_id,
            batch,
            windows = chunk.len(),
            segments = batch_segments.len(),
            prompt_tokens = prompt.len(),
            "batch decoded"
        );
        let _ = ctx.progress_tx.send(TranscribeProgress {
            model_id: ctx.model_id.to_string(),
            batch,
            total_batches,
            windows_done: summaries.len(),
            total_windows,
            segments: batch_segments,
        });
    }

    let (text, segments) = merge_windows(transcripts.iter().map(|(offset, t)| (*offset, t)));
    info!(
        model_id = ctx.model_id,
        windows = total_windows,
        batches = total_batches,
        segments = segments.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "transcription complete"
    );

    Ok(TranscriptionResult {
        text,
        segments,
        language: language.unwrap_or_else(|| FALLBACK_LANGUAGE.to_string()),
        windows: summaries,
    })
}

/// Context of the last window in the batch that produced any.
fn batch_context<'t>(windows: impl Iterator<Item = &'t WindowTranscript>) -> Option<&'t str> {
    windows.filter_map(|t| t.carry_forward.as_deref()).last()
}

/// Models without language tokens only accept English.
fn check_language(specials: &SpecialTokens, code: &str) -> Result<()> {
    let known = if specials.languages.is_empty() {
        code == FALLBACK_LANGUAGE
    } else {
        specials.language_token(code).is_some()
    };
    if known {
        Ok(())
    } else {
        Err(ScribeError::InvalidOptions(format!(
            "language `{code}` is not supported by this model"
        )))
    }
}

fn initial_prompt(tokenizer: &dyn TextTokenizer, prompt: Option<&str>) -> Result<Vec<TokenId>> {
    match prompt.map(str::trim).filter(|p| !p.is_empty()) {
        Some(text) => tokenizer.encode(&format!(" {text}")),
        None => Ok(Vec::new()),
    }
}

/// `[windows.len(), n_mels, frames]` batch tensor.
fn stack_windows(windows: &[AudioWindow], n_mels: usize, frames: usize) -> Array3<f32> {
    let mut mel = Array3::<f32>::zeros((windows.len(), n_mels, frames));
    for (i, window) in windows.iter().enumerate() {
        mel.index_axis_mut(Axis(0), i).assign(&window.frames);
    }
    mel
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::stub::{stub_handle, StubTokenizer};
    use ndarray::Array2;

    #[test]
    fn stacking_preserves_window_order() {
        let windows: Vec<AudioWindow> = (0..3)
            .map(|i| AudioWindow {
                frames: Array2::from_elem((2, 4), i as f32),
                start_frame_offset: i * 4,
                start_sample: i * 4 * HOP_LENGTH,
                content_frames: 4,
                is_final_partial: false,
            })
            .collect();
        let mel = stack_windows(&windows, 2, 4);
        assert_eq!(mel.shape(), &[3, 2, 4]);
        assert_eq!(mel[[2, 1, 3]], 2.0);
        assert_eq!(mel[[0, 0, 0]], 0.0);
    }

    #[test]
    fn silent_last_window_keeps_earlier_context() {
        let window = |carry: Option<&str>| WindowTranscript {
            segments: Vec::new(),
            carry_forward: carry.map(str::to_string),
        };
        let batch = [window(Some("first")), window(Some("second")), window(None)];
        assert_eq!(batch_context(batch.iter()), Some("second"));
        assert_eq!(batch_context([window(None), window(None)].iter()), None);
    }

    #[test]
    fn language_must_be_known_to_the_vocabulary() {
        let specials = StubTokenizer::new().special_tokens().clone();
        check_language(&specials, "en").unwrap();
        assert!(matches!(
            check_language(&specials, "zz"),
            Err(ScribeError::InvalidOptions(_))
        ));

        let english_only = SpecialTokens {
            languages: Vec::new(),
            ..specials
        };
        check_language(&english_only, "en").unwrap();
        assert!(check_language(&english_only, "de").is_err());
    }

    #[test]
    fn blank_initial_prompt_is_ignored() {
        let tok = StubTokenizer::new();
        assert!(initial_prompt(&tok, Some("   ")).unwrap().is_empty());
        assert_eq!(initial_prompt(&tok, Some("hi")).unwrap(), vec![32, 104, 105]);
    }

    #[test]
    fn empty_audio_yields_empty_result() {
        let (tx, _rx) = broadcast::channel(4);
        let options = TranscribeOptions {
            language: Some("en".into()),
            ..Default::default()
        };
        let result = run(PipelineContext {
            model_id: "stub",
            model: stub_handle(),
            samples: &[],
            options: &options,
            context_tokens: 223,
            cancel: None,
            progress_tx: &tx,
        })
        .unwrap();
        assert!(result.segments.is_empty());
        assert!(result.text.is_empty());
        assert_eq!(result.language, "en");
    }
}
