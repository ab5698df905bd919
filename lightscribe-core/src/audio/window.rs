//! Fixed-length windowing of a waveform into encoder-sized mel frames.
//!
//! Spans are planned eagerly (cheap arithmetic); spectrograms are computed
//! lazily, one window per `next()`. Calling [`AudioWindower::iter`] again
//! restarts from the first window.

use ndarray::Array2;

use super::mel::MelFrontend;
use super::{HOP_LENGTH, SAMPLE_RATE};
use crate::error::{Result, ScribeError};

/// One encoder window.
#[derive(Debug, Clone)]
pub struct AudioWindow {
    /// `[n_mels, window_frames]` log-mel matrix.
    pub frames: Array2<f32>,
    /// Absolute mel-frame offset of the window start in the full signal.
    pub start_frame_offset: usize,
    /// Absolute sample offset of the window start.
    pub start_sample: usize,
    /// Frames backed by real audio; the rest is zero padding.
    pub content_frames: usize,
    pub is_final_partial: bool,
}

/// Planned sample span of one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSpan {
    pub start_sample: usize,
    pub len: usize,
    pub is_final_partial: bool,
}

/// Caller-supplied `(start_sec, end_sec)` restriction.
pub type ClipRange = (f32, f32);

pub struct AudioWindower<'a> {
    samples: &'a [f32],
    window_samples: usize,
    spans: Vec<WindowSpan>,
    frontend: &'a MelFrontend,
}

impl<'a> AudioWindower<'a> {
    /// Plan windows of `window_samples` over `samples`, or over each clip
    /// range when `clips` is given.
    ///
    /// # Errors
    /// `InvalidOptions` if `window_samples` is not a positive multiple of the
    /// hop length, or a clip range is malformed.
    pub fn new(
        samples: &'a [f32],
        window_samples: usize,
        clips: Option<&[ClipRange]>,
        frontend: &'a MelFrontend,
    ) -> Result<Self> {
        if window_samples == 0 || window_samples % HOP_LENGTH != 0 {
            return Err(ScribeError::InvalidOptions(format!(
                "window length {window_samples} must be a positive multiple of {HOP_LENGTH}"
            )));
        }
        let spans = match clips {
            None => plan_full(samples.len(), window_samples),
            Some(clips) => plan_clips(samples.len(), window_samples, clips)?,
        };
        Ok(Self {
            samples,
            window_samples,
            spans,
            frontend,
        })
    }

    pub fn spans(&self) -> &[WindowSpan] {
        &self.spans
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn window_frames(&self) -> usize {
        self.window_samples / HOP_LENGTH
    }

    pub fn iter(&self) -> Windows<'_> {
        Windows {
            windower: self,
            next: 0,
        }
    }

    fn materialize(&self, span: WindowSpan) -> AudioWindow {
        let content = &self.samples[span.start_sample..span.start_sample + span.len];
        AudioWindow {
            frames: self.frontend.log_mel(content, self.window_frames()),
            start_frame_offset: span.start_sample / HOP_LENGTH,
            start_sample: span.start_sample,
            content_frames: span.len.div_ceil(HOP_LENGTH),
            is_final_partial: span.is_final_partial,
        }
    }
}

impl<'w, 'a> IntoIterator for &'w AudioWindower<'a> {
    type Item = AudioWindow;
    type IntoIter = Windows<'w>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Lazy iterator over an [`AudioWindower`]'s windows.
pub struct Windows<'w> {
    windower: &'w AudioWindower<'w>,
    next: usize,
}

impl Iterator for Windows<'_> {
    type Item = AudioWindow;

    fn next(&mut self) -> Option<AudioWindow> {
        let span = *self.windower.spans.get(self.next)?;
        self.next += 1;
        Some(self.windower.materialize(span))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let rest = self.windower.spans.len() - self.next;
        (rest, Some(rest))
    }
}

impl ExactSizeIterator for Windows<'_> {}

fn plan_full(total: usize, window: usize) -> Vec<WindowSpan> {
    split_span(0, total, window)
}

fn plan_clips(total: usize, window: usize, clips: &[ClipRange]) -> Result<Vec<WindowSpan>> {
    let mut spans = Vec::new();
    let mut previous_end = 0.0_f32;
    for &(start, end) in clips {
        if !start.is_finite() || !end.is_finite() || start < 0.0 || end <= start {
            return Err(ScribeError::InvalidOptions(format!(
                "clip range ({start}, {end}) is malformed"
            )));
        }
        if start < previous_end {
            return Err(ScribeError::InvalidOptions(format!(
                "clip range ({start}, {end}) starts before the previous one ends"
            )));
        }
        previous_end = end;
        let first = seconds_to_sample(start).min(total);
        let last = seconds_to_sample(end).min(total);
        if last <= first {
            continue;
        }
        spans.extend(split_span(first, last - first, window));
    }
    Ok(spans)
}

/// Consecutive `window`-sized spans over `[start, start + len)`; only the
/// last may be short.
fn split_span(start: usize, len: usize, window: usize) -> Vec<WindowSpan> {
    (0..len.div_ceil(window))
        .map(|i| {
            let offset = i * window;
            let span_len = window.min(len - offset);
            WindowSpan {
                start_sample: start + offset,
                len: span_len,
                is_final_partial: span_len < window,
            }
        })
        .collect()
}

fn seconds_to_sample(sec: f32) -> usize {
    (f64::from(sec) * f64::from(SAMPLE_RATE)).round() as usize
}
