//! Token stream → time-aligned segments, plus the context carried to the
//! next window and the final cross-window merge.
//!
//! Timestamp tokens are 0.02 s apart, i.e. two mel frames each. Within one
//! window the assembled segments are clamped to the frames that hold real
//! audio, never overlap and have strictly increasing starts.

use crate::audio::FRAMES_PER_TIMESTAMP;
use crate::decode::DecodingResult;
use crate::error::Result;
use crate::inference::{TextTokenizer, TokenId};
use crate::result::Segment;

/// Segments of one window in window-local frames, and the context to hand
/// to the next window (if any).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WindowTranscript {
    pub segments: Vec<Segment>,
    pub carry_forward: Option<String>,
}

pub struct SegmentAssembler<'a> {
    tokenizer: &'a dyn TextTokenizer,
    /// Trailing text tokens used as the next window's prompt.
    context_tokens: usize,
    condition_on_previous_text: bool,
    /// Windows accepted above this temperature carry nothing forward.
    prompt_reset_temperature: f32,
}

impl<'a> SegmentAssembler<'a> {
    pub fn new(tokenizer: &'a dyn TextTokenizer, context_tokens: usize) -> Self {
        Self {
            tokenizer,
            context_tokens,
            condition_on_previous_text: true,
            prompt_reset_temperature: 0.5,
        }
    }

    pub fn condition_on_previous_text(mut self, enabled: bool) -> Self {
        self.condition_on_previous_text = enabled;
        self
    }

    pub fn prompt_reset_temperature(mut self, temperature: f32) -> Self {
        self.prompt_reset_temperature = temperature;
        self
    }

    /// Split `result.tokens` at timestamp tokens. `content_frames` is the
    /// number of window frames backed by audio; every end is clamped to it.
    ///
    /// # Errors
    /// Tokenizer decode failures.
    pub fn assemble(&self, result: &DecodingResult, content_frames: usize) -> Result<WindowTranscript> {
        let specials = self.tokenizer.special_tokens();
        let mut builder = SegmentBuilder::new(content_frames);
        let mut text: Vec<TokenId> = Vec::new();
        let mut open_start: Option<usize> = None;
        let mut last_end = 0usize;

        for &token in &result.tokens {
            if let Some(index) = specials.timestamp_index(token) {
                let frame = index as usize * FRAMES_PER_TIMESTAMP;
                if text.is_empty() {
                    open_start = Some(frame);
                } else {
                    let start = open_start.take().unwrap_or(last_end);
                    builder.push(start, frame.max(start), self.tokenizer.decode(&text)?);
                    text.clear();
                    last_end = frame;
                }
            } else if specials.is_text(token) {
                text.push(token);
            }
        }
        if !text.is_empty() {
            let start = open_start.unwrap_or(last_end);
            builder.push(start, content_frames, self.tokenizer.decode(&text)?);
        }

        Ok(WindowTranscript {
            segments: builder.finish(),
            carry_forward: self.carry_forward(result)?,
        })
    }

    fn carry_forward(&self, result: &DecodingResult) -> Result<Option<String>> {
        if !self.condition_on_previous_text
            || self.context_tokens == 0
            || result.temperature > self.prompt_reset_temperature
        {
            return Ok(None);
        }
        let specials = self.tokenizer.special_tokens();
        let text: Vec<TokenId> = result
            .tokens
            .iter()
            .copied()
            .filter(|&t| specials.is_text(t))
            .collect();
        let keep = text.len().min(self.context_tokens);
        let context = self.tokenizer.decode(&text[text.len() - keep..])?;
        let context = context.trim();
        Ok((!context.is_empty()).then(|| context.to_string()))
    }
}

/// Enforces the per-window ordering invariants while segments are pushed.
struct SegmentBuilder {
    content_frames: usize,
    segments: Vec<Segment>,
}

impl SegmentBuilder {
    fn new(content_frames: usize) -> Self {
        Self {
            content_frames,
            segments: Vec::new(),
        }
    }

    fn push(&mut self, start: usize, end: usize, text: String) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let prev_end = self.segments.last().map_or(0, |s| s.end_frame);
        let start = start.max(prev_end).min(self.content_frames);
        let end = end.min(self.content_frames).max(start);

        match self.segments.last_mut() {
            Some(prev) if start <= prev.start_frame => {
                prev.end_frame = prev.end_frame.max(end);
                prev.text.push(' ');
                prev.text.push_str(text);
            }
            _ => self.segments.push(Segment {
                start_frame: start,
                end_frame: end,
                text: text.to_string(),
            }),
        }
    }

    fn finish(self) -> Vec<Segment> {
        self.segments
    }
}

/// Concatenate per-window segments in window order, shifting each by its
/// window's absolute frame offset. Returns the space-joined text and the
/// global segment list. No overlap deduplication is attempted.
pub fn merge_windows<'w, I>(windows: I) -> (String, Vec<Segment>)
where
    I: IntoIterator<Item = (usize, &'w WindowTranscript)>,
{
    let segments: Vec<Segment> = windows
        .into_iter()
        .flat_map(|(offset, window)| {
            window
                .segments
                .iter()
                .cloned()
                .map(move |s| s.rebased(offset))
        })
        .collect();
    let text = segments
        .iter()
        .map(|s| s.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    (text, segments)
}
