//! Values returned to callers and progress events broadcast while a
//! transcription runs. All types serialize camelCase for the CLI's JSON
//! output.

use serde::{Deserialize, Serialize};

use crate::audio::FRAMES_PER_SECOND;

// ---------------------------------------------------------------------------
// Segments
// ---------------------------------------------------------------------------

/// Time-aligned text. Frames are 10 ms mel frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub start_frame: usize,
    pub end_frame: usize,
    pub text: String,
}

impl Segment {
    pub fn start_secs(&self) -> f64 {
        self.start_frame as f64 / FRAMES_PER_SECOND as f64
    }

    pub fn end_secs(&self) -> f64 {
        self.end_frame as f64 / FRAMES_PER_SECOND as f64
    }

    /// Shift both bounds by `offset` frames.
    pub fn rebased(mut self, offset: usize) -> Self {
        self.start_frame += offset;
        self.end_frame += offset;
        self
    }
}

// ---------------------------------------------------------------------------
// Final result
// ---------------------------------------------------------------------------

/// Decoding outcome of one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowSummary {
    pub start_frame_offset: usize,
    /// Temperature of the accepted attempt.
    pub temperature: f32,
    pub avg_logprob: f64,
    /// The step ceiling cut decoding short.
    pub incomplete: bool,
    /// No attempt cleared the log-probability threshold.
    pub low_confidence: bool,
    pub attempts: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionResult {
    /// Segment texts joined by single spaces.
    pub text: String,
    /// Globally ordered, frame-rebased segments.
    pub segments: Vec<Segment>,
    /// Language code used for decoding.
    pub language: String,
    pub windows: Vec<WindowSummary>,
}

// ---------------------------------------------------------------------------
// Progress events
// ---------------------------------------------------------------------------

/// Broadcast after every decoded batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscribeProgress {
    pub model_id: String,
    /// Zero-based batch index.
    pub batch: usize,
    pub total_batches: usize,
    pub windows_done: usize,
    pub total_windows: usize,
    /// Rebased segments produced by this batch.
    pub segments: Vec<Segment>,
}

impl TranscribeProgress {
    pub fn is_last(&self) -> bool {
        self.batch + 1 == self.total_batches
    }
}
