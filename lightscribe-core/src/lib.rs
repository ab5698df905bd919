//! # lightscribe-core
//!
//! Batched long-form speech-to-text engine SDK.
//!
//! ## Architecture
//!
//! ```text
//! AudioInput → AudioDecoder (16 kHz mono) → AudioWindower (30 s log-mel)
//!                                                    │
//!                       ModelCache::acquire ──► ModelHandle (SpeechModel + tokenizer)
//!                                                    │
//!                              encode batch → BatchedDecoder (lock-step rows,
//!                                             temperature fallback per row)
//!                                                    │
//!                         SegmentAssembler → merge_windows → TranscriptionResult
//!                                                    │
//!                                    broadcast::Sender<TranscribeProgress>
//! ```
//!
//! Models are loaded through a `ModelLoader` at most once per id, shared by
//! every concurrent request and evicted least-recently-used.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod cache;
pub mod decode;
pub mod engine;
pub mod error;
pub mod inference;
pub mod options;
pub mod registry;
pub mod result;
pub mod segment;

// Convenience re-exports for downstream crates
pub use audio::{AudioDecoder, AudioInput, DefaultAudioDecoder};
pub use cache::{CacheStats, CachedModel, ModelCache};
pub use decode::Task;
pub use engine::Transcriber;
pub use error::{LoadError, ScribeError};
pub use inference::{
    ModelHandle, ModelLoader, ModelMetadata, SpecialTokens, SpeechModel, TextTokenizer, TokenId,
};
pub use options::{Temperature, TranscribeOptions, TranscriberConfig};
pub use result::{Segment, TranscribeProgress, TranscriptionResult, WindowSummary};

#[cfg(feature = "onnx")]
pub use inference::{HfTokenizer, OnnxModelLoader, OnnxSpeechModel};
