//! Compute-primitive and tokenizer abstractions.
//!
//! The `SpeechModel` trait decouples the decoder loop from any specific
//! backend (stub, ONNX Whisper, …). A backend exposes exactly two
//! operations: encode a batch of mel windows, and produce next-token logits
//! for a set of live sequences given their incremental state.
//!
//! `&mut self` on both expresses that backends own sessions and scratch
//! buffers. All mutation is serialised through `ModelHandle`'s
//! `parking_lot::Mutex`.

pub mod stub;

#[cfg(feature = "onnx")]
pub mod onnx;

#[cfg(feature = "onnx")]
pub use onnx::{HfTokenizer, OnnxModelLoader, OnnxSpeechModel};

use std::any::Any;
use std::sync::Arc;

use ndarray::{Array2, Array3, ArrayView3};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;

use crate::error::{LoadError, Result};

/// Vocabulary index.
pub type TokenId = u32;

/// Immutable facts about a loaded model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelMetadata {
    pub vocabulary_size: usize,
    pub is_multilingual: bool,
    /// Mel frames per encoder window (3000 for 30 s).
    pub max_audio_frames: usize,
    /// Mel bins the encoder expects (80 or 128).
    pub n_mels: usize,
    /// Decoder context length in tokens.
    pub max_text_context: usize,
}

impl Default for ModelMetadata {
    fn default() -> Self {
        Self {
            vocabulary_size: 51_865,
            is_multilingual: true,
            max_audio_frames: crate::audio::N_FRAMES,
            n_mels: crate::audio::mel::DEFAULT_N_MELS,
            max_text_context: 448,
        }
    }
}

/// Encoder output for a batch of windows: `[batch, audio_ctx, d_model]`.
#[derive(Debug, Clone)]
pub struct EncodedAudio {
    pub features: Array3<f32>,
}

impl EncodedAudio {
    pub fn new(features: Array3<f32>) -> Self {
        Self { features }
    }

    /// Number of windows encoded.
    pub fn batch_len(&self) -> usize {
        self.features.shape()[0]
    }
}

/// Opaque per-sequence incremental decoder state.
///
/// The decoder loop only creates, threads and drops these; the backend that
/// fills them decides the concrete type.
#[derive(Default)]
pub struct KvCache(Option<Box<dyn Any + Send>>);

impl KvCache {
    pub fn new() -> Self {
        Self(None)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    /// Backend-side access. Returns `None` when empty or holding another type.
    pub fn get_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.0.as_mut().and_then(|b| b.downcast_mut::<T>())
    }

    pub fn insert<T: Any + Send>(&mut self, state: T) {
        self.0 = Some(Box::new(state));
    }

    pub fn clear(&mut self) {
        self.0 = None;
    }
}

impl std::fmt::Debug for KvCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvCache")
            .field("populated", &self.0.is_some())
            .finish()
    }
}

/// One live sequence in a forward call.
pub struct DecoderRow<'a> {
    /// Index into `EncodedAudio::features` along the batch axis.
    pub audio_row: usize,
    /// Full token history (prefix + generated so far).
    pub tokens: &'a [TokenId],
    pub kv_cache: &'a mut KvCache,
}

/// Contract for speech recognition backends.
pub trait SpeechModel: Send + 'static {
    /// Encode a batch of log-mel windows `[batch, n_mels, frames]`.
    ///
    /// # Errors
    /// Returns an error if the backend rejects the shape or fails to run.
    fn encode(&mut self, mel: ArrayView3<'_, f32>) -> Result<EncodedAudio>;

    /// Next-token logits for every row, `[rows.len(), vocab]`, in row order.
    ///
    /// Implementations may read and replace each row's `kv_cache`.
    fn forward(&mut self, audio: &EncodedAudio, rows: &mut [DecoderRow<'_>]) -> Result<Array2<f32>>;
}

/// Control and timestamp token ids a decoding policy must recognise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecialTokens {
    pub eot: TokenId,
    pub sot: TokenId,
    pub sot_prev: TokenId,
    pub transcribe: TokenId,
    pub translate: TokenId,
    pub no_timestamps: TokenId,
    pub no_speech: Option<TokenId>,
    /// `<|0.00|>`; every id at or above it is a timestamp.
    pub timestamp_begin: TokenId,
    /// Id of a bare space, suppressed at the first sampled position.
    pub blank: Option<TokenId>,
    /// `(code, token)` pairs in vocabulary order.
    pub languages: Vec<(String, TokenId)>,
    /// Symbols and annotations that never represent speech.
    pub non_speech: Vec<TokenId>,
}

impl SpecialTokens {
    pub fn is_timestamp(&self, token: TokenId) -> bool {
        token >= self.timestamp_begin
    }

    /// Ordinary text: everything below end-of-text.
    pub fn is_text(&self, token: TokenId) -> bool {
        token < self.eot
    }

    /// Timestamp position in 0.02 s steps.
    pub fn timestamp_index(&self, token: TokenId) -> Option<u32> {
        self.is_timestamp(token)
            .then(|| token - self.timestamp_begin)
    }

    pub fn language_token(&self, code: &str) -> Option<TokenId> {
        self.languages
            .iter()
            .find(|(c, _)| c.eq_ignore_ascii_case(code))
            .map(|(_, t)| *t)
    }

    pub fn language_code(&self, token: TokenId) -> Option<&str> {
        self.languages
            .iter()
            .find(|(_, t)| *t == token)
            .map(|(c, _)| c.as_str())
    }
}

/// Text encode/decode service for one model's vocabulary.
pub trait TextTokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>>;

    /// Decode ordinary text tokens; callers strip control tokens first.
    fn decode(&self, tokens: &[TokenId]) -> Result<String>;

    fn special_tokens(&self) -> &SpecialTokens;
}

/// Thread-safe reference-counted handle to a loaded model.
///
/// Clones share one backend; the backend is torn down (via its `Drop`) when
/// the last clone goes away.
///
/// Uses `parking_lot::Mutex` for non-poisoning on panic, so one failed batch
/// never bricks a cached model for later requests.
#[derive(Clone)]
pub struct ModelHandle {
    model: Arc<Mutex<dyn SpeechModel>>,
    tokenizer: Arc<dyn TextTokenizer>,
    metadata: ModelMetadata,
}

impl ModelHandle {
    /// Wrap any `SpeechModel` and its tokenizer in a `ModelHandle`.
    pub fn new<M, T>(model: M, tokenizer: T, metadata: ModelMetadata) -> Self
    where
        M: SpeechModel,
        T: TextTokenizer + 'static,
    {
        Self {
            model: Arc::new(Mutex::new(model)),
            tokenizer: Arc::new(tokenizer),
            metadata,
        }
    }

    /// Exclusive access to the backend for the duration of one batch.
    pub fn lock(&self) -> MutexGuard<'_, dyn SpeechModel> {
        self.model.lock()
    }

    pub fn tokenizer(&self) -> &dyn TextTokenizer {
        self.tokenizer.as_ref()
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    /// `true` when both handles share the same backend instance.
    pub fn same_model(&self, other: &ModelHandle) -> bool {
        Arc::ptr_eq(&self.model, &other.model)
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// Produces a `ModelHandle` for a model identifier. May perform disk or
/// network I/O; called outside every cache lock.
pub trait ModelLoader: Send + Sync {
    fn load(&self, model_id: &str) -> std::result::Result<ModelHandle, LoadError>;
}

impl<F> ModelLoader for F
where
    F: Fn(&str) -> std::result::Result<ModelHandle, LoadError> + Send + Sync,
{
    fn load(&self, model_id: &str) -> std::result::Result<ModelHandle, LoadError> {
        self(model_id)
    }
}
