//! `Transcriber` — top-level coordinator.
//!
//! ## Request flow
//!
//! ```text
//! transcribe(audio, model_id, options)
//!     ├─► options.validate()
//!     ├─► AudioDecoder::load_waveform   → 16 kHz mono f32
//!     ├─► ModelCache::acquire           → ModelHandle (loader runs on miss)
//!     └─► pipeline::run                 → TranscriptionResult
//!                                         (+ TranscribeProgress per batch)
//! ```
//!
//! `Transcriber` is cheap to clone; clones share the cache, the loader, the
//! audio decoder and the progress channel. Any number of requests may run
//! concurrently against one instance.

pub mod pipeline;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, info_span};

use crate::{
    audio::{AudioDecoder, AudioInput, DefaultAudioDecoder},
    cache::{CacheStats, ModelCache},
    error::{Result, ScribeError},
    inference::ModelLoader,
    options::{TranscribeOptions, TranscriberConfig},
    result::{TranscribeProgress, TranscriptionResult},
};

/// Progress events buffered for slow subscribers.
const PROGRESS_CAP: usize = 256;

#[derive(Clone)]
pub struct Transcriber {
    config: TranscriberConfig,
    cache: Arc<ModelCache>,
    loader: Arc<dyn ModelLoader>,
    audio: Arc<dyn AudioDecoder>,
    progress_tx: broadcast::Sender<TranscribeProgress>,
}

impl std::fmt::Debug for Transcriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transcriber")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl Transcriber {
    /// Create a transcriber with its own model cache and the default audio
    /// decoder (cached under `config.audio_cache_dir` when set).
    pub fn new(config: TranscriberConfig, loader: Arc<dyn ModelLoader>) -> Self {
        let audio = match &config.audio_cache_dir {
            Some(dir) => DefaultAudioDecoder::new().with_cache_dir(dir),
            None => DefaultAudioDecoder::new(),
        };
        let (progress_tx, _) = broadcast::channel(PROGRESS_CAP);
        Self {
            cache: Arc::new(ModelCache::new(config.cache_capacity)),
            config,
            loader,
            audio: Arc::new(audio),
            progress_tx,
        }
    }

    pub fn with_audio_decoder(mut self, audio: Arc<dyn AudioDecoder>) -> Self {
        self.audio = audio;
        self
    }

    /// Share an existing cache, e.g. between transcribers with different
    /// loaders.
    pub fn with_cache(mut self, cache: Arc<ModelCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn config(&self) -> &TranscriberConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<ModelCache> {
        &self.cache
    }

    /// Transcribe `audio` with the model named `model_id`.
    ///
    /// # Errors
    /// - `InvalidOptions` for rejected options.
    /// - `UnsupportedFormat` when the audio cannot be decoded.
    /// - `Load` when the model cannot be loaded.
    /// - `Inference` for backend failures.
    pub fn transcribe(
        &self,
        audio: impl Into<AudioInput>,
        model_id: &str,
        options: &TranscribeOptions,
    ) -> Result<TranscriptionResult> {
        self.run(audio.into(), model_id, options, None)
    }

    /// As [`transcribe`](Self::transcribe), aborting with
    /// `ScribeError::Cancelled` once `cancel` is set. The flag is checked
    /// between decoding steps.
    pub fn transcribe_with_cancel(
        &self,
        audio: impl Into<AudioInput>,
        model_id: &str,
        options: &TranscribeOptions,
        cancel: &AtomicBool,
    ) -> Result<TranscriptionResult> {
        self.run(audio.into(), model_id, options, Some(cancel))
    }

    /// Run [`transcribe`](Self::transcribe) on Tokio's blocking pool.
    pub async fn transcribe_async(
        &self,
        audio: AudioInput,
        model_id: impl Into<String>,
        options: TranscribeOptions,
    ) -> Result<TranscriptionResult> {
        let this = self.clone();
        let model_id = model_id.into();
        tokio::task::spawn_blocking(move || this.transcribe(audio, &model_id, &options))
            .await
            .map_err(|e| ScribeError::Other(anyhow::anyhow!("transcription task failed: {e}")))?
    }

    /// Receive one event per decoded batch of every later request.
    pub fn subscribe_progress(&self) -> broadcast::Receiver<TranscribeProgress> {
        self.progress_tx.subscribe()
    }

    /// # Errors
    /// `InvalidOptions` for a zero capacity.
    pub fn set_cache_capacity(&self, capacity: usize) -> Result<()> {
        self.cache.set_capacity(capacity)
    }

    /// Drops `model_id` and, for an id without `@quant`, its quantized
    /// variants. Returns how many resident models were dropped.
    pub fn unload_model(&self, model_id: &str) -> usize {
        self.cache.unload(model_id)
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn run(
        &self,
        audio: AudioInput,
        model_id: &str,
        options: &TranscribeOptions,
        cancel: Option<&AtomicBool>,
    ) -> Result<TranscriptionResult> {
        let _span = info_span!("transcribe", model_id).entered();
        options.validate()?;

        let samples = self.audio.load_waveform(audio)?;
        info!(
            samples = samples.len(),
            seconds = samples.len() as f64 / f64::from(crate::audio::SAMPLE_RATE),
            "waveform ready"
        );

        let loader = Arc::clone(&self.loader);
        let model = self.cache.acquire(model_id, |id| loader.load(id))?;

        pipeline::run(pipeline::PipelineContext {
            model_id,
            model,
            samples: &samples,
            options,
            context_tokens: self.config.context_tokens,
            cancel,
            progress_tx: &self.progress_tx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::stub::StubLoader;

    fn transcriber() -> Transcriber {
        Transcriber::new(TranscriberConfig::default(), Arc::new(StubLoader))
    }

    #[test]
    fn invalid_options_fail_before_loading() {
        let t = transcriber();
        let options = TranscribeOptions {
            batch_size: 0,
            ..Default::default()
        };
        let err = t.transcribe(vec![0.0f32; 16], "stub", &options);
        assert!(matches!(err, Err(ScribeError::InvalidOptions(_))));
        assert_eq!(t.cache_stats().occupancy, 0);
    }

    #[test]
    fn cache_surface_delegates() {
        let t = transcriber();
        t.transcribe(vec![0.0f32; 16_000], "stub", &TranscribeOptions::default())
            .unwrap();
        assert_eq!(t.cache_stats().keys(), vec!["stub"]);
        assert_eq!(t.unload_model("stub"), 1);
        assert!(t.set_cache_capacity(0).is_err());
        t.set_cache_capacity(2).unwrap();
        t.clear_cache();
        assert_eq!(t.cache_stats().capacity, 2);
        assert_eq!(t.cache_stats().occupancy, 0);
    }

    #[test]
    fn missing_audio_file_is_unsupported() {
        let t = transcriber();
        let err = t.transcribe(
            std::path::PathBuf::from("/definitely/not/here.wav"),
            "stub",
            &TranscribeOptions::default(),
        );
        assert!(matches!(err, Err(ScribeError::UnsupportedFormat { .. })));
    }
}
