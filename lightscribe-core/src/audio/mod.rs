//! Audio input: decoding to 16 kHz mono f32, mel frontend and windowing.
//!
//! ## Input resolution
//!
//! ```text
//! AudioInput::FilePath ──► AudioDecoder ──► Vec<f32> @ 16 kHz ──► AudioWindower
//! AudioInput::RawSamples ─────────────────┘
//! ```
//!
//! `DefaultAudioDecoder` reads `.wav` files in-process with `hound` and
//! hands everything else to an external `ffmpeg` process. Decoded audio can
//! optionally be cached on disk, keyed by the SHA-256 of the source path and
//! target sample rate.

pub mod mel;
pub mod resample;
pub mod window;

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{Result, ScribeError};

pub use window::{AudioWindow, AudioWindower, ClipRange, WindowSpan};

// ── Audio constants ──────────────────────────────────────────────────────────
pub const SAMPLE_RATE: u32 = 16_000;
pub const N_FFT: usize = 400;
pub const HOP_LENGTH: usize = 160;
pub const CHUNK_LENGTH_SECS: usize = 30;
/// Samples per 30 s window.
pub const N_SAMPLES: usize = CHUNK_LENGTH_SECS * SAMPLE_RATE as usize;
/// Mel frames per 30 s window.
pub const N_FRAMES: usize = N_SAMPLES / HOP_LENGTH;
/// 10 ms per mel frame.
pub const FRAMES_PER_SECOND: usize = SAMPLE_RATE as usize / HOP_LENGTH;
/// Mel frames per timestamp-token step (the encoder downsamples by 2).
pub const FRAMES_PER_TIMESTAMP: usize = 2;

/// Audio handed to the transcriber.
#[derive(Debug, Clone)]
pub enum AudioInput {
    /// Any container/codec the decoder understands.
    FilePath(PathBuf),
    /// Mono f32 samples already at 16 kHz.
    RawSamples(Vec<f32>),
}

impl From<PathBuf> for AudioInput {
    fn from(path: PathBuf) -> Self {
        Self::FilePath(path)
    }
}

impl From<&Path> for AudioInput {
    fn from(path: &Path) -> Self {
        Self::FilePath(path.to_path_buf())
    }
}

impl From<Vec<f32>> for AudioInput {
    fn from(samples: Vec<f32>) -> Self {
        Self::RawSamples(samples)
    }
}

/// Turns audio files into mono f32 samples at [`SAMPLE_RATE`].
pub trait AudioDecoder: Send + Sync {
    /// # Errors
    /// `UnsupportedFormat` when the file cannot be read or decoded.
    fn decode_file(&self, path: &Path) -> Result<Vec<f32>>;

    /// Resolve any [`AudioInput`] to raw samples.
    fn load_waveform(&self, input: AudioInput) -> Result<Vec<f32>> {
        match input {
            AudioInput::RawSamples(samples) => Ok(samples),
            AudioInput::FilePath(path) => self.decode_file(&path),
        }
    }
}

// ── WAV ──────────────────────────────────────────────────────────────────────

/// In-process WAV reader: downmixes to mono and resamples to 16 kHz.
#[derive(Debug, Clone, Copy, Default)]
pub struct WavDecoder;

impl AudioDecoder for WavDecoder {
    fn decode_file(&self, path: &Path) -> Result<Vec<f32>> {
        let mut reader = hound::WavReader::open(path)
            .map_err(|e| ScribeError::unsupported(format!("{}: {e}", path.display())))?;
        let spec = reader.spec();
        let channels = spec.channels.max(1) as usize;

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| ScribeError::unsupported(format!("{}: {e}", path.display())))?,
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<std::result::Result<_, _>>()
                    .map_err(|e| ScribeError::unsupported(format!("{}: {e}", path.display())))?
            }
        };

        let mono: Vec<f32> = if channels == 1 {
            interleaved
        } else {
            interleaved
                .chunks(channels)
                .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
                .collect()
        };

        debug!(
            path = %path.display(),
            sample_rate = spec.sample_rate,
            channels,
            samples = mono.len(),
            "decoded wav"
        );
        resample::convert_sample_rate(&mono, spec.sample_rate, SAMPLE_RATE)
    }
}

// ── ffmpeg ───────────────────────────────────────────────────────────────────

/// Decodes through an external `ffmpeg` process (s16le, mono, 16 kHz).
#[derive(Debug, Clone)]
pub struct FfmpegDecoder {
    binary: PathBuf,
}

impl FfmpegDecoder {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for FfmpegDecoder {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl AudioDecoder for FfmpegDecoder {
    fn decode_file(&self, path: &Path) -> Result<Vec<f32>> {
        if !path.exists() {
            return Err(ScribeError::unsupported(format!(
                "{}: file not found",
                path.display()
            )));
        }
        let output = Command::new(&self.binary)
            .args(["-nostdin", "-threads", "0", "-i"])
            .arg(path)
            .args(["-f", "s16le", "-ac", "1", "-acodec", "pcm_s16le", "-ar"])
            .arg(SAMPLE_RATE.to_string())
            .arg("-")
            .output()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => ScribeError::unsupported(format!(
                    "{} not available: {e}",
                    self.binary.display()
                )),
                _ => ScribeError::Io(e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ScribeError::unsupported(format!(
                "failed to load audio {}: {}",
                path.display(),
                stderr.trim()
            )));
        }
        Ok(pcm16le_to_f32(&output.stdout))
    }
}

fn pcm16le_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32_768.0)
        .collect()
}

// ── Dispatching decoder with optional on-disk cache ──────────────────────────

/// WAV by extension, ffmpeg for everything else.
#[derive(Debug, Clone, Default)]
pub struct DefaultAudioDecoder {
    ffmpeg: FfmpegDecoder,
    cache_dir: Option<PathBuf>,
}

impl DefaultAudioDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ffmpeg(mut self, ffmpeg: FfmpegDecoder) -> Self {
        self.ffmpeg = ffmpeg;
        self
    }

    /// Cache decoded waveforms under `dir`; the directory is created on demand.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    fn decode_uncached(&self, path: &Path) -> Result<Vec<f32>> {
        let is_wav = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("wav"))
            .unwrap_or(false);
        if is_wav {
            WavDecoder.decode_file(path)
        } else {
            self.ffmpeg.decode_file(path)
        }
    }
}

impl AudioDecoder for DefaultAudioDecoder {
    fn decode_file(&self, path: &Path) -> Result<Vec<f32>> {
        let Some(dir) = self.cache_dir.as_deref() else {
            return self.decode_uncached(path);
        };

        let cached = cache_path(dir, path, SAMPLE_RATE);
        if cached.exists() {
            match WavDecoder.decode_file(&cached) {
                Ok(samples) => {
                    debug!(cache = %cached.display(), "decoded audio cache hit");
                    return Ok(samples);
                }
                Err(e) => warn!(cache = %cached.display(), error = %e, "ignoring unreadable audio cache entry"),
            }
        }

        let samples = self.decode_uncached(path)?;
        match save_processed_audio(&samples, &cached) {
            Ok(()) => info!(cache = %cached.display(), "cached decoded audio"),
            Err(e) => warn!(cache = %cached.display(), error = %e, "failed to write audio cache"),
        }
        Ok(samples)
    }
}

/// Cache file for `source` decoded at `sample_rate`: `<sha256>_<rate>.wav`.
pub fn cache_path(dir: &Path, source: &Path, sample_rate: u32) -> PathBuf {
    let digest = Sha256::digest(source.to_string_lossy().as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    dir.join(format!("{hex}_{sample_rate}.wav"))
}

/// Write 16 kHz mono samples as a 32-bit float WAV, creating parent dirs.
pub fn save_processed_audio(samples: &[f32], dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(dest, spec)
        .map_err(|e| ScribeError::Other(anyhow::anyhow!("audio cache: {e}")))?;
    for &s in samples {
        writer
            .write_sample(s)
            .map_err(|e| ScribeError::Other(anyhow::anyhow!("audio cache: {e}")))?;
    }
    writer
        .finalize()
        .map_err(|e| ScribeError::Other(anyhow::anyhow!("audio cache: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_int_wav(path: &Path, rate: u32, channels: u16, frames: &[i16]) {
        let spec = hound::WavSpec {
            channels,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut w = hound::WavWriter::create(path, spec).unwrap();
        for &s in frames {
            w.write_sample(s).unwrap();
        }
        w.finalize().unwrap();
    }

    #[test]
    fn raw_samples_bypass_decoding() {
        let decoder = DefaultAudioDecoder::new();
        let out = decoder
            .load_waveform(AudioInput::RawSamples(vec![0.5, -0.5]))
            .unwrap();
        assert_eq!(out, vec![0.5, -0.5]);
    }

    #[test]
    fn wav_stereo_is_downmixed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        write_int_wav(&path, SAMPLE_RATE, 2, &[16_384, 0, -16_384, 0]);
        let out = WavDecoder.decode_file(&path).unwrap();
        assert_eq!(out.len(), 2);
        assert!((out[0] - 0.25).abs() < 1e-4);
        assert!((out[1] + 0.25).abs() < 1e-4);
    }

    #[test]
    fn garbage_file_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.wav");
        std::fs::write(&path, b"not a riff header").unwrap();
        let err = DefaultAudioDecoder::new().decode_file(&path);
        assert!(matches!(err, Err(ScribeError::UnsupportedFormat { .. })));
    }

    #[test]
    fn missing_ffmpeg_binary_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp3");
        std::fs::write(&path, b"id3").unwrap();
        let decoder = FfmpegDecoder::new(dir.path().join("no-such-ffmpeg"));
        assert!(matches!(
            decoder.decode_file(&path),
            Err(ScribeError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn cache_round_trip_serves_second_read_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("speech.wav");
        write_int_wav(&src, SAMPLE_RATE, 1, &[0, 8_192, -8_192, 0]);
        let cache_dir = dir.path().join("audio_cache");
        let decoder = DefaultAudioDecoder::new().with_cache_dir(&cache_dir);

        let first = decoder.decode_file(&src).unwrap();
        let entry = cache_path(&cache_dir, &src, SAMPLE_RATE);
        assert!(entry.exists());

        // The cache entry now answers even if the source disappears.
        std::fs::remove_file(&src).unwrap();
        let second = decoder.decode_file(&src).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn cache_key_depends_on_path_and_rate() {
        let dir = Path::new("/tmp/cache");
        let a = cache_path(dir, Path::new("a.mp3"), 16_000);
        let b = cache_path(dir, Path::new("b.mp3"), 16_000);
        let a8 = cache_path(dir, Path::new("a.mp3"), 8_000);
        assert_ne!(a, b);
        assert_ne!(a, a8);
        assert!(a.to_string_lossy().ends_with("_16000.wav"));
    }

    #[test]
    fn pcm_conversion_scales_to_unit_range() {
        let bytes = [0x00, 0x80, 0xff, 0x7f];
        let out = pcm16le_to_f32(&bytes);
        assert_eq!(out[0], -1.0);
        assert!((out[1] - 0.99997).abs() < 1e-4);
    }
}
