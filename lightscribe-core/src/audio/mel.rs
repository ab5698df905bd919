//! Log-mel spectrogram frontend.
//!
//! | Parameter       | Value          |
//! |-----------------|----------------|
//! | Hann window     | 400 samples    |
//! | FFT size        | 400            |
//! | Frequency bins  | 201 (400/2+1)  |
//! | Hop length      | 160 (10 ms)    |
//! | Mel bands       | 80 or 128      |
//! | Mel range       | 0–8 000 Hz     |
//!
//! Output is `[n_mels, frames]`, scaled `(max(log10, peak − 8) + 4) / 4`.

use std::sync::Arc;

use ndarray::{Array2, ArrayViewMut2};
use rustfft::{num_complex::Complex, Fft, FftPlanner};

use super::{HOP_LENGTH, N_FFT, SAMPLE_RATE};

pub const DEFAULT_N_MELS: usize = 80;
const N_FREQS: usize = N_FFT / 2 + 1;

/// Precomputed window, filterbank and FFT plan. Cheap to share.
#[derive(Clone)]
pub struct MelFrontend {
    n_mels: usize,
    filters: Arc<Vec<Vec<f32>>>,
    hann_window: Arc<Vec<f32>>,
    fft: Arc<dyn Fft<f32>>,
}

impl MelFrontend {
    pub fn new(n_mels: usize) -> Self {
        Self {
            n_mels,
            filters: Arc::new(build_mel_filters(N_FFT, SAMPLE_RATE, n_mels, 0.0, 8_000.0)),
            hann_window: Arc::new(build_hann_window(N_FFT)),
            fft: FftPlanner::<f32>::new().plan_fft_forward(N_FFT),
        }
    }

    pub fn n_mels(&self) -> usize {
        self.n_mels
    }

    /// Spectrogram of `samples` zero-padded to `frames * HOP_LENGTH`.
    pub fn log_mel(&self, samples: &[f32], frames: usize) -> Array2<f32> {
        let mut out = Array2::<f32>::zeros((self.n_mels, frames));
        self.log_mel_into(samples, out.view_mut());
        out
    }

    /// Same as [`log_mel`](Self::log_mel), writing into a caller-owned view
    /// (a row of a batch tensor).
    pub fn log_mel_into(&self, samples: &[f32], mut out: ArrayViewMut2<'_, f32>) {
        let frames = out.shape()[1];
        let total = frames * HOP_LENGTH;
        let active_samples = samples.len().min(total);

        let mut padded = samples[..active_samples].to_vec();
        padded.resize(total, 0.0);
        let centered = reflect_pad(&padded, N_FFT / 2);

        // Frames entirely inside the zero tail carry no energy; skip their FFTs.
        let active_frames = (active_samples + N_FFT).div_ceil(HOP_LENGTH).min(frames);

        out.fill(0.0);
        let mut fft_buf = vec![Complex::new(0.0f32, 0.0); N_FFT];
        for frame in 0..active_frames {
            let start = frame * HOP_LENGTH;
            for (i, slot) in fft_buf.iter_mut().enumerate() {
                *slot = Complex::new(centered[start + i] * self.hann_window[i], 0.0);
            }
            self.fft.process(&mut fft_buf);

            for m in 0..self.n_mels {
                let filter = &self.filters[m];
                let mut energy = 0.0f32;
                for k in 0..N_FREQS {
                    energy += filter[k] * fft_buf[k].norm_sqr();
                }
                out[[m, frame]] = energy;
            }
        }

        out.mapv_inplace(|v| v.max(1e-10).log10());
        let max_val = out.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        out.mapv_inplace(|v| (v.max(max_val - 8.0) + 4.0) / 4.0);
    }
}

impl std::fmt::Debug for MelFrontend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MelFrontend")
            .field("n_mels", &self.n_mels)
            .finish_non_exhaustive()
    }
}

impl Default for MelFrontend {
    fn default() -> Self {
        Self::new(DEFAULT_N_MELS)
    }
}

fn build_hann_window(n: usize) -> Vec<f32> {
    use std::f32::consts::PI;
    (0..n)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / n as f32).cos()))
        .collect()
}

fn build_mel_filters(
    fft_size: usize,
    sr: u32,
    n_mels: usize,
    fmin: f32,
    fmax: f32,
) -> Vec<Vec<f32>> {
    let n_freqs = fft_size / 2 + 1;
    let mel_min = hz_to_mel_slaney(fmin);
    let mel_max = hz_to_mel_slaney(fmax);

    let hz_pts: Vec<f32> = (0..=(n_mels + 1))
        .map(|i| mel_min + (mel_max - mel_min) * i as f32 / (n_mels + 1) as f32)
        .map(mel_to_hz_slaney)
        .collect();
    let fft_freqs: Vec<f32> = (0..n_freqs)
        .map(|k| k as f32 * sr as f32 / fft_size as f32)
        .collect();

    let mut filters = vec![vec![0f32; n_freqs]; n_mels];
    for (m, filter) in filters.iter_mut().enumerate() {
        let lower = hz_pts[m];
        let center = hz_pts[m + 1];
        let upper = hz_pts[m + 2];
        let down_denom = (center - lower).max(1e-10);
        let up_denom = (upper - center).max(1e-10);
        let enorm = 2.0 / (upper - lower).max(1e-10);

        for (k, &freq) in fft_freqs.iter().enumerate() {
            let w = if freq >= lower && freq <= center {
                (freq - lower) / down_denom
            } else if freq > center && freq <= upper {
                (upper - freq) / up_denom
            } else {
                0.0
            };
            filter[k] = (w * enorm).max(0.0);
        }
    }
    filters
}

fn reflect_pad(samples: &[f32], pad: usize) -> Vec<f32> {
    if pad == 0 {
        return samples.to_vec();
    }
    if samples.is_empty() {
        return vec![0.0; pad * 2];
    }
    if samples.len() == 1 {
        return vec![samples[0]; 1 + pad * 2];
    }

    let n = samples.len() as isize;
    (-(pad as isize)..(n + pad as isize))
        .map(|i| samples[reflect_index(i, samples.len())])
        .collect()
}

fn reflect_index(mut i: isize, len: usize) -> usize {
    let max = len as isize - 1;
    while i < 0 || i > max {
        if i < 0 {
            i = -i;
        } else {
            i = 2 * max - i;
        }
    }
    i as usize
}

fn hz_to_mel_slaney(hz: f32) -> f32 {
    let f_sp = 200.0 / 3.0;
    let min_log_hz = 1_000.0;
    let min_log_mel = min_log_hz / f_sp; // 15
    let logstep = (6.4_f32).ln() / 27.0;
    if hz >= min_log_hz {
        min_log_mel + (hz / min_log_hz).ln() / logstep
    } else {
        hz / f_sp
    }
}

fn mel_to_hz_slaney(mel: f32) -> f32 {
    let f_sp = 200.0 / 3.0;
    let min_log_hz = 1_000.0;
    let min_log_mel = min_log_hz / f_sp;
    let logstep = (6.4_f32).ln() / 27.0;
    if mel >= min_log_mel {
        min_log_hz * (logstep * (mel - min_log_mel)).exp()
    } else {
        mel * f_sp
    }
}
