//! Offline sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! WAV inputs arrive at whatever rate they were recorded at; the encoder
//! requires 16 kHz mono f32. The whole buffer is available up front, so the
//! conversion runs in fixed-size blocks followed by one partial flush, and
//! the resampler's output delay is trimmed so the result stays aligned with
//! the input timeline.
//!
//! When both rates are equal the input is returned unchanged and no rubato
//! session is created.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::debug;

use crate::error::{Result, ScribeError};

/// Input frames per rubato call.
const CHUNK_SIZE: usize = 1_024;

/// Convert mono `samples` from `from_rate` to `to_rate`.
///
/// # Errors
/// `UnsupportedFormat` if a rate is zero or rubato rejects the ratio.
pub fn convert_sample_rate(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == 0 || to_rate == 0 {
        return Err(ScribeError::unsupported(format!(
            "invalid sample rate conversion {from_rate} → {to_rate}"
        )));
    }
    if from_rate == to_rate {
        return Ok(samples.to_vec());
    }
    if samples.is_empty() {
        return Ok(Vec::new());
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let mut resampler = FastFixedIn::<f32>::new(
        ratio,
        1.0, // fixed ratio — no dynamic adjustment
        PolynomialDegree::Cubic,
        CHUNK_SIZE,
        1, // mono
    )
    .map_err(|e| ScribeError::unsupported(format!("resampler init: {e}")))?;

    let expected = (samples.len() as f64 * ratio).ceil() as usize;
    let delay = resampler.output_delay();
    let mut output_buf = vec![vec![0f32; resampler.output_frames_max()]; 1];
    let mut result = Vec::with_capacity(expected + delay);

    let mut blocks = samples.chunks_exact(CHUNK_SIZE);
    for block in blocks.by_ref() {
        let (_, produced) = resampler
            .process_into_buffer(&[block], &mut output_buf, None)
            .map_err(|e| ScribeError::unsupported(format!("resampler: {e}")))?;
        result.extend_from_slice(&output_buf[0][..produced]);
    }

    let tail = blocks.remainder();
    if !tail.is_empty() {
        let (_, produced) = resampler
            .process_partial_into_buffer(Some(&[tail][..]), &mut output_buf, None)
            .map_err(|e| ScribeError::unsupported(format!("resampler: {e}")))?;
        result.extend_from_slice(&output_buf[0][..produced]);
    }

    // Drain the filter delay so the trailing audio is not lost.
    while result.len() < expected + delay {
        let (_, produced) = resampler
            .process_partial_into_buffer(None::<&[&[f32]]>, &mut output_buf, None)
            .map_err(|e| ScribeError::unsupported(format!("resampler: {e}")))?;
        if produced == 0 {
            break;
        }
        result.extend_from_slice(&output_buf[0][..produced]);
    }

    let mut out: Vec<f32> = result.into_iter().skip(delay).collect();
    out.truncate(expected);
    debug!(
        from_rate,
        to_rate,
        input = samples.len(),
        output = out.len(),
        "resampled waveform"
    );
    Ok(out)
}
