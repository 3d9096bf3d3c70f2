//! Output-rate resampling between the codec rate and the sink rate.
//!
//! The sink pulls a fixed number of samples at its own rate; when that
//! differs from the codec rate a resampler bridges the player's working
//! buffer into the sink's buffer.

use anyhow::{Context, Result};
use rubato::{FftFixedIn, Resampler};
use tracing::warn;

/// Converts one callback of interleaved PCM to the sink rate.
///
/// Returns the number of samples per channel produced, at most
/// `output_samples`.
pub trait OutputResampler: Send {
    fn resample(
        &mut self,
        input: &[i16],
        input_samples: usize,
        output: &mut [i16],
        output_samples: usize,
    ) -> usize;
}

/// Rubato-backed fixed-chunk converter.
///
/// The chunk size is the codec's callback length, so one `resample` call maps
/// exactly onto one decoded callback.
pub struct RateConverter {
    inner: FftFixedIn<f64>,
    channels: usize,
    chunk_samples: usize,
    planes: Vec<Vec<f64>>,
}

impl RateConverter {
    pub fn new(
        input_rate: u32,
        output_rate: u32,
        chunk_samples: usize,
        channels: usize,
    ) -> Result<Self> {
        let inner = FftFixedIn::<f64>::new(
            input_rate as usize,
            output_rate as usize,
            chunk_samples,
            2,
            channels,
        )
        .context("Failed to create resampler")?;

        Ok(Self {
            inner,
            channels,
            chunk_samples,
            planes: vec![vec![0.0; chunk_samples]; channels],
        })
    }
}

impl OutputResampler for RateConverter {
    fn resample(
        &mut self,
        input: &[i16],
        input_samples: usize,
        output: &mut [i16],
        output_samples: usize,
    ) -> usize {
        let frames = input_samples
            .min(input.len() / self.channels)
            .min(self.chunk_samples);

        for (ch, plane) in self.planes.iter_mut().enumerate() {
            plane.clear();
            plane.extend(
                input
                    .chunks_exact(self.channels)
                    .take(frames)
                    .map(|frame| frame[ch] as f64 / 32_768.0),
            );
            plane.resize(self.chunk_samples, 0.0);
        }

        let resampled = match self.inner.process(&self.planes, None) {
            Ok(out) => out,
            Err(e) => {
                warn!("Resampling failed: {}", e);
                output[..output_samples * self.channels].fill(0);
                return 0;
            }
        };

        let produced = resampled
            .first()
            .map(|plane| plane.len())
            .unwrap_or(0)
            .min(output_samples);

        for frame_idx in 0..produced {
            for ch in 0..self.channels {
                let s = (resampled[ch][frame_idx] * 32_767.0).clamp(-32_768.0, 32_767.0);
                output[frame_idx * self.channels + ch] = s as i16;
            }
        }
        for s in &mut output[produced * self.channels..output_samples * self.channels] {
            *s = 0;
        }

        produced
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downsample_produces_proportional_output() {
        let mut rc = RateConverter::new(48_000, 16_000, 960, 1).unwrap();
        let input: Vec<i16> = (0..960)
            .map(|i| ((i as f32 * 0.02).sin() * 12_000.0) as i16)
            .collect();
        let mut output = vec![0i16; 400];

        let produced = rc.resample(&input, 960, &mut output, 400);
        assert!(produced > 0);
        assert!(produced <= 320 + 1);
    }

    #[test]
    fn test_output_is_capped_by_request() {
        let mut rc = RateConverter::new(48_000, 48_000, 960, 2).unwrap();
        let input = vec![1_000i16; 960 * 2];
        let mut output = vec![0i16; 100 * 2];

        let produced = rc.resample(&input, 960, &mut output, 100);
        assert!(produced <= 100);
    }
}
