use rubato::{FastFixedIn, PolynomialDegree, ResamplerConstructionError, Resampler};
use tracing::warn;

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> Result<FastFixedIn<f32>, ResamplerConstructionError> {
    FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,                     // No cutoff frequency, pass all frequencies
        PolynomialDegree::Cubic, // Cubic interpolation for quality
        chunk_size,
        1, // 1 channel (mono)
    )
}

/// Converts a slice of f32 samples to a vector of i16 samples.
pub fn convert_f32_to_i16(pcm32: &[f32]) -> Vec<i16> {
    pcm32
        .iter()
        .map(|&sample| (sample * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}

/// Converts a slice of i16 samples to a vector of f32 samples.
pub fn convert_i16_to_f32(pcm16: &[i16]) -> Vec<f32> {
    pcm16
        .iter()
        .map(|&sample| sample as f32 / 32768.0)
        .collect()
}

/// Mono resampler that accepts input blocks of any length.
///
/// Input is buffered until a full chunk is available, so output lags the
/// input by at most one chunk. Equal rates pass samples through untouched.
pub struct StreamResampler {
    resampler: Option<FastFixedIn<f32>>,
    chunk_size: usize,
    pending: Vec<f32>,
}

impl StreamResampler {
    pub fn new(in_rate: u32, out_rate: u32, chunk_size: usize) -> Result<Self, ResamplerConstructionError> {
        let resampler = if in_rate == out_rate {
            None
        } else {
            Some(create_resampler(f64::from(in_rate), f64::from(out_rate), chunk_size)?)
        };
        Ok(Self {
            resampler,
            chunk_size,
            pending: Vec::with_capacity(chunk_size * 2),
        })
    }

    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        let Some(resampler) = self.resampler.as_mut() else {
            return input.to_vec();
        };

        self.pending.extend_from_slice(input);
        let mut output = Vec::new();
        while self.pending.len() >= self.chunk_size {
            let chunk: Vec<f32> = self.pending.drain(..self.chunk_size).collect();
            match resampler.process(&[&chunk[..]], None) {
                Ok(mut channels) => output.append(&mut channels[0]),
                Err(e) => warn!(error = %e, "Resampling failed; dropping chunk."),
            }
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_create_resampler() {
        // Microphone rate down to the PCMU clock
        assert!(create_resampler(48000.0, 8000.0, 960).is_ok());

        // PCMU clock up to a typical output device
        assert!(create_resampler(8000.0, 44100.0, 160).is_ok());

        // Same input and output rates
        assert!(create_resampler(8000.0, 8000.0, 160).is_ok());
    }

    #[test]
    fn test_convert_f32_to_i16() {
        let input = vec![1.0f32, -1.0f32, 0.0f32, 0.5f32];
        let result = convert_f32_to_i16(&input);

        assert_eq!(result.len(), 4);
        assert_eq!(result[0], i16::MAX);
        // -1.0 * 32767 = -32767, not i16::MIN (-32768)
        assert_eq!(result[1], -32767);
        assert_eq!(result[2], 0);
        assert_eq!(result[3], (0.5 * i16::MAX as f32) as i16);

        // Values that need clamping
        let result = convert_f32_to_i16(&[2.0f32, -2.0f32]);
        assert_eq!(result, vec![i16::MAX, i16::MIN]);
    }

    #[test]
    fn test_convert_i16_to_f32() {
        let input = vec![i16::MAX, i16::MIN, 0i16, 16384i16];
        let result = convert_i16_to_f32(&input);

        assert_eq!(result.len(), 4);
        assert_abs_diff_eq!(result[0], i16::MAX as f32 / 32768.0, epsilon = 0.0001);
        assert_abs_diff_eq!(result[1], -1.0, epsilon = 0.0001);
        assert_abs_diff_eq!(result[2], 0.0, epsilon = 0.0001);
        assert_abs_diff_eq!(result[3], 0.5, epsilon = 0.0001);
    }

    #[test]
    fn test_equal_rates_pass_through() {
        let mut resampler = StreamResampler::new(8000, 8000, 160).unwrap();
        let input = vec![0.25f32; 37];
        assert_eq!(resampler.process(&input), input);
    }

    #[test]
    fn test_uneven_blocks_are_buffered() {
        let mut resampler = StreamResampler::new(48000, 8000, 480).unwrap();

        // Less than one chunk produces nothing yet.
        assert!(resampler.process(&vec![0.0f32; 300]).is_empty());

        // 4800 input samples in total is ten chunks of 80 output samples.
        let mut produced = 0;
        for block in [180usize, 1000, 2220, 1100] {
            produced += resampler.process(&vec![0.0f32; block]).len();
        }
        assert!((790..=810).contains(&produced), "produced {}", produced);
    }
}
