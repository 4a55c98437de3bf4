//! G.711 mu-law companding (ITU-T G.711), the PCMU payload format.

const BIAS: i32 = 0x84;
const CLIP: i32 = 32635;

/// Compresses one linear 16-bit sample into a mu-law byte.
pub fn encode_sample(pcm: i16) -> u8 {
    let mut magnitude = i32::from(pcm);
    let sign = if magnitude < 0 {
        magnitude = -magnitude;
        0x80
    } else {
        0
    };
    let biased = magnitude.min(CLIP) + BIAS;

    // Position of the highest set bit, relative to bit 7.
    let exponent = (31 - biased.leading_zeros() as i32 - 7).clamp(0, 7);
    let mantissa = (biased >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}

/// Expands one mu-law byte into a linear 16-bit sample.
pub fn decode_sample(byte: u8) -> i16 {
    let byte = !byte;
    let exponent = i32::from((byte >> 4) & 0x07);
    let mantissa = i32::from(byte & 0x0F);
    let magnitude = (((mantissa << 3) + BIAS) << exponent) - BIAS;
    let sample = if byte & 0x80 != 0 { -magnitude } else { magnitude };
    sample as i16
}

pub fn encode(samples: &[i16]) -> Vec<u8> {
    samples.iter().copied().map(encode_sample).collect()
}

pub fn decode(payload: &[u8]) -> Vec<i16> {
    payload.iter().copied().map(decode_sample).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_values() {
        assert_eq!(encode_sample(0), 0xFF);
        assert_eq!(decode_sample(0xFF), 0);

        // Full scale is clipped to the largest codeword.
        assert_eq!(encode_sample(i16::MAX), 0x80);
        assert_eq!(decode_sample(0x80), 32124);
        assert_eq!(encode_sample(i16::MIN), 0x00);
        assert_eq!(decode_sample(0x00), -32124);
    }

    #[test]
    fn test_quantisation_error_is_bounded() {
        for x in (-CLIP..=CLIP).step_by(7) {
            let decoded = i32::from(decode_sample(encode_sample(x as i16)));
            let bound = (x.abs() + BIAS) / 32 + 1;
            assert!(
                (decoded - x).abs() <= bound,
                "sample {} decoded to {} (bound {})",
                x,
                decoded,
                bound
            );
        }
    }

    #[test]
    fn test_sign_symmetry() {
        for x in [1i16, 100, 1_000, 10_000, 30_000] {
            assert_eq!(decode_sample(encode_sample(-x)), -decode_sample(encode_sample(x)));
        }
    }

    #[test]
    fn test_slices_keep_length() {
        let samples = vec![0i16, 512, -512, 8_000];
        let payload = encode(&samples);
        assert_eq!(payload.len(), samples.len());
        assert_eq!(decode(&payload).len(), samples.len());
    }
}
