//! Sample-rate conversion between the telephony rate (8 kHz) and the rates
//! used by the AI backend.

/// Telephony sample rate
pub const TELEPHONY_RATE: u32 = 8000;

/// Rate of the uplink PCM sent to the backend
pub const UPLINK_RATE: u32 = 16000;

/// Convert to 8 kHz.
///
/// 8000 is copied through. 16000 and 24000 are linearly interpolated to
/// `len * 8000 / rate` samples (floor), which is empty for fewer than two
/// input samples. Any other rate yields an empty vector.
pub fn downsample_to_8k(input: &[i16], input_rate: u32) -> Vec<i16> {
    match input_rate {
        8000 => input.to_vec(),
        16000 | 24000 => {
            if input.len() < 2 {
                return Vec::new();
            }
            let out_len = input.len() * TELEPHONY_RATE as usize / input_rate as usize;
            let step = input_rate as f64 / TELEPHONY_RATE as f64;
            let last = input[input.len() - 1];

            (0..out_len)
                .map(|i| {
                    let pos = i as f64 * step;
                    let idx = pos as usize;
                    if idx >= input.len() - 1 {
                        return last;
                    }
                    let frac = pos - idx as f64;
                    let a = input[idx] as f64;
                    let b = input[idx + 1] as f64;
                    (a + (b - a) * frac).clamp(i16::MIN as f64, i16::MAX as f64) as i16
                })
                .collect()
        }
        _ => Vec::new(),
    }
}

/// 8 kHz to 16 kHz by sample duplication.
pub fn upsample_8k_to_16k(input: &[i16]) -> Vec<i16> {
    let mut out = Vec::with_capacity(input.len() * 2);
    for &sample in input {
        out.push(sample);
        out.push(sample);
    }
    out
}
