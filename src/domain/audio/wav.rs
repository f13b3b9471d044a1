//! WAV and raw PCM decoding for audio chunks streamed by the AI backend
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;

/// Canonical RIFF/WAVE header size; `data` starts right after it
pub const WAV_HEADER_LEN: usize = 44;

/// Audio payload errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AudioError {
    #[error("base64 decode failed: {0}")]
    Base64(String),

    #[error("invalid wav: {0}")]
    InvalidFormat(String),

    #[error("unsupported wav: channels={channels} bits={bits_per_sample}")]
    UnsupportedFormat { channels: u16, bits_per_sample: u16 },

    #[error("unsupported audio data type: {0}")]
    UnsupportedDataType(String),
}

/// WAV audio format
#[derive(Debug, Clone, PartialEq)]
pub struct WavFormat {
    /// Number of channels (1 = mono, 2 = stereo)
    pub channels: u16,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Bits per sample
    pub bits_per_sample: u16,
}

impl WavFormat {
    /// Read the fixed fields of a 44-byte canonical header.
    pub fn from_header(wav: &[u8]) -> Result<Self, AudioError> {
        if wav.len() < WAV_HEADER_LEN {
            return Err(AudioError::InvalidFormat(format!(
                "wav too small: {}",
                wav.len()
            )));
        }
        if &wav[0..4] != b"RIFF" || &wav[8..12] != b"WAVE" {
            return Err(AudioError::InvalidFormat("not a wav".to_string()));
        }

        Ok(Self {
            channels: u16::from_le_bytes([wav[22], wav[23]]),
            sample_rate: u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]),
            bits_per_sample: u16::from_le_bytes([wav[34], wav[35]]),
        })
    }

    pub fn is_pcm16_mono(&self) -> bool {
        self.channels == 1 && self.bits_per_sample == 16
    }
}

/// Decoded PCM16 mono audio at a known rate
#[derive(Debug, Clone, PartialEq)]
pub struct PcmChunk {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

/// Mean-square level, for one-shot diagnostics
pub fn mean_square(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    sum / samples.len() as f64
}

/// Parse a PCM16 mono WAV whose samples start at byte 44.
pub fn wav_to_pcm16_mono(wav: &[u8]) -> Result<PcmChunk, AudioError> {
    let format = WavFormat::from_header(wav)?;
    if !format.is_pcm16_mono() {
        return Err(AudioError::UnsupportedFormat {
            channels: format.channels,
            bits_per_sample: format.bits_per_sample,
        });
    }
    Ok(PcmChunk {
        samples: pcm16le_to_samples(&wav[WAV_HEADER_LEN..]),
        sample_rate: format.sample_rate,
    })
}

/// Little-endian 16-bit samples; a trailing odd byte is ignored.
pub fn pcm16le_to_samples(data: &[u8]) -> Vec<i16> {
    data.chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect()
}

pub fn samples_to_pcm16le(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}

/// Default rate for raw `pcm16le` chunks that do not declare one
pub const DEFAULT_PCM16LE_RATE: u32 = 24000;

/// Decode a base64 audio chunk of type `wav` or `pcm16le`.
///
/// A declared rate greater than zero wins over whatever the WAV header says.
pub fn decode_stream_audio(
    data_type: &str,
    declared_rate: u32,
    audio_data: &str,
) -> Result<PcmChunk, AudioError> {
    let raw = STANDARD
        .decode(audio_data.trim())
        .map_err(|e| AudioError::Base64(e.to_string()))?;

    match data_type {
        "wav" => {
            let mut chunk = wav_to_pcm16_mono(&raw)?;
            if declared_rate > 0 {
                chunk.sample_rate = declared_rate;
            }
            Ok(chunk)
        }
        "pcm16le" => Ok(PcmChunk {
            samples: pcm16le_to_samples(&raw),
            sample_rate: if declared_rate > 0 {
                declared_rate
            } else {
                DEFAULT_PCM16LE_RATE
            },
        }),
        other => Err(AudioError::UnsupportedDataType(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn make_wav(channels: u16, rate: u32, bits: u16, samples: &[i16]) -> Vec<u8> {
        let data = samples_to_pcm16le(samples);
        let mut wav = Vec::with_capacity(WAV_HEADER_LEN + data.len());
        wav.extend_from_slice(b"RIFF");
        wav.extend_from_slice(&(36 + data.len() as u32).to_le_bytes());
        wav.extend_from_slice(b"WAVE");
        wav.extend_from_slice(b"fmt ");
        wav.extend_from_slice(&16u32.to_le_bytes());
        wav.extend_from_slice(&1u16.to_le_bytes());
        wav.extend_from_slice(&channels.to_le_bytes());
        wav.extend_from_slice(&rate.to_le_bytes());
        wav.extend_from_slice(&(rate * channels as u32 * bits as u32 / 8).to_le_bytes());
        wav.extend_from_slice(&(channels * bits / 8).to_le_bytes());
        wav.extend_from_slice(&bits.to_le_bytes());
        wav.extend_from_slice(b"data");
        wav.extend_from_slice(&(data.len() as u32).to_le_bytes());
        wav.extend_from_slice(&data);
        wav
    }

    #[test]
    fn test_wav_to_pcm16_mono() {
        let wav = make_wav(1, 16000, 16, &[1, -2, 300]);
        let chunk = wav_to_pcm16_mono(&wav).unwrap();
        assert_eq!(chunk.samples, vec![1, -2, 300]);
        assert_eq!(chunk.sample_rate, 16000);
    }

    #[test]
    fn test_wav_rejects_stereo_and_short() {
        let wav = make_wav(2, 16000, 16, &[1, 2]);
        assert_eq!(
            wav_to_pcm16_mono(&wav),
            Err(AudioError::UnsupportedFormat {
                channels: 2,
                bits_per_sample: 16
            })
        );
        assert!(matches!(
            wav_to_pcm16_mono(&[0u8; 20]),
            Err(AudioError::InvalidFormat(_))
        ));

        let mut not_riff = make_wav(1, 8000, 16, &[0]);
        not_riff[0] = b'X';
        assert!(matches!(
            wav_to_pcm16_mono(&not_riff),
            Err(AudioError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_declared_rate_overrides_wav_header() {
        let wav = make_wav(1, 16000, 16, &[5, 6]);
        let encoded = STANDARD.encode(&wav);

        let chunk = decode_stream_audio("wav", 24000, &encoded).unwrap();
        assert_eq!(chunk.sample_rate, 24000);
        assert_eq!(chunk.samples, vec![5, 6]);

        let chunk = decode_stream_audio("wav", 0, &encoded).unwrap();
        assert_eq!(chunk.sample_rate, 16000);
    }

    #[test]
    fn test_pcm16le_default_rate() {
        let encoded = STANDARD.encode(samples_to_pcm16le(&[7, -7, 8]));
        let chunk = decode_stream_audio("pcm16le", 0, &encoded).unwrap();
        assert_eq!(chunk.sample_rate, DEFAULT_PCM16LE_RATE);
        assert_eq!(chunk.samples, vec![7, -7, 8]);
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            decode_stream_audio("pcm16le", 0, "!!not base64!!"),
            Err(AudioError::Base64(_))
        ));
        assert!(matches!(
            decode_stream_audio("opus", 0, "AAAA"),
            Err(AudioError::UnsupportedDataType(_))
        ));
    }

    #[test]
    fn test_mean_square() {
        assert_eq!(mean_square(&[3, -3, 3, -3]), 9.0);
        assert_eq!(mean_square(&[]), 0.0);
    }
}
