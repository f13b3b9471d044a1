//! Audio domain - PCM decoding, resampling and generated tones

pub mod resample;
pub mod tone;
pub mod wav;

pub use resample::{downsample_to_8k, upsample_8k_to_16k, TELEPHONY_RATE, UPLINK_RATE};
pub use tone::startup_beep;
pub use wav::{
    decode_stream_audio, mean_square, samples_to_pcm16le, AudioError, PcmChunk, WavFormat,
};
