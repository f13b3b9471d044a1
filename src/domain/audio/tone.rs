//! Square-wave tone played when the AI bridge comes up

/// Amplitude of the beep
pub const BEEP_AMPLITUDE: i16 = 7000;

/// Square wave at 8 kHz. Empty for a non-positive frequency or duration.
pub fn square_wave_8k(freq_hz: u32, duration_ms: u32) -> Vec<i16> {
    if freq_hz == 0 || duration_ms == 0 {
        return Vec::new();
    }
    let samples = ((8000 * duration_ms as usize) / 1000).max(1);
    let period = (8000 / freq_hz as usize).max(2);

    (0..samples)
        .map(|i| {
            if i % period < period / 2 {
                BEEP_AMPLITUDE
            } else {
                -BEEP_AMPLITUDE
            }
        })
        .collect()
}

/// 440 Hz for 180 ms.
pub fn startup_beep() -> Vec<i16> {
    square_wave_8k(440, 180)
}
