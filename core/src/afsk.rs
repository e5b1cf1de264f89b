use std::f32::consts::PI;

use crate::{
    BAUD_RATE, DEFAULT_TX_VOLUME, FILTER_BANDWIDTH, MARK_FREQ, SAMPLE_RATE, SAMPLES_PER_BIT,
    SPACE_FREQ,
};

// Bell-202 style AFSK at 300 baud:
// - mark (binary 1)  -> 1200 Hz
// - space (binary 0) -> 2200 Hz
// - 48 kHz sample rate, 160 samples per bit
//
// Bytes are serialized LSB first with no start/stop bits; byte
// alignment is the frame layer's job (sync word after the preamble).

/// Second-order IIR section (direct form I). Coefficients are computed
/// once at construction; the state fields start zeroed so a copy of the
/// section is a fresh filter.
#[derive(Clone, Copy)]
struct Biquad {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl Biquad {
    fn with_coeffs(b0: f32, b1: f32, b2: f32, a1: f32, a2: f32) -> Self {
        Self {
            b0,
            b1,
            b2,
            a1,
            a2,
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
        }
    }

    /// Band-pass centered on `center` with the given passband width.
    fn band_pass(sample_rate: f32, center: f32, bandwidth: f32) -> Self {
        let omega = 2.0 * PI * center / sample_rate;
        let q = center / bandwidth;
        let alpha = omega.sin() / (2.0 * q);
        let a0 = 1.0 + alpha;
        Self::with_coeffs(
            alpha / a0,
            0.0,
            -alpha / a0,
            -2.0 * omega.cos() / a0,
            (1.0 - alpha) / a0,
        )
    }

    /// Butterworth low-pass at `cutoff`.
    fn low_pass(sample_rate: f32, cutoff: f32) -> Self {
        let omega = 2.0 * PI * cutoff / sample_rate;
        let alpha = omega.sin() / (2.0 * std::f32::consts::FRAC_1_SQRT_2);
        let cos = omega.cos();
        let a0 = 1.0 + alpha;
        Self::with_coeffs(
            (1.0 - cos) / (2.0 * a0),
            (1.0 - cos) / a0,
            (1.0 - cos) / (2.0 * a0),
            -2.0 * cos / a0,
            (1.0 - alpha) / a0,
        )
    }

    fn process(&mut self, x: f32) -> f32 {
        let y = self.b0 * x + self.b1 * self.x1 + self.b2 * self.x2
            - self.a1 * self.y1
            - self.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;
        y
    }
}

/// Envelope detector for one tone: two cascaded band-pass sections,
/// full-wave rectification, then a low-pass smoothing the result over
/// roughly one bit interval.
#[derive(Clone, Copy)]
struct ToneDetector {
    bp1: Biquad,
    bp2: Biquad,
    lp: Biquad,
}

impl ToneDetector {
    fn new(sample_rate: f32, center: f32) -> Self {
        let bp = Biquad::band_pass(sample_rate, center, FILTER_BANDWIDTH);
        Self {
            bp1: bp,
            bp2: bp,
            lp: Biquad::low_pass(sample_rate, BAUD_RATE as f32 * 1.5),
        }
    }

    /// Run a fresh copy of the chain over `samples`.
    fn envelope(&self, samples: &[f32]) -> Vec<f32> {
        let mut chain = *self;
        samples
            .iter()
            .map(|&x| {
                let band = chain.bp2.process(chain.bp1.process(x));
                chain.lp.process(band.abs())
            })
            .collect()
    }
}

/// Receiver bit clock: the sample offset at which bit windows begin.
/// Re-estimated from the onset of total filter energy on every
/// demodulation pass, so the per-frame preamble re-synchronizes it
/// before any payload bit is sampled.
struct BitClock {
    offset: usize,
}

impl BitClock {
    fn new() -> Self {
        Self { offset: 0 }
    }

    /// Locate the first bit boundary: the first strong rise in combined
    /// mark+space energy, walked back to where the ramp leaves the
    /// floor. The walk-back is bounded to one bit so a noisy floor
    /// cannot drag the estimate into leading noise.
    fn resync(&mut self, total_env: &[f32]) -> Option<usize> {
        let peak = total_env.iter().cloned().fold(0.0_f32, f32::max);
        if peak < 1e-6 {
            return None;
        }
        let rise = 0.25 * peak;
        let floor = 0.05 * peak;
        let mut onset = total_env.iter().position(|&e| e > rise)?;
        let limit = onset.saturating_sub(SAMPLES_PER_BIT);
        while onset > limit && total_env[onset - 1] > floor {
            onset -= 1;
        }
        self.offset = onset;
        Some(onset)
    }
}

/// Modulates bytes into a continuous-phase AFSK sample stream.
///
/// Phase is carried across bit boundaries, so the instantaneous
/// frequency switches without a discontinuity and the spectrum stays
/// clean at transitions.
pub struct AfskModulator {
    sample_rate: usize,
    samples_per_bit: usize,
    mark_freq: f32,
    space_freq: f32,
    amplitude: f32,
    phase: f32,
}

impl AfskModulator {
    pub fn new() -> Self {
        Self::with_volume(DEFAULT_TX_VOLUME)
    }

    /// `volume` scales the output amplitude (0.0 to 1.0 of full scale).
    pub fn with_volume(volume: f32) -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            samples_per_bit: SAMPLES_PER_BIT,
            mark_freq: MARK_FREQ,
            space_freq: SPACE_FREQ,
            amplitude: volume.clamp(0.0, 1.0),
            phase: 0.0,
        }
    }

    fn push_bit(&mut self, bit: bool, out: &mut Vec<f32>) {
        let freq = if bit { self.mark_freq } else { self.space_freq };
        let step = 2.0 * PI * freq / self.sample_rate as f32;
        for _ in 0..self.samples_per_bit {
            out.push(self.phase.sin() * self.amplitude);
            self.phase += step;
        }
        self.phase %= 2.0 * PI;
    }

    /// Generate samples for `data`, LSB-first within each byte.
    /// Total: every input has an encoding.
    pub fn modulate(&mut self, data: &[u8]) -> Vec<f32> {
        let mut out = Vec::with_capacity(data.len() * 8 * self.samples_per_bit);
        for &byte in data {
            for i in 0..8 {
                self.push_bit((byte >> i) & 1 == 1, &mut out);
            }
        }
        out
    }

    pub fn reset(&mut self) {
        self.phase = 0.0;
    }

    pub fn samples_per_byte(&self) -> usize {
        self.samples_per_bit * 8
    }
}

impl Default for AfskModulator {
    fn default() -> Self {
        Self::new()
    }
}

/// Demodulates an AFSK sample stream back into bytes.
///
/// Per-bit decision: whichever tone envelope carries more energy over
/// the central half of the bit window wins. Lossy under noise; the
/// frame layer's CRC decides what survives.
pub struct AfskDemodulator {
    samples_per_bit: usize,
    mark: ToneDetector,
    space: ToneDetector,
    clock: BitClock,
}

impl AfskDemodulator {
    pub fn new() -> Self {
        let sample_rate = SAMPLE_RATE as f32;
        Self {
            samples_per_bit: SAMPLES_PER_BIT,
            mark: ToneDetector::new(sample_rate, MARK_FREQ),
            space: ToneDetector::new(sample_rate, SPACE_FREQ),
            clock: BitClock::new(),
        }
    }

    /// Sample offset of the first bit boundary found by the last
    /// demodulation pass.
    pub fn last_bit_offset(&self) -> usize {
        self.clock.offset
    }

    /// Decode whole bytes from `samples`. Returns empty when the buffer
    /// is shorter than one byte of signal or contains no signal at all.
    pub fn demodulate(&mut self, samples: &[f32]) -> Vec<u8> {
        if samples.len() < self.samples_per_bit * 8 {
            return Vec::new();
        }

        let mark_env = self.mark.envelope(samples);
        let space_env = self.space.envelope(samples);
        let total: Vec<f32> = mark_env
            .iter()
            .zip(space_env.iter())
            .map(|(m, s)| m + s)
            .collect();

        let Some(onset) = self.clock.resync(&total) else {
            return Vec::new();
        };

        let spb = self.samples_per_bit;
        let num_bits = (samples.len() - onset) / spb;
        let mut bits = Vec::with_capacity(num_bits);
        for k in 0..num_bits {
            // central half of the bit window, away from transitions
            let start = onset + k * spb + spb / 4;
            let end = onset + k * spb + (3 * spb) / 4;
            if end > samples.len() {
                break;
            }
            let mark_energy: f32 = mark_env[start..end].iter().sum();
            let space_energy: f32 = space_env[start..end].iter().sum();
            bits.push(mark_energy > space_energy);
        }

        let mut out = Vec::with_capacity(bits.len() / 8);
        for chunk in bits.chunks_exact(8) {
            let mut byte = 0u8;
            for (i, &bit) in chunk.iter().enumerate() {
                if bit {
                    byte |= 1 << i;
                }
            }
            out.push(byte);
        }
        out
    }
}

impl Default for AfskDemodulator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modulate_length() {
        let mut modulator = AfskModulator::new();
        let samples = modulator.modulate(b"\x55");
        assert_eq!(samples.len(), 8 * SAMPLES_PER_BIT);

        let samples = modulator.modulate(b"Hello");
        assert_eq!(samples.len(), 5 * 8 * SAMPLES_PER_BIT);
    }

    #[test]
    fn test_modulate_empty() {
        let mut modulator = AfskModulator::new();
        assert!(modulator.modulate(b"").is_empty());
    }

    #[test]
    fn test_samples_within_volume() {
        let mut modulator = AfskModulator::with_volume(0.08);
        let samples = modulator.modulate(b"\x00\xFF\x55\xAA");
        for &s in &samples {
            assert!(s.abs() <= 0.08 + 1e-6, "sample out of range: {}", s);
        }
    }

    #[test]
    fn test_phase_continuity() {
        // A continuous-phase signal never jumps more than one sample
        // step of the highest tone between adjacent samples.
        let mut modulator = AfskModulator::with_volume(1.0);
        let samples = modulator.modulate(&[0x55, 0xAA, 0x0F, 0xF0]);
        let max_step = 2.0 * PI * SPACE_FREQ / SAMPLE_RATE as f32 * 1.05;
        for pair in samples.windows(2) {
            assert!(
                (pair[1] - pair[0]).abs() <= max_step,
                "phase discontinuity: {} -> {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_roundtrip_patterns() {
        let patterns: Vec<Vec<u8>> = vec![
            vec![0x55],
            vec![0x00],
            vec![0xFF],
            vec![0xAA, 0x55, 0xAA, 0x55],
            b"Hello, AFSK!".to_vec(),
            vec![0x00, 0xFF, 0xAA, 0x55, 0x7E, 0x01, 0x80],
        ];

        for pattern in patterns {
            let mut modulator = AfskModulator::new();
            let mut demodulator = AfskDemodulator::new();
            let samples = modulator.modulate(&pattern);
            let decoded = demodulator.demodulate(&samples);
            assert_eq!(decoded, pattern, "failed roundtrip for {:02X?}", pattern);
        }
    }

    #[test]
    fn test_roundtrip_with_leading_silence() {
        let mut modulator = AfskModulator::new();
        let mut demodulator = AfskDemodulator::new();

        let data = b"timing recovery";
        let tones = modulator.modulate(data);

        // silence that is deliberately not a multiple of the bit period
        let mut samples = vec![0.0f32; SAMPLES_PER_BIT * 37 + 71];
        samples.extend_from_slice(&tones);

        let decoded = demodulator.demodulate(&samples);
        assert_eq!(decoded, data);

        // the recovered bit clock sits at the signal onset, well within
        // half a bit of the true boundary
        let onset = demodulator.last_bit_offset() as isize;
        let true_start = (SAMPLES_PER_BIT * 37 + 71) as isize;
        assert!(
            (onset - true_start).abs() < (SAMPLES_PER_BIT / 2) as isize,
            "bit clock off by {} samples",
            onset - true_start
        );
    }

    #[test]
    fn test_roundtrip_with_trailing_silence() {
        let mut modulator = AfskModulator::new();
        let mut demodulator = AfskDemodulator::new();

        let data = b"trailing";
        let mut samples = modulator.modulate(data);
        samples.extend(std::iter::repeat(0.0f32).take(SAMPLE_RATE / 2));

        // trailing silence may decode as junk bytes after the data
        let decoded = demodulator.demodulate(&samples);
        assert!(
            decoded.starts_with(data),
            "decoded {:02X?} does not start with {:02X?}",
            decoded,
            data
        );
    }

    #[test]
    fn test_roundtrip_with_noise() {
        let mut modulator = AfskModulator::new();
        let mut demodulator = AfskDemodulator::new();

        let data = b"noisy channel";
        let mut samples = modulator.modulate(data);

        // deterministic pseudo-noise at 10% of signal amplitude
        let mut state: u32 = 0x1234_5678;
        for sample in samples.iter_mut() {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let noise = (state >> 8) as f32 / (1 << 24) as f32 - 0.5;
            *sample += noise * 0.1 * DEFAULT_TX_VOLUME;
        }

        let decoded = demodulator.demodulate(&samples);
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_demodulate_silence() {
        let mut demodulator = AfskDemodulator::new();
        assert!(demodulator.demodulate(&vec![0.0; SAMPLE_RATE]).is_empty());
    }

    #[test]
    fn test_demodulate_too_short() {
        let mut demodulator = AfskDemodulator::new();
        assert!(demodulator.demodulate(&vec![0.1; 100]).is_empty());
    }
}
