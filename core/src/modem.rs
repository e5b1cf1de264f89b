use std::time::Duration;

use log::debug;

use crate::afsk::{AfskDemodulator, AfskModulator};
use crate::audio::{AudioConfig, AudioLink};
use crate::error::Result;
use crate::{BAUD_RATE, LEAD_SILENCE, MIN_RX_SAMPLES, SILENCE_DURATION, TRAIL_SILENCE};

/// Byte-level modem: the AFSK codec bound to one audio link.
///
/// `send` is blocking and gated for half duplex; `receive` captures a
/// silence-terminated burst and demodulates it. What the bytes mean is
/// the frame layer's business.
pub struct Modem {
    audio: AudioLink,
    modulator: AfskModulator,
    demodulator: AfskDemodulator,
}

impl Modem {
    pub fn new(config: AudioConfig) -> Self {
        Self::over(AudioLink::new(config))
    }

    /// Modem wired back to itself, no audio hardware involved.
    pub fn loopback() -> Self {
        Self::new(AudioConfig::loopback())
    }

    /// Two modems wired speaker-to-microphone in both directions.
    pub fn pair() -> (Modem, Modem) {
        let (a, b) = AudioLink::pair();
        (Self::over(a), Self::over(b))
    }

    pub fn over(audio: AudioLink) -> Self {
        let modulator = AfskModulator::with_volume(audio.tx_volume());
        Self {
            audio,
            modulator,
            demodulator: AfskDemodulator::new(),
        }
    }

    pub fn start(&mut self) -> Result<()> {
        self.audio.start()
    }

    pub fn stop(&mut self) {
        self.audio.stop()
    }

    pub fn is_running(&self) -> bool {
        self.audio.is_running()
    }

    pub fn is_transmitting(&self) -> bool {
        self.audio.is_transmitting()
    }

    pub fn audio_mut(&mut self) -> &mut AudioLink {
        &mut self.audio
    }

    /// Modulate and play `data`, padded with settling silence on both
    /// sides. Blocks until the burst has left the device.
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        let tones = self.modulator.modulate(data);
        let rate = self.audio.sample_rate() as f32;
        let lead = (LEAD_SILENCE.as_secs_f32() * rate) as usize;
        let trail = (TRAIL_SILENCE.as_secs_f32() * rate) as usize;

        let mut samples = Vec::with_capacity(lead + tones.len() + trail);
        samples.resize(lead, 0.0);
        samples.extend_from_slice(&tones);
        samples.resize(samples.len() + trail, 0.0);

        debug!("tx {} bytes as {} samples", data.len(), samples.len());
        self.audio.play(&samples)
    }

    /// Capture one transmission and demodulate it. Empty on timeout or
    /// when nothing decodable arrived.
    pub fn receive(&mut self, timeout: Duration) -> Vec<u8> {
        let samples = self
            .audio
            .receive_until_silence(timeout, MIN_RX_SAMPLES, SILENCE_DURATION);
        if samples.is_empty() {
            return Vec::new();
        }
        let data = self.demodulator.demodulate(&samples);
        debug!("rx {} samples -> {} bytes", samples.len(), data.len());
        data
    }

    pub fn bytes_per_second(&self) -> f32 {
        BAUD_RATE as f32 / 8.0
    }
}
