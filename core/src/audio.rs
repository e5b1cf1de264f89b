use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::warn;

use crate::error::{ModemError, Result};
use crate::{DEFAULT_TX_VOLUME, ECHO_GUARD, SAMPLE_RATE, SILENCE_RMS_THRESHOLD};

/// Audio link configuration. Device indices and the loopback/audible
/// switches can also come from the environment (`MODEM_INPUT_DEVICE`,
/// `MODEM_OUTPUT_DEVICE`, `MODEM_LOOPBACK`, `MODEM_AUDIBLE`).
#[derive(Debug, Clone)]
pub struct AudioConfig {
    pub sample_rate: usize,
    /// Route playback into a capture buffer instead of the device.
    pub loopback: bool,
    /// In loopback mode, also play through the real device.
    pub audible: bool,
    pub input_device: Option<usize>,
    pub output_device: Option<usize>,
    /// Playback amplitude scale, 0.0 to 1.0 of full scale.
    pub tx_volume: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            loopback: false,
            audible: false,
            input_device: None,
            output_device: None,
            tx_volume: DEFAULT_TX_VOLUME,
        }
    }
}

impl AudioConfig {
    pub fn loopback() -> Self {
        Self {
            loopback: true,
            ..Self::default()
        }
    }

    /// Defaults with `MODEM_*` environment overrides applied.
    pub fn from_env() -> Self {
        Self {
            loopback: env_flag("MODEM_LOOPBACK"),
            audible: env_flag("MODEM_AUDIBLE"),
            input_device: env_index("MODEM_INPUT_DEVICE"),
            output_device: env_index("MODEM_OUTPUT_DEVICE"),
            ..Self::default()
        }
    }
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name)
            .map(|v| v.to_ascii_lowercase())
            .as_deref(),
        Ok("1") | Ok("true") | Ok("yes") | Ok("on")
    )
}

fn env_index(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.parse().ok()
}

const MAX_BUFFERED_SAMPLES: usize = SAMPLE_RATE * 60;

struct ChunkQueue {
    chunks: VecDeque<Vec<f32>>,
    total_samples: usize,
}

/// Bounded queue of captured sample chunks, shared between the capture
/// worker and the protocol thread. The capture side only pushes; it
/// never blocks on a full queue (oldest chunks are dropped instead) and
/// never calls into protocol code.
pub(crate) struct CaptureBuffer {
    queue: Mutex<ChunkQueue>,
    available: Condvar,
}

impl CaptureBuffer {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(ChunkQueue {
                chunks: VecDeque::new(),
                total_samples: 0,
            }),
            available: Condvar::new(),
        }
    }

    pub(crate) fn push(&self, chunk: Vec<f32>) {
        if chunk.is_empty() {
            return;
        }
        let mut q = self.queue.lock().unwrap();
        q.total_samples += chunk.len();
        q.chunks.push_back(chunk);
        while q.total_samples > MAX_BUFFERED_SAMPLES {
            match q.chunks.pop_front() {
                Some(old) => {
                    q.total_samples -= old.len();
                    warn!("capture buffer overflow, dropping {} samples", old.len());
                }
                None => break,
            }
        }
        self.available.notify_all();
    }

    pub(crate) fn pop_timeout(&self, timeout: Duration) -> Option<Vec<f32>> {
        let deadline = Instant::now() + timeout;
        let mut q = self.queue.lock().unwrap();
        loop {
            if let Some(chunk) = q.chunks.pop_front() {
                q.total_samples -= chunk.len();
                return Some(chunk);
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let (guard, _) = self.available.wait_timeout(q, remaining).unwrap();
            q = guard;
        }
    }

    pub(crate) fn clear(&self) {
        let mut q = self.queue.lock().unwrap();
        q.chunks.clear();
        q.total_samples = 0;
    }
}

/// Shared transmit state: the half-duplex arbitration primitive. The
/// audio owner raises the flag for the duration of a playback; the
/// capture path discards everything while it is up, and for the echo
/// guard window after it drops.
pub(crate) struct TransmitGate {
    transmitting: AtomicBool,
    last_tx_end: Mutex<Option<Instant>>,
}

impl TransmitGate {
    fn new() -> Self {
        Self {
            transmitting: AtomicBool::new(false),
            last_tx_end: Mutex::new(None),
        }
    }

    pub(crate) fn begin_tx(&self) {
        self.transmitting.store(true, Ordering::SeqCst);
    }

    pub(crate) fn end_tx(&self) {
        self.transmitting.store(false, Ordering::SeqCst);
        *self.last_tx_end.lock().unwrap() = Some(Instant::now());
    }

    pub(crate) fn is_transmitting(&self) -> bool {
        self.transmitting.load(Ordering::SeqCst)
    }

    /// True while residual echo from the last transmission may still be
    /// in the capture path.
    pub(crate) fn in_echo_guard(&self) -> bool {
        self.last_tx_end
            .lock()
            .unwrap()
            .map(|t| t.elapsed() < ECHO_GUARD)
            .unwrap_or(false)
    }

    pub(crate) fn last_tx_end(&self) -> Option<Instant> {
        *self.last_tx_end.lock().unwrap()
    }
}

/// Transmit tap: sees every outgoing sample burst and returns what to
/// actually deliver, or `None` to drop the burst. Used by tests to
/// inject channel faults (lost ACKs, corrupted frames).
pub type TxTap = Box<dyn FnMut(Vec<f32>) -> Option<Vec<f32>> + Send>;

/// One end of the audio channel: blocking playback plus continuously
/// captured samples, with transmit gating and echo suppression. Owns
/// the sound device exclusively; every other layer goes through here.
pub struct AudioLink {
    config: AudioConfig,
    capture: Arc<CaptureBuffer>,
    gate: Arc<TransmitGate>,
    /// Where loopback playback lands: our own capture buffer, or the
    /// peer's for a cross-wired pair.
    loop_sink: Option<Arc<CaptureBuffer>>,
    tx_tap: Option<TxTap>,
    #[cfg(feature = "device")]
    device: Option<crate::device::DeviceIo>,
    running: bool,
}

impl AudioLink {
    pub fn new(config: AudioConfig) -> Self {
        let capture = Arc::new(CaptureBuffer::new());
        let loop_sink = config.loopback.then(|| capture.clone());
        Self {
            config,
            capture,
            gate: Arc::new(TransmitGate::new()),
            loop_sink,
            tx_tap: None,
            #[cfg(feature = "device")]
            device: None,
            running: false,
        }
    }

    /// Cross-wired loopback pair: each link's playback lands in the
    /// other's capture buffer, so both ends of the stack can run
    /// against each other with no audio hardware.
    pub fn pair() -> (AudioLink, AudioLink) {
        let mut a = Self::new(AudioConfig::loopback());
        let mut b = Self::new(AudioConfig::loopback());
        a.loop_sink = Some(b.capture.clone());
        b.loop_sink = Some(a.capture.clone());
        (a, b)
    }

    pub fn set_tx_tap(&mut self, tap: TxTap) {
        self.tx_tap = Some(tap);
    }

    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    pub fn sample_rate(&self) -> usize {
        self.config.sample_rate
    }

    pub fn tx_volume(&self) -> f32 {
        self.config.tx_volume
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_transmitting(&self) -> bool {
        self.gate.is_transmitting()
    }

    pub fn last_tx_end(&self) -> Option<Instant> {
        self.gate.last_tx_end()
    }

    /// True while captured audio would still be discarded as residual
    /// echo of the last transmission.
    pub fn in_echo_guard(&self) -> bool {
        self.gate.in_echo_guard()
    }

    pub fn clear_receive_buffer(&self) {
        self.capture.clear();
    }

    /// Open the device streams (device mode) or mark the loopback path
    /// ready. Device-open failure is the one fatal audio error.
    pub fn start(&mut self) -> Result<()> {
        if self.running {
            return Ok(());
        }
        if !self.config.loopback {
            #[cfg(feature = "device")]
            {
                self.device = Some(crate::device::DeviceIo::open(
                    &self.config,
                    self.capture.clone(),
                    self.gate.clone(),
                )?);
            }
            #[cfg(not(feature = "device"))]
            {
                return Err(ModemError::AudioDevice(
                    "built without the `device` feature; only loopback mode is available".into(),
                ));
            }
        } else if self.config.audible {
            #[cfg(feature = "device")]
            {
                self.device = Some(crate::device::DeviceIo::open_output_only(
                    &self.config,
                    self.gate.clone(),
                )?);
            }
            #[cfg(not(feature = "device"))]
            warn!("audible loopback requested but built without the `device` feature");
        }
        self.running = true;
        Ok(())
    }

    pub fn stop(&mut self) {
        #[cfg(feature = "device")]
        {
            self.device = None;
        }
        self.running = false;
    }

    /// Play a sample burst, blocking until it has left the link.
    ///
    /// The receive buffer is cleared before and after a device playback
    /// so self-capture can never bleed into received data; the loopback
    /// path skips that machinery because it has no echo path.
    pub fn play(&mut self, samples: &[f32]) -> Result<()> {
        if !self.running {
            return Err(ModemError::AudioDevice("audio link not started".into()));
        }

        if let Some(sink) = self.loop_sink.clone() {
            let burst = match self.tx_tap.as_mut() {
                Some(tap) => tap(samples.to_vec()),
                None => Some(samples.to_vec()),
            };
            self.gate.begin_tx();
            #[cfg(feature = "device")]
            if self.config.audible {
                if let Some(device) = &self.device {
                    if let Err(err) = device.play(samples) {
                        warn!("audible loopback playback failed: {}", err);
                    }
                }
            }
            if let Some(burst) = burst {
                sink.push(burst);
            }
            self.gate.end_tx();
            return Ok(());
        }

        self.gate.begin_tx();
        self.capture.clear();
        let result = self.play_device(samples);
        self.gate.end_tx();
        self.capture.clear();
        result
    }

    #[cfg(feature = "device")]
    fn play_device(&self, samples: &[f32]) -> Result<()> {
        match &self.device {
            Some(device) => device.play(samples),
            None => Err(ModemError::AudioDevice("audio link not started".into())),
        }
    }

    #[cfg(not(feature = "device"))]
    fn play_device(&self, _samples: &[f32]) -> Result<()> {
        Err(ModemError::AudioDevice(
            "built without the `device` feature".into(),
        ))
    }

    /// Capture until the signal has been followed by `silence_duration`
    /// of below-threshold audio, at least `min_samples` have arrived,
    /// or `timeout` expires. In loopback mode a played burst is already
    /// a complete transmission, so the first one is returned whole.
    pub fn receive_until_silence(
        &self,
        timeout: Duration,
        min_samples: usize,
        silence_duration: Duration,
    ) -> Vec<f32> {
        if self.config.loopback {
            return self.capture.pop_timeout(timeout).unwrap_or_default();
        }

        let silence_samples =
            (silence_duration.as_secs_f32() * self.config.sample_rate as f32) as usize;
        let deadline = Instant::now() + timeout;
        let mut samples: Vec<f32> = Vec::new();
        let mut signal_seen = false;

        while Instant::now() < deadline {
            let Some(chunk) = self.capture.pop_timeout(Duration::from_millis(100)) else {
                continue;
            };
            if rms(&chunk) > SILENCE_RMS_THRESHOLD * 2.0 {
                signal_seen = true;
            }
            samples.extend_from_slice(&chunk);

            if signal_seen && samples.len() >= min_samples && samples.len() >= silence_samples {
                let tail = &samples[samples.len() - silence_samples..];
                if rms(tail) < SILENCE_RMS_THRESHOLD {
                    break;
                }
            }
        }
        samples
    }
}

fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
}
