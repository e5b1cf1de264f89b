//! Real sound-card backend built on cpal.
//!
//! A dedicated audio thread owns the cpal streams (they are not `Send`)
//! and services play requests over a command channel. The input
//! callback only gates, downmixes and forwards samples into the shared
//! capture buffer; it never blocks and never calls into protocol code.
//! Devices rarely run at exactly the modem's nominal rate, so samples
//! are resampled at this boundary in both directions.

use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use log::{debug, warn};

use crate::audio::{AudioConfig, CaptureBuffer, TransmitGate};
use crate::error::{ModemError, Result};
use crate::resample::{downmix, resample};

enum Command {
    Play(Vec<f32>, mpsc::Sender<Result<()>>),
    Shutdown,
}

pub(crate) struct DeviceIo {
    commands: mpsc::Sender<Command>,
    worker: Option<thread::JoinHandle<()>>,
}

impl DeviceIo {
    /// Open capture and playback on the configured devices.
    pub(crate) fn open(
        config: &AudioConfig,
        capture: Arc<CaptureBuffer>,
        gate: Arc<TransmitGate>,
    ) -> Result<Self> {
        Self::spawn(config.clone(), Some(capture), gate)
    }

    /// Playback only, used for audible loopback.
    pub(crate) fn open_output_only(config: &AudioConfig, gate: Arc<TransmitGate>) -> Result<Self> {
        Self::spawn(config.clone(), None, gate)
    }

    fn spawn(
        config: AudioConfig,
        capture: Option<Arc<CaptureBuffer>>,
        gate: Arc<TransmitGate>,
    ) -> Result<Self> {
        let (commands, command_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();

        let worker = thread::Builder::new()
            .name("wavelink-audio".into())
            .spawn(move || worker_main(config, capture, gate, command_rx, ready_tx))
            .map_err(|e| ModemError::AudioDevice(format!("failed to spawn audio thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                commands,
                worker: Some(worker),
            }),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(ModemError::AudioDevice(
                "audio worker died during startup".into(),
            )),
        }
    }

    /// Blocking playback: returns once the device has drained the burst.
    pub(crate) fn play(&self, samples: &[f32]) -> Result<()> {
        let (done_tx, done_rx) = mpsc::channel();
        self.commands
            .send(Command::Play(samples.to_vec(), done_tx))
            .map_err(|_| ModemError::AudioDevice("audio worker is gone".into()))?;
        done_rx
            .recv()
            .map_err(|_| ModemError::AudioDevice("audio worker dropped a play request".into()))?
    }
}

impl Drop for DeviceIo {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn worker_main(
    config: AudioConfig,
    capture: Option<Arc<CaptureBuffer>>,
    gate: Arc<TransmitGate>,
    commands: mpsc::Receiver<Command>,
    ready: mpsc::Sender<Result<()>>,
) {
    let host = cpal::default_host();

    let setup = (|| -> Result<(Option<cpal::Stream>, cpal::Device, cpal::SupportedStreamConfig)> {
        let output_device = pick_device(&host, config.output_device, false)?;
        let output_config = output_device
            .default_output_config()
            .map_err(|e| ModemError::AudioDevice(format!("no default output config: {e}")))?;

        let input_stream = match &capture {
            Some(capture) => Some(build_input_stream(
                &host,
                &config,
                capture.clone(),
                gate.clone(),
            )?),
            None => None,
        };
        Ok((input_stream, output_device, output_config))
    })();

    let (input_stream, output_device, output_config) = match setup {
        Ok(parts) => {
            let _ = ready.send(Ok(()));
            parts
        }
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };

    while let Ok(command) = commands.recv() {
        match command {
            Command::Play(samples, done) => {
                let result = play_blocking(
                    &output_device,
                    &output_config,
                    &samples,
                    config.sample_rate,
                );
                let _ = done.send(result);
            }
            Command::Shutdown => break,
        }
    }

    drop(input_stream);
}

fn pick_device(host: &cpal::Host, index: Option<usize>, input: bool) -> Result<cpal::Device> {
    let kind = if input { "input" } else { "output" };
    match index {
        Some(i) => {
            let mut devices = if input {
                host.input_devices()
            } else {
                host.output_devices()
            }
            .map_err(|e| ModemError::AudioDevice(format!("cannot enumerate {kind} devices: {e}")))?;
            devices
                .nth(i)
                .ok_or_else(|| ModemError::AudioDevice(format!("no {kind} device at index {i}")))
        }
        None => {
            let device = if input {
                host.default_input_device()
            } else {
                host.default_output_device()
            };
            device.ok_or_else(|| ModemError::AudioDevice(format!("no default {kind} device")))
        }
    }
}

fn build_input_stream(
    host: &cpal::Host,
    config: &AudioConfig,
    capture: Arc<CaptureBuffer>,
    gate: Arc<TransmitGate>,
) -> Result<cpal::Stream> {
    let device = pick_device(host, config.input_device, true)?;
    let supported = device
        .default_input_config()
        .map_err(|e| ModemError::AudioDevice(format!("no default input config: {e}")))?;

    let device_rate = supported.sample_rate().0 as usize;
    let channels = supported.channels() as usize;
    let nominal_rate = config.sample_rate;
    debug!(
        "capture: {} Hz, {} channel(s), resampling to {} Hz",
        device_rate, channels, nominal_rate
    );

    let stream_config: cpal::StreamConfig = supported.config();
    let err_fn = |err| warn!("capture stream error: {}", err);

    // The callback must stay cheap and lock-free apart from the capture
    // buffer push: gate check, downmix, resample, hand off.
    let ingest = move |data: &[f32]| {
        if gate.is_transmitting() || gate.in_echo_guard() {
            return;
        }
        let mono = downmix(data, channels);
        let chunk = resample(&mono, device_rate, nominal_rate);
        capture.push(chunk);
    };

    let stream = match supported.sample_format() {
        cpal::SampleFormat::F32 => device
            .build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| ingest(data),
                err_fn,
                None,
            )
            .map_err(|e| ModemError::AudioDevice(format!("cannot open input stream: {e}")))?,
        cpal::SampleFormat::I16 => device
            .build_input_stream(
                &stream_config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    let floats: Vec<f32> =
                        data.iter().map(|&s| s as f32 / i16::MAX as f32).collect();
                    ingest(&floats);
                },
                err_fn,
                None,
            )
            .map_err(|e| ModemError::AudioDevice(format!("cannot open input stream: {e}")))?,
        other => {
            return Err(ModemError::AudioDevice(format!(
                "unsupported input sample format: {other:?}"
            )))
        }
    };

    stream
        .play()
        .map_err(|e| ModemError::AudioDevice(format!("cannot start capture: {e}")))?;
    Ok(stream)
}

/// Play one burst through an output stream built on demand, waiting
/// until every sample has been handed to the device plus a short drain
/// margin for the hardware buffer.
fn play_blocking(
    device: &cpal::Device,
    supported: &cpal::SupportedStreamConfig,
    samples: &[f32],
    nominal_rate: usize,
) -> Result<()> {
    let device_rate = supported.sample_rate().0 as usize;
    let channels = supported.channels() as usize;
    let rendered = resample(samples, nominal_rate, device_rate);

    let progress = Arc::new((Mutex::new(0usize), Condvar::new()));
    let total = rendered.len();

    let stream_config: cpal::StreamConfig = supported.config();
    let writer_progress = progress.clone();
    let err_fn = |err| warn!("playback stream error: {}", err);

    let stream = device
        .build_output_stream(
            &stream_config,
            move |out: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let (position, drained) = &*writer_progress;
                let mut pos = position.lock().unwrap();
                for frame in out.chunks_mut(channels) {
                    let sample = if *pos < total {
                        let s = rendered[*pos];
                        *pos += 1;
                        s
                    } else {
                        0.0
                    };
                    for slot in frame {
                        *slot = sample;
                    }
                }
                if *pos >= total {
                    drained.notify_all();
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| ModemError::AudioDevice(format!("cannot open output stream: {e}")))?;

    stream
        .play()
        .map_err(|e| ModemError::AudioDevice(format!("cannot start playback: {e}")))?;

    let (position, drained) = &*progress;
    let mut pos = position.lock().unwrap();
    while *pos < total {
        let (guard, timeout) = drained
            .wait_timeout(pos, Duration::from_secs(30))
            .unwrap();
        pos = guard;
        if timeout.timed_out() && *pos < total {
            return Err(ModemError::AudioDevice("playback stalled".into()));
        }
    }
    drop(pos);

    // let the device drain its internal buffer before the stream drops
    thread::sleep(Duration::from_millis(50));
    Ok(())
}
