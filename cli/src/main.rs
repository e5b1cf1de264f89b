use std::fs::File;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use hound::WavSpec;
use log::info;

use wavelink_core::resample::{downmix, resample};
use wavelink_core::{
    AfskDemodulator, AfskModulator, AudioConfig, Deframer, Frame, FrameType, Framer, Modem,
    ReliableTransport, Session, BAUD_RATE, MAX_PAYLOAD_SIZE, SAMPLE_RATE,
};

/// Inter-frame gap in a generated WAV. A whole multiple of eight bit
/// periods, so the gap never shifts byte alignment for the decoder.
const WAV_FRAME_GAP_BITS: usize = 120;

#[derive(Parser)]
#[command(name = "wavelink")]
#[command(about = "Acoustic modem: reliable byte transfer over audible sound")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode a binary file into AFSK audio frames in a WAV file
    Encode {
        /// Input binary file
        #[arg(value_name = "INPUT.BIN")]
        input: PathBuf,

        /// Output WAV file
        #[arg(value_name = "OUTPUT.WAV")]
        output: PathBuf,

        /// Playback amplitude (0.0 to 1.0)
        #[arg(long, default_value = "0.08")]
        volume: f32,
    },

    /// Decode AFSK audio frames from a WAV file back into binary data
    Decode {
        /// Input WAV file
        #[arg(value_name = "INPUT.WAV")]
        input: PathBuf,

        /// Output binary file
        #[arg(value_name = "OUTPUT.BIN")]
        output: PathBuf,
    },

    /// Loopback self-test: send a message through the full stack
    Ping {
        /// Message to send
        #[arg(long, default_value = "Hello from acoustic modem! Testing 1-2-3.")]
        message: String,
    },

    /// Send a file to a listening peer over the audio channel
    Send {
        /// File to send
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Use the in-process loopback channel instead of a device
        #[arg(long)]
        loopback: bool,
    },

    /// Receive a file from a connecting peer over the audio channel
    Recv {
        /// Where to write the received file
        #[arg(value_name = "FILE")]
        output: PathBuf,

        /// Use the in-process loopback channel instead of a device
        #[arg(long)]
        loopback: bool,

        /// Seconds to wait for an incoming connection
        #[arg(long, default_value = "120")]
        wait: u64,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Encode {
            input,
            output,
            volume,
        } => encode_command(&input, &output, volume),
        Commands::Decode { input, output } => decode_command(&input, &output),
        Commands::Ping { message } => ping_command(message.as_bytes()),
        Commands::Send { input, loopback } => send_command(&input, loopback),
        Commands::Recv {
            output,
            loopback,
            wait,
        } => recv_command(&output, loopback, wait),
    }
}

fn encode_command(
    input: &PathBuf,
    output: &PathBuf,
    volume: f32,
) -> Result<(), Box<dyn std::error::Error>> {
    let data = std::fs::read(input)?;
    println!("Read {} bytes from {}", data.len(), input.display());

    let mut modulator = AfskModulator::with_volume(volume);
    let gap = vec![0.0f32; WAV_FRAME_GAP_BITS * (SAMPLE_RATE / BAUD_RATE)];
    let mut samples: Vec<f32> = Vec::new();

    let mut frames = 0usize;
    let chunks: Vec<&[u8]> = if data.is_empty() {
        vec![&[]]
    } else {
        data.chunks(MAX_PAYLOAD_SIZE).collect()
    };
    for (seq, chunk) in chunks.into_iter().enumerate() {
        let frame = Frame::data(seq as u8, chunk)?;
        samples.extend_from_slice(&modulator.modulate(&frame.encode()));
        samples.extend_from_slice(&gap);
        frames += 1;
    }
    println!(
        "Encoded {} frame(s) into {} samples ({:.2} s)",
        frames,
        samples.len(),
        samples.len() as f32 / SAMPLE_RATE as f32
    );

    let spec = WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE as u32,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let file = File::create(output)?;
    let mut writer = hound::WavWriter::new(file, spec)?;
    for sample in samples {
        let clamped = sample.clamp(-1.0, 1.0);
        writer.write_sample((clamped * 32767.0) as i16)?;
    }
    writer.finalize()?;

    println!("Wrote {}", output.display());
    Ok(())
}

fn decode_command(input: &PathBuf, output: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let file = File::open(input)?;
    let mut reader = hound::WavReader::new(file)?;
    let spec = reader.spec();
    println!(
        "Read WAV: {} Hz, {} channel(s), {} bits",
        spec.sample_rate, spec.channels, spec.bits_per_sample
    );

    let mut samples: Vec<f32> = match spec.bits_per_sample {
        16 => reader
            .samples::<i16>()
            .collect::<Result<Vec<i16>, _>>()?
            .into_iter()
            .map(|s| s as f32 / 32768.0)
            .collect(),
        32 => reader.samples::<f32>().collect::<Result<Vec<f32>, _>>()?,
        other => return Err(format!("unsupported bit depth: {other}").into()),
    };

    if spec.channels > 1 {
        samples = downmix(&samples, spec.channels as usize);
    }
    if spec.sample_rate != SAMPLE_RATE as u32 {
        println!(
            "Resampling from {} Hz to {} Hz",
            spec.sample_rate, SAMPLE_RATE
        );
        samples = resample(&samples, spec.sample_rate as usize, SAMPLE_RATE);
    }

    let mut demodulator = AfskDemodulator::new();
    let bytes = demodulator.demodulate(&samples);
    info!("demodulated {} bytes", bytes.len());

    let mut deframer = Deframer::new();
    deframer.push(&bytes);
    let mut payload = Vec::new();
    let mut frames = 0usize;
    while let Some(frame) = deframer.next_frame() {
        if frame.frame_type == FrameType::Data {
            payload.extend_from_slice(&frame.payload);
            frames += 1;
        }
    }
    if frames == 0 {
        return Err("no valid frames found in audio".into());
    }

    std::fs::write(output, &payload)?;
    println!(
        "Decoded {} frame(s), wrote {} bytes to {}",
        frames,
        payload.len(),
        output.display()
    );
    Ok(())
}

fn ping_command(message: &[u8]) -> Result<(), Box<dyn std::error::Error>> {
    let mut modem = Modem::loopback();
    modem.start()?;

    let frame = Frame::data(0, message)?;
    let started = Instant::now();
    modem.send(&frame.encode())?;
    let received = modem.receive(Duration::from_secs(5));
    let elapsed = started.elapsed();

    let decoded = Frame::decode(&received).ok_or("no frame decoded from loopback")?;
    if decoded.payload != message {
        return Err("loopback payload mismatch".into());
    }

    let wire_bits = frame.encode().len() * 8;
    println!("Loopback ping OK: {} bytes in {:.2?}", message.len(), elapsed);
    println!(
        "  {} bits on the wire, {:.2} s of audio at {} baud",
        wire_bits,
        wire_bits as f32 / BAUD_RATE as f32,
        BAUD_RATE
    );
    Ok(())
}

fn audio_config(loopback: bool) -> AudioConfig {
    let mut config = AudioConfig::from_env();
    if loopback {
        config.loopback = true;
    }
    config
}

fn send_command(input: &PathBuf, loopback: bool) -> Result<(), Box<dyn std::error::Error>> {
    let data = std::fs::read(input)?;
    println!("Sending {} bytes from {}", data.len(), input.display());

    let modem = Modem::new(audio_config(loopback));
    let mut session = Session::new(ReliableTransport::new(Framer::new(modem)));
    session.start()?;
    session.connect()?;
    println!("Connected, transferring...");

    let started = Instant::now();
    session.send_message(&data)?;
    session.close()?;

    println!(
        "Sent {} bytes in {:.1?} ({:.1} bytes/s)",
        data.len(),
        started.elapsed(),
        data.len() as f32 / started.elapsed().as_secs_f32()
    );
    Ok(())
}

fn recv_command(
    output: &PathBuf,
    loopback: bool,
    wait: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let modem = Modem::new(audio_config(loopback));
    let mut session = Session::new(ReliableTransport::new(Framer::new(modem)));
    session.start()?;

    println!("Waiting for a connection ({wait} s)...");
    session.accept(Duration::from_secs(wait))?;
    println!("Connected, receiving...");

    let data = session.receive_message(Duration::from_secs(60))?;
    session.close()?;

    std::fs::write(output, &data)?;
    println!("Received {} bytes into {}", data.len(), output.display());
    Ok(())
}
