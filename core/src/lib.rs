//! Acoustic modem for reliable byte transfer over audible sound
//!
//! Bell-202 style AFSK physical layer, a CRC-16 protected frame layer,
//! Stop-and-Wait ARQ on top, and connection-oriented sessions with a
//! three-way handshake, all sharing one half-duplex audio channel.

use std::time::Duration;

pub mod afsk;
pub mod audio;
#[cfg(feature = "device")]
pub mod device;
pub mod error;
pub mod frame;
pub mod framer;
pub mod modem;
pub mod resample;
pub mod session;
pub mod transport;

pub use afsk::{AfskDemodulator, AfskModulator};
pub use audio::{AudioConfig, AudioLink};
pub use error::{ModemError, Result};
pub use frame::{Deframer, Frame, FrameType};
pub use framer::Framer;
pub use modem::Modem;
pub use session::{Session, SessionConfig, SessionState};
pub use transport::{ReliableTransport, TransportStats};

// Physical layer configuration
pub const SAMPLE_RATE: usize = 48_000; // Hz, nominal
pub const MARK_FREQ: f32 = 1200.0; // Hz, binary 1
pub const SPACE_FREQ: f32 = 2200.0; // Hz, binary 0
pub const BAUD_RATE: usize = 300; // bits per second
pub const SAMPLES_PER_BIT: usize = SAMPLE_RATE / BAUD_RATE; // 160

/// Passband width of each demodulator filter in Hz.
///
/// Too narrow (200 Hz) loses off-center energy once clock drift
/// accumulates over a frame; too wide and the mark/space bands overlap.
/// 400 Hz is the minimum that recovers a full 64-byte payload under
/// 0.1%-class skew between two uncorrelated sound cards.
pub const FILTER_BANDWIDTH: f32 = 400.0;

/// Default playback amplitude, far enough below full scale that cheap
/// consumer output stages do not clip.
pub const DEFAULT_TX_VOLUME: f32 = 0.08;

// Frame configuration
pub const PREAMBLE_LEN: usize = 16; // bytes of 0xAA before the sync word
pub const PREAMBLE_BYTE: u8 = 0xAA;
pub const SYNC_WORD: [u8; 2] = [0x7E, 0x7E];
/// Payload cap per frame; bounds the clock-drift exposure of a single
/// transmission to ~1.7 s of wire time at 300 baud.
pub const MAX_PAYLOAD_SIZE: usize = 64;

// ARQ and half-duplex timing. These values are tuned together with the
// payload cap, the baud rate and the filter bandwidth; changing one
// means re-deriving the others.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_RETRIES: u32 = 5;
/// Wait after sending a frame that expects a response, so the peer can
/// pivot from receive to transmit.
pub const TURNAROUND_GUARD: Duration = Duration::from_millis(50);
/// Captured audio within this window after a transmission ends is
/// discarded: speaker ringing and the AD/DA pipeline's residual delay
/// would otherwise feed our own signal back into the demodulator.
pub const ECHO_GUARD: Duration = Duration::from_millis(80);

// Transmit padding and receive segmentation
pub const LEAD_SILENCE: Duration = Duration::from_millis(150); // filter settling before data
pub const TRAIL_SILENCE: Duration = Duration::from_millis(50);
pub const SILENCE_RMS_THRESHOLD: f32 = 0.01;
pub const MIN_RX_SAMPLES: usize = 10_000; // ~200 ms, shorter than any frame
/// Gap of quiet that terminates a receive: longer than any intra-frame
/// dip, shorter than the inter-frame turnaround.
pub const SILENCE_DURATION: Duration = Duration::from_millis(300);
