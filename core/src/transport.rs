use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::error::{ModemError, Result};
use crate::frame::{Frame, FrameType};
use crate::framer::Framer;
use crate::{DEFAULT_RETRIES, DEFAULT_TIMEOUT, MAX_PAYLOAD_SIZE, TURNAROUND_GUARD};

/// Link-quality counters, kept for observability.
#[derive(Debug, Default, Clone)]
pub struct TransportStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub retransmissions: u64,
    pub timeouts: u64,
    pub acks_received: u64,
    pub naks_received: u64,
    pub duplicates: u64,
}

/// Stop-and-Wait ARQ over the frame layer.
///
/// One frame is outstanding at a time, so sequence numbers only need to
/// alternate between consecutive values; the full byte of sequence
/// space is headroom, not windowing. CRC-failed frames never reach this
/// layer (the scanner drops them), which is why there is no NAK-on-CRC
/// path: a corrupted DATA frame is repaired by the sender's timeout.
pub struct ReliableTransport {
    framer: Framer,
    timeout: Duration,
    retries: u32,
    tx_seq: u8,
    rx_seq: u8,
    pub stats: TransportStats,
}

impl ReliableTransport {
    pub fn new(framer: Framer) -> Self {
        Self::with_timing(framer, DEFAULT_TIMEOUT, DEFAULT_RETRIES)
    }

    /// Custom ACK timeout and retry budget. Tests use short values; the
    /// defaults are sized for a ~2.5 s round trip at 300 baud.
    pub fn with_timing(framer: Framer, timeout: Duration, retries: u32) -> Self {
        Self {
            framer,
            timeout,
            retries,
            tx_seq: 0,
            rx_seq: 0,
            stats: TransportStats::default(),
        }
    }

    pub fn start(&mut self) -> Result<()> {
        self.framer.start()
    }

    pub fn stop(&mut self) {
        self.framer.stop()
    }

    pub fn framer_mut(&mut self) -> &mut Framer {
        &mut self.framer
    }

    /// (next transmit sequence, next expected receive sequence)
    pub fn sequences(&self) -> (u8, u8) {
        (self.tx_seq, self.rx_seq)
    }

    pub fn reset_sequences(&mut self) {
        self.tx_seq = 0;
        self.rx_seq = 0;
    }

    fn next_seq(&mut self) -> u8 {
        let seq = self.tx_seq;
        self.tx_seq = self.tx_seq.wrapping_add(1);
        seq
    }

    /// Send a datagram, fragmenting into payload-sized segments. Each
    /// segment is retransmitted until acknowledged; exhausting the
    /// retry budget fails the whole send.
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return self.send_segment(&[]);
        }
        for segment in data.chunks(MAX_PAYLOAD_SIZE) {
            self.send_segment(segment)?;
        }
        Ok(())
    }

    fn send_segment(&mut self, segment: &[u8]) -> Result<()> {
        let seq = self.next_seq();
        let frame = Frame::data(seq, segment)?;

        for attempt in 0..=self.retries {
            if attempt > 0 {
                self.stats.retransmissions += 1;
                debug!("retransmit seq={} (attempt {})", seq, attempt + 1);
            }
            self.framer.send_frame(&frame)?;
            self.stats.frames_sent += 1;
            thread::sleep(TURNAROUND_GUARD);

            if self.await_ack(seq)? {
                return Ok(());
            }
        }
        Err(ModemError::LinkFailure(self.retries + 1))
    }

    /// Wait one timeout for the ACK of `seq`. `Ok(false)` means
    /// retransmit (timeout or NAK); errors are terminal.
    fn await_ack(&mut self, seq: u8) -> Result<bool> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                self.stats.timeouts += 1;
                return Ok(false);
            };
            let Some(frame) = self.framer.receive_frame(remaining) else {
                self.stats.timeouts += 1;
                return Ok(false);
            };
            self.stats.frames_received += 1;

            match frame.frame_type {
                FrameType::Ack if frame.sequence == seq => {
                    self.stats.acks_received += 1;
                    return Ok(true);
                }
                FrameType::Ack => {
                    debug!("stale ACK seq={} (awaiting {})", frame.sequence, seq);
                }
                FrameType::Nak => {
                    self.stats.naks_received += 1;
                    debug!("NAK seq={}, retransmitting", frame.sequence);
                    return Ok(false);
                }
                FrameType::Rst => return Err(ModemError::PeerReset),
                other => {
                    // the wire is noisy; an unexpected type is not fatal
                    debug!("ignoring {:?} while awaiting ACK", other);
                }
            }
        }
    }

    /// Receive one datagram segment, acknowledging it. A duplicate of
    /// an already-delivered segment is acknowledged again but not
    /// re-delivered, so a lost ACK cannot wedge the sender.
    pub fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(ModemError::Timeout)?;
            let Some(frame) = self.framer.receive_frame(remaining) else {
                return Err(ModemError::Timeout);
            };
            self.stats.frames_received += 1;

            match frame.frame_type {
                FrameType::Data => {
                    if frame.sequence == self.rx_seq {
                        self.rx_seq = self.rx_seq.wrapping_add(1);
                        self.send_ack(frame.sequence)?;
                        return Ok(frame.payload);
                    }
                    self.stats.duplicates += 1;
                    debug!(
                        "duplicate DATA seq={} (expecting {}), re-acknowledging",
                        frame.sequence, self.rx_seq
                    );
                    self.send_ack(frame.sequence)?;
                }
                FrameType::Fin => {
                    self.send_ack(frame.sequence)?;
                    return Err(ModemError::Closed);
                }
                FrameType::Rst => return Err(ModemError::PeerReset),
                other => {
                    debug!("ignoring {:?} while receiving", other);
                }
            }
        }
    }

    /// Drain segments until the link goes quiet or closes.
    pub fn receive_all(&mut self, idle_timeout: Duration) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            match self.receive(idle_timeout) {
                Ok(segment) => out.extend_from_slice(&segment),
                Err(_) => return out,
            }
        }
    }

    fn send_ack(&mut self, seq: u8) -> Result<()> {
        self.framer.send_frame(&Frame::ack(seq))?;
        self.stats.frames_sent += 1;
        Ok(())
    }

    /// Close the link: send FIN and wait for its ACK, best effort. The
    /// peer may already be gone, so an unanswered FIN is not an error.
    pub fn close(&mut self, timeout: Duration) -> Result<()> {
        let seq = self.next_seq();
        self.framer.send_frame(&Frame::fin(seq))?;
        self.stats.frames_sent += 1;
        thread::sleep(TURNAROUND_GUARD);

        match self
            .framer
            .wait_for_frame(Some(FrameType::Ack), Some(seq), timeout)
        {
            Some(_) => {
                self.stats.acks_received += 1;
            }
            None => {
                self.stats.timeouts += 1;
                warn!("close: FIN was never acknowledged");
            }
        }
        Ok(())
    }
}
