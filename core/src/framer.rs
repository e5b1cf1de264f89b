use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::error::Result;
use crate::frame::{Deframer, Frame, FrameType};
use crate::modem::Modem;

/// Sends and receives frames over a modem.
///
/// Frames that arrive while waiting for something specific are parked
/// in a pending queue rather than discarded, so an out-of-turn frame
/// cannot starve the caller that expects it.
pub struct Framer {
    modem: Modem,
    deframer: Deframer,
    pending: VecDeque<Frame>,
}

impl Framer {
    pub fn new(modem: Modem) -> Self {
        Self {
            modem,
            deframer: Deframer::new(),
            pending: VecDeque::new(),
        }
    }

    pub fn start(&mut self) -> Result<()> {
        self.modem.start()
    }

    pub fn stop(&mut self) {
        self.modem.stop()
    }

    pub fn modem_mut(&mut self) -> &mut Modem {
        &mut self.modem
    }

    pub fn send_frame(&mut self, frame: &Frame) -> Result<()> {
        let bytes = frame.encode();
        debug!(
            "send {:?} seq={} ({} bytes on wire)",
            frame.frame_type,
            frame.sequence,
            bytes.len()
        );
        self.modem.send(&bytes)
    }

    /// Next frame from the pending queue or the wire.
    pub fn receive_frame(&mut self, timeout: Duration) -> Option<Frame> {
        if let Some(frame) = self.pending.pop_front() {
            return Some(frame);
        }
        self.receive_from_wire(timeout)
    }

    /// Wait for a frame matching the given type/sequence, parking
    /// everything else in the pending queue.
    pub fn wait_for_frame(
        &mut self,
        want_type: Option<FrameType>,
        want_seq: Option<u8>,
        timeout: Duration,
    ) -> Option<Frame> {
        if let Some(idx) = self
            .pending
            .iter()
            .position(|f| matches(f, want_type, want_seq))
        {
            return self.pending.remove(idx);
        }

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let frame = self.receive_from_wire(remaining)?;
            if matches(&frame, want_type, want_seq) {
                return Some(frame);
            }
            trace!(
                "parking {:?} seq={} while waiting for {:?}",
                frame.frame_type,
                frame.sequence,
                want_type
            );
            self.pending.push_back(frame);
        }
    }

    /// Pull bursts off the modem until one decodes into at least one
    /// frame. Bursts are independent transmissions; residue left after
    /// scanning one burst is noise, not a frame prefix, so the scanner
    /// is reset between bursts.
    fn receive_from_wire(&mut self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let data = self.modem.receive(remaining);
            if data.is_empty() {
                continue;
            }

            self.deframer.push(&data);
            let mut first = None;
            while let Some(frame) = self.deframer.next_frame() {
                if first.is_none() {
                    first = Some(frame);
                } else {
                    self.pending.push_back(frame);
                }
            }
            self.deframer.reset();

            match first {
                Some(frame) => {
                    debug!("recv {:?} seq={}", frame.frame_type, frame.sequence);
                    return Some(frame);
                }
                None => debug!("undecodable burst of {} bytes", data.len()),
            }
        }
    }
}

fn matches(frame: &Frame, want_type: Option<FrameType>, want_seq: Option<u8>) -> bool {
    if let Some(t) = want_type {
        if frame.frame_type != t {
            return false;
        }
    }
    if let Some(s) = want_seq {
        if frame.sequence != s {
            return false;
        }
    }
    true
}
