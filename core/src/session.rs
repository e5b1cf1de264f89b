use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::error::{ModemError, Result};
use crate::frame::{Frame, FrameType};
use crate::transport::ReliableTransport;
use crate::TURNAROUND_GUARD;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    SynSent,
    Listen,
    SynReceived,
    Established,
    FinWait,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Wait per handshake step before retrying.
    pub connect_timeout: Duration,
    pub handshake_retries: u32,
    /// Wait for the FIN acknowledgment on close.
    pub close_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(8),
            handshake_retries: 5,
            close_timeout: Duration::from_secs(2),
        }
    }
}

/// Connection-oriented session over the reliable transport.
///
/// Exactly one session exists per modem instance, and exactly one side
/// sends the first SYN. A received RST drops the session to CLOSED from
/// any state.
pub struct Session {
    transport: ReliableTransport,
    config: SessionConfig,
    state: SessionState,
    established_at: Option<Instant>,
}

impl Session {
    pub fn new(transport: ReliableTransport) -> Self {
        Self::with_config(transport, SessionConfig::default())
    }

    pub fn with_config(transport: ReliableTransport, config: SessionConfig) -> Self {
        Self {
            transport,
            config,
            state: SessionState::Closed,
            established_at: None,
        }
    }

    pub fn start(&mut self) -> Result<()> {
        self.transport.start()
    }

    pub fn stop(&mut self) {
        self.transport.stop()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    pub fn established_at(&self) -> Option<Instant> {
        self.established_at
    }

    pub fn transport_mut(&mut self) -> &mut ReliableTransport {
        &mut self.transport
    }

    /// Initiate a connection: SYN, await SYN-ACK, answer with ACK.
    /// Each unanswered SYN is retried up to `handshake_retries` times.
    pub fn connect(&mut self) -> Result<()> {
        if self.state != SessionState::Closed {
            return Err(ModemError::BadState("connect requires a closed session"));
        }

        for attempt in 1..=self.config.handshake_retries {
            debug!("connect: sending SYN (attempt {})", attempt);
            self.transport.framer_mut().send_frame(&Frame::syn())?;
            self.state = SessionState::SynSent;
            thread::sleep(TURNAROUND_GUARD);

            match self.await_handshake(FrameType::SynAck, self.config.connect_timeout) {
                Ok(true) => {
                    self.transport.framer_mut().send_frame(&Frame::ack(0))?;
                    self.establish("initiator");
                    return Ok(());
                }
                Ok(false) => {
                    debug!("connect: no SYN-ACK, retrying");
                }
                Err(err) => {
                    self.state = SessionState::Closed;
                    return Err(err);
                }
            }
        }

        self.state = SessionState::Closed;
        Err(ModemError::LinkFailure(self.config.handshake_retries))
    }

    /// Respond to a connection: await SYN, answer SYN-ACK, await the
    /// final ACK. An unanswered SYN-ACK falls back to listening until
    /// `timeout` runs out.
    pub fn accept(&mut self, timeout: Duration) -> Result<()> {
        if self.state != SessionState::Closed {
            return Err(ModemError::BadState("accept requires a closed session"));
        }

        self.state = SessionState::Listen;
        let deadline = Instant::now() + timeout;

        loop {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                self.state = SessionState::Closed;
                return Err(ModemError::Timeout);
            };

            match self.await_handshake(FrameType::Syn, remaining) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    self.state = SessionState::Closed;
                    return Err(err);
                }
            }

            self.state = SessionState::SynReceived;
            self.transport.framer_mut().send_frame(&Frame::syn_ack())?;
            thread::sleep(TURNAROUND_GUARD);

            if self.await_handshake_ack()? {
                self.establish("responder");
                return Ok(());
            }
            debug!("accept: handshake ACK never arrived, back to listening");
            self.state = SessionState::Listen;
        }
    }

    /// Wait for one handshake frame of the given type. `Ok(false)` is a
    /// timeout; RST is terminal.
    fn await_handshake(&mut self, want: FrameType, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Ok(false);
            };
            let Some(frame) = self.transport.framer_mut().receive_frame(remaining) else {
                return Ok(false);
            };
            if frame.frame_type == want {
                return Ok(true);
            }
            match frame.frame_type {
                FrameType::Rst => return Err(ModemError::PeerReset),
                other => debug!("handshake: ignoring {:?} (want {:?})", other, want),
            }
        }
    }

    /// SYN-RECEIVED: wait for the closing ACK, answering duplicate SYNs
    /// with a fresh SYN-ACK (the initiator may not have heard ours).
    fn await_handshake_ack(&mut self) -> Result<bool> {
        let deadline = Instant::now() + self.config.connect_timeout;
        loop {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Ok(false);
            };
            let Some(frame) = self.transport.framer_mut().receive_frame(remaining) else {
                return Ok(false);
            };
            match frame.frame_type {
                FrameType::Ack => return Ok(true),
                FrameType::Syn => {
                    debug!("accept: duplicate SYN, re-sending SYN-ACK");
                    self.transport.framer_mut().send_frame(&Frame::syn_ack())?;
                    thread::sleep(TURNAROUND_GUARD);
                }
                FrameType::Rst => return Err(ModemError::PeerReset),
                other => debug!("handshake: ignoring {:?} (want Ack)", other),
            }
        }
    }

    fn establish(&mut self, role: &str) {
        self.state = SessionState::Established;
        self.established_at = Some(Instant::now());
        self.transport.reset_sequences();
        info!("session established ({})", role);
    }

    /// Send bytes over an established session.
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        if self.state != SessionState::Established {
            return Err(ModemError::NotEstablished);
        }
        match self.transport.send(data) {
            Err(ModemError::PeerReset) => {
                self.state = SessionState::Closed;
                Err(ModemError::PeerReset)
            }
            other => other,
        }
    }

    /// Receive one datagram segment from an established session.
    pub fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        if self.state != SessionState::Established {
            return Err(ModemError::NotEstablished);
        }
        match self.transport.receive(timeout) {
            Err(err @ (ModemError::Closed | ModemError::PeerReset)) => {
                self.state = SessionState::Closed;
                Err(err)
            }
            other => other,
        }
    }

    /// Send one length-prefixed message (u32 little-endian prefix).
    pub fn send_message(&mut self, message: &[u8]) -> Result<()> {
        let mut buf = Vec::with_capacity(4 + message.len());
        buf.extend_from_slice(&(message.len() as u32).to_le_bytes());
        buf.extend_from_slice(message);
        self.send(&buf)
    }

    /// Receive one length-prefixed message, reassembling across
    /// segments. `timeout` applies per segment.
    pub fn receive_message(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        while buf.len() < 4 {
            buf.extend(self.receive(timeout)?);
        }
        let length = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        let mut message = buf.split_off(4);
        while message.len() < length {
            message.extend(self.receive(timeout)?);
        }
        message.truncate(length);
        Ok(message)
    }

    /// Graceful close: FIN, best-effort wait for its ACK. Closing an
    /// already-closed session is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.state != SessionState::Established {
            self.state = SessionState::Closed;
            return Ok(());
        }
        self.state = SessionState::FinWait;
        let result = self.transport.close(self.config.close_timeout);
        self.state = SessionState::Closed;
        self.established_at = None;
        info!("session closed");
        result
    }

    /// Abort: fire an RST and drop to CLOSED immediately.
    pub fn reset(&mut self) -> Result<()> {
        self.transport.framer_mut().send_frame(&Frame::rst())?;
        self.state = SessionState::Closed;
        self.established_at = None;
        self.transport.reset_sequences();
        info!("session reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framer::Framer;
    use crate::modem::Modem;

    fn loopback_session() -> Session {
        Session::new(ReliableTransport::new(Framer::new(Modem::loopback())))
    }

    #[test]
    fn test_initial_state() {
        let session = loopback_session();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.is_closed());
        assert!(!session.is_established());
        assert!(session.established_at().is_none());
    }

    #[test]
    fn test_send_requires_established() {
        let mut session = loopback_session();
        assert!(matches!(
            session.send(b"data"),
            Err(ModemError::NotEstablished)
        ));
        assert!(matches!(
            session.receive(Duration::from_millis(10)),
            Err(ModemError::NotEstablished)
        ));
    }

    #[test]
    fn test_close_when_closed_is_noop() {
        let mut session = loopback_session();
        session.close().unwrap();
        session.close().unwrap();
        assert!(session.is_closed());
    }
}
