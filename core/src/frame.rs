use log::debug;

use crate::error::{ModemError, Result};
use crate::{MAX_PAYLOAD_SIZE, PREAMBLE_BYTE, PREAMBLE_LEN, SYNC_WORD};

// Frame layout, in transmission order:
//
// +----------+------+------+-----+--------+---------+--------+
// | PREAMBLE | SYNC | TYPE | SEQ | LENGTH | PAYLOAD | CRC-16 |
// | 16x 0xAA | 2B   | 1B   | 1B  | 1B     | 0-64B   | 2B     |
// +----------+------+------+-----+--------+---------+--------+
//
// The CRC covers TYPE through PAYLOAD, big-endian on the wire. No byte
// stuffing: a sync pattern that happens to occur inside a payload is
// disambiguated by the length field and the CRC check.

const HEADER_LEN: usize = 3; // TYPE + SEQ + LENGTH
const CRC_LEN: usize = 2;

/// CRC-16-CCITT: polynomial 0x1021, init 0xFFFF, no final XOR.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u32 = 0xFFFF;
    for &byte in data {
        crc ^= (byte as u32) << 8;
        for _ in 0..8 {
            crc <<= 1;
            if crc & 0x10000 != 0 {
                crc ^= 0x1021;
            }
        }
    }
    (crc & 0xFFFF) as u16
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x01,
    Ack = 0x02,
    Nak = 0x03,
    Syn = 0x10,
    SynAck = 0x11,
    Fin = 0x12,
    Rst = 0x13,
}

impl FrameType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(FrameType::Data),
            0x02 => Some(FrameType::Ack),
            0x03 => Some(FrameType::Nak),
            0x10 => Some(FrameType::Syn),
            0x11 => Some(FrameType::SynAck),
            0x12 => Some(FrameType::Fin),
            0x13 => Some(FrameType::Rst),
            _ => None,
        }
    }
}

/// One protocol frame. Frames exist only in transit: constructed to
/// send, consumed on receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub sequence: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(frame_type: FrameType, sequence: u8, payload: Vec<u8>) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ModemError::PayloadTooLarge(payload.len()));
        }
        Ok(Self {
            frame_type,
            sequence,
            payload,
        })
    }

    pub fn data(sequence: u8, payload: &[u8]) -> Result<Self> {
        Self::new(FrameType::Data, sequence, payload.to_vec())
    }

    pub fn ack(sequence: u8) -> Self {
        Self {
            frame_type: FrameType::Ack,
            sequence,
            payload: Vec::new(),
        }
    }

    pub fn nak(sequence: u8) -> Self {
        Self {
            frame_type: FrameType::Nak,
            sequence,
            payload: Vec::new(),
        }
    }

    pub fn syn() -> Self {
        Self {
            frame_type: FrameType::Syn,
            sequence: 0,
            payload: Vec::new(),
        }
    }

    pub fn syn_ack() -> Self {
        Self {
            frame_type: FrameType::SynAck,
            sequence: 0,
            payload: Vec::new(),
        }
    }

    pub fn fin(sequence: u8) -> Self {
        Self {
            frame_type: FrameType::Fin,
            sequence,
            payload: Vec::new(),
        }
    }

    pub fn rst() -> Self {
        Self {
            frame_type: FrameType::Rst,
            sequence: 0,
            payload: Vec::new(),
        }
    }

    pub fn is_control(&self) -> bool {
        self.frame_type != FrameType::Data
    }

    /// Serialize for transmission: preamble, sync word, header, payload,
    /// CRC.
    pub fn encode(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(PREAMBLE_LEN + SYNC_WORD.len() + HEADER_LEN + self.payload.len() + CRC_LEN);
        out.extend(std::iter::repeat(PREAMBLE_BYTE).take(PREAMBLE_LEN));
        out.extend_from_slice(&SYNC_WORD);
        let body_start = out.len();
        out.push(self.frame_type as u8);
        out.push(self.sequence);
        out.push(self.payload.len() as u8);
        out.extend_from_slice(&self.payload);
        let crc = crc16(&out[body_start..]);
        out.push((crc >> 8) as u8);
        out.push(crc as u8);
        out
    }

    /// Decode the first valid frame found anywhere in `data`.
    pub fn decode(data: &[u8]) -> Option<Frame> {
        let mut deframer = Deframer::new();
        deframer.push(data);
        deframer.next_frame()
    }
}

/// Incremental frame scanner over a received byte stream.
///
/// Seeks the sync word, reads the header, validates the length, then
/// payload and CRC. On CRC failure the scan resumes one byte past the
/// failed sync, never rewinding into the candidate payload, so noise
/// cannot wedge the scanner in a re-parse loop. Truncated candidates
/// stay pending until more bytes arrive or the scanner is reset.
#[derive(Default)]
pub struct Deframer {
    buf: Vec<u8>,
    pos: usize,
}

impl Deframer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Drop any buffered bytes, including a pending truncated candidate.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.pos = 0;
    }

    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            let sync = match self.find_sync() {
                Some(idx) => idx,
                None => {
                    // keep the final byte: it may be half a sync word
                    self.pos = self.buf.len().saturating_sub(1);
                    self.compact();
                    return None;
                }
            };

            let body = sync + SYNC_WORD.len();
            if self.buf.len() < body + HEADER_LEN {
                self.pos = sync;
                return None;
            }

            let Some(frame_type) = FrameType::from_byte(self.buf[body]) else {
                self.pos = sync + 1;
                continue;
            };
            let sequence = self.buf[body + 1];
            let length = self.buf[body + 2] as usize;
            if length > MAX_PAYLOAD_SIZE {
                self.pos = sync + 1;
                continue;
            }

            let total = body + HEADER_LEN + length + CRC_LEN;
            if self.buf.len() < total {
                self.pos = sync;
                return None;
            }

            let content = &self.buf[body..body + HEADER_LEN + length];
            let received = u16::from_be_bytes([self.buf[total - 2], self.buf[total - 1]]);
            let computed = crc16(content);
            if received != computed {
                let payload_head = &content[HEADER_LEN..HEADER_LEN + length.min(8)];
                debug!(
                    "frame CRC mismatch: received={:04x} computed={:04x} length={} payload[..{}]={:02x?}",
                    received,
                    computed,
                    length,
                    payload_head.len(),
                    payload_head
                );
                self.pos = sync + 1;
                continue;
            }

            let payload = content[HEADER_LEN..].to_vec();
            self.pos = total;
            self.compact();
            return Some(Frame {
                frame_type,
                sequence,
                payload,
            });
        }
    }

    fn find_sync(&self) -> Option<usize> {
        let buf = &self.buf;
        (self.pos..buf.len().checked_sub(1)?)
            .find(|&i| buf[i] == SYNC_WORD[0] && buf[i + 1] == SYNC_WORD[1])
    }

    fn compact(&mut self) {
        if self.pos > 4096 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
    }
}
