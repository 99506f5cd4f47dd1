//! Real-time text redundancy receiver (RFC 4103 §4.2).
//!
//! T.140 text rides RTP either directly on the T.140 payload type or
//! inside a `red` payload (RFC 2198) where each packet repeats the last
//! N text blocks. The receiver tracks the RTP sequence number, and when
//! packets were lost it recovers their text from the redundant blocks
//! of the next packet that arrives.
//!
//! Redundant block header (one per redundant block, 4 bytes):
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |F|   block PT  |  timestamp offset         |   block length    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//! The final header has the F bit clear and is a single byte carrying
//! only the primary payload type; the primary data is whatever bytes
//! remain after the redundant blocks.

use thiserror::Error;

use super::RtpPacket;

/// UTF-8 byte-order mark some T.140 senders prepend to each block.
const UTF8_BOM: &str = "\u{FEFF}";

/// T.140 uses U+2028 LINE SEPARATOR for new lines.
const LINE_SEPARATOR: char = '\u{2028}';

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RttError {
    #[error("malformed red payload: {0}")]
    MalformedRed(&'static str),
    #[error("T.140 block is not valid UTF-8")]
    InvalidUtf8,
    #[error("unexpected payload type {0}")]
    UnexpectedPayloadType(u8),
}

/// One redundancy header of a `red` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedHeader {
    pub payload_type: u8,
    pub timestamp_offset: u16,
    pub block_length: u16,
}

impl RedHeader {
    fn encode(&self) -> [u8; 4] {
        [
            0x80 | (self.payload_type & 0x7F),
            (self.timestamp_offset >> 6) as u8,
            ((self.timestamp_offset << 2) as u8) | ((self.block_length >> 8) as u8 & 0x03),
            self.block_length as u8,
        ]
    }
}

/// A decoded `red` payload: redundant blocks oldest first, then the
/// primary block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedPayload {
    pub redundant: Vec<(RedHeader, Vec<u8>)>,
    pub primary_payload_type: u8,
    pub primary: Vec<u8>,
}

/// Decode a `red` payload into its blocks.
pub fn decode_red(payload: &[u8]) -> Result<RedPayload, RttError> {
    let mut headers = Vec::new();
    let mut offset = 0;
    let primary_payload_type;
    loop {
        if offset >= payload.len() {
            return Err(RttError::MalformedRed("headers not terminated"));
        }
        let b0 = payload[offset];
        if b0 & 0x80 == 0 {
            primary_payload_type = b0 & 0x7F;
            offset += 1;
            break;
        }
        if payload.len() < offset + 4 {
            return Err(RttError::MalformedRed("truncated redundancy header"));
        }
        let timestamp_offset =
            ((payload[offset + 1] as u16) << 6) | ((payload[offset + 2] as u16) >> 2);
        let block_length = (((payload[offset + 2] & 0x03) as u16) << 8) | payload[offset + 3] as u16;
        headers.push(RedHeader {
            payload_type: b0 & 0x7F,
            timestamp_offset,
            block_length,
        });
        offset += 4;
    }

    let mut redundant = Vec::with_capacity(headers.len());
    for header in headers {
        let len = header.block_length as usize;
        if payload.len() < offset + len {
            return Err(RttError::MalformedRed("redundant block exceeds payload"));
        }
        redundant.push((header, payload[offset..offset + len].to_vec()));
        offset += len;
    }

    Ok(RedPayload {
        redundant,
        primary_payload_type,
        primary: payload[offset..].to_vec(),
    })
}

/// Build a `red` payload from redundant blocks (oldest first) and the
/// primary block. Used by senders and by the receiver tests.
pub fn encode_red(
    block_payload_type: u8,
    redundant: &[(u16, &[u8])],
    primary: &[u8],
) -> Vec<u8> {
    let mut buf = Vec::new();
    for (timestamp_offset, data) in redundant {
        let header = RedHeader {
            payload_type: block_payload_type,
            timestamp_offset: *timestamp_offset,
            block_length: data.len() as u16,
        };
        buf.extend_from_slice(&header.encode());
    }
    buf.push(block_payload_type & 0x7F);
    for (_, data) in redundant {
        buf.extend_from_slice(data);
    }
    buf.extend_from_slice(primary);
    buf
}

/// Builds the outgoing `red` packet stream for a T.140 source,
/// carrying the last N text blocks as redundancy.
#[derive(Debug)]
pub struct RttSender {
    t140_payload_type: u8,
    red_payload_type: u8,
    redundancy_level: usize,
    ssrc: u32,
    next_seq: u16,
    started: bool,
    /// Previous generations, oldest first: `(timestamp, block)`.
    history: std::collections::VecDeque<(u32, Vec<u8>)>,
}

impl RttSender {
    pub fn new(
        t140_payload_type: u8,
        red_payload_type: u8,
        redundancy_level: usize,
        ssrc: u32,
        first_seq: u16,
    ) -> Self {
        Self {
            t140_payload_type,
            red_payload_type,
            redundancy_level,
            ssrc,
            next_seq: first_seq,
            started: false,
            history: std::collections::VecDeque::new(),
        }
    }

    /// Emit the next packet carrying `text` plus the redundant
    /// generations accumulated so far. The first packet sets the
    /// marker bit.
    pub fn push(&mut self, text: &str, timestamp: u32) -> RtpPacket {
        let redundant: Vec<(u16, &[u8])> = self
            .history
            .iter()
            .map(|(ts, block)| {
                (timestamp.wrapping_sub(*ts).min(0x3FFF) as u16, block.as_slice())
            })
            .collect();
        let payload = encode_red(self.t140_payload_type, &redundant, text.as_bytes());

        let mut packet = RtpPacket::new(
            self.red_payload_type,
            self.next_seq,
            timestamp,
            self.ssrc,
            payload,
        );
        packet.marker = !self.started;
        self.started = true;
        self.next_seq = self.next_seq.wrapping_add(1);

        self.history.push_back((timestamp, text.as_bytes().to_vec()));
        while self.history.len() > self.redundancy_level {
            self.history.pop_front();
        }
        packet
    }
}

/// Reassembles a T.140 character stream across RTP loss.
#[derive(Debug)]
pub struct RttReceiver {
    t140_payload_type: u8,
    red_payload_type: Option<u8>,
    /// Redundant T.140 generations carried per `red` packet.
    redundancy_level: usize,
    last_seq: Option<u16>,
}

impl RttReceiver {
    pub fn new(t140_payload_type: u8, red_payload_type: Option<u8>, redundancy_level: usize) -> Self {
        Self {
            t140_payload_type,
            red_payload_type,
            redundancy_level,
            last_seq: None,
        }
    }

    /// Process one RTP packet, returning recovered text in stream order.
    /// Keepalive packets with no new text yield `None`.
    pub fn process(&mut self, packet: &RtpPacket) -> Result<Option<String>, RttError> {
        let missed = match self.last_seq {
            Some(last) => {
                packet
                    .sequence_number
                    .wrapping_sub(last)
                    .wrapping_sub(1) as usize
            }
            // Without a marker bit there is no way to tell whether the
            // stream started before us; assume one packet was missed.
            None if packet.marker => 0,
            None => 1,
        };
        self.last_seq = Some(packet.sequence_number);

        let text = if packet.payload_type == self.t140_payload_type {
            decode_t140(&packet.payload)?
        } else if Some(packet.payload_type) == self.red_payload_type {
            let red = decode_red(&packet.payload)?;
            if red.primary_payload_type != self.t140_payload_type {
                return Err(RttError::UnexpectedPayloadType(red.primary_payload_type));
            }
            let recover = missed.min(self.redundancy_level).min(red.redundant.len());
            if missed > recover {
                tracing::warn!(
                    "RTT loss exceeds redundancy: {} packets missed, {} recoverable",
                    missed,
                    recover
                );
            }
            let mut text = String::new();
            for (_, block) in &red.redundant[red.redundant.len() - recover..] {
                text.push_str(&decode_t140(block)?);
            }
            text.push_str(&decode_t140(&red.primary)?);
            text
        } else {
            return Err(RttError::UnexpectedPayloadType(packet.payload_type));
        };

        if text.is_empty() {
            Ok(None)
        } else {
            Ok(Some(text))
        }
    }
}

/// Decode one T.140 block: UTF-8, BOM stripped, line separator
/// normalized to `\n`.
fn decode_t140(block: &[u8]) -> Result<String, RttError> {
    let text = std::str::from_utf8(block).map_err(|_| RttError::InvalidUtf8)?;
    let text = text.strip_prefix(UTF8_BOM).unwrap_or(text);
    Ok(text.replace(LINE_SEPARATOR, "\n"))
}
