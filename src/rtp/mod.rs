//! RTP packet encoding/decoding (RFC 3550).
//!
//! RTP header format:
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       sequence number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           synchronization source (SSRC) identifier            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! CSRC entries, the extension header and padding are surfaced opaquely;
//! the SRTP transform and the RTT receiver both consume this model.

pub mod dtmf;
pub mod rtcp;
pub mod rtt;

use thiserror::Error;

/// Minimum RTP header size in bytes (no CSRC, no extension).
pub const RTP_HEADER_SIZE: usize = 12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RtpError {
    #[error("malformed RTP packet: {0}")]
    MalformedRtp(&'static str),
    #[error("unsupported RTP version: {0}")]
    UnsupportedVersion(u8),
}

/// Opaque RTP header extension (RFC 3550 §5.3.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpExtension {
    pub profile: u16,
    /// Extension words, length already stripped of the 4-byte prelude.
    pub data: Vec<u8>,
}

/// Parsed RTP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrc: Vec<u32>,
    pub extension: Option<RtpExtension>,
    /// Payload with any padding already removed.
    pub payload: Vec<u8>,
    /// Number of padding bytes the packet carried (0 = none).
    pub padding_len: u8,
}

impl RtpPacket {
    /// A minimal packet with no CSRCs, extension or padding.
    pub fn new(payload_type: u8, seq: u16, timestamp: u32, ssrc: u32, payload: Vec<u8>) -> Self {
        Self {
            marker: false,
            payload_type,
            sequence_number: seq,
            timestamp,
            ssrc,
            csrc: Vec::new(),
            extension: None,
            payload,
            padding_len: 0,
        }
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(RTP_HEADER_SIZE + self.payload.len());

        let mut b0 = 0x80u8; // V=2
        if self.padding_len > 0 {
            b0 |= 0x20;
        }
        if self.extension.is_some() {
            b0 |= 0x10;
        }
        b0 |= (self.csrc.len() as u8) & 0x0F;
        buf.push(b0);

        let mut b1 = self.payload_type & 0x7F;
        if self.marker {
            b1 |= 0x80;
        }
        buf.push(b1);

        buf.extend_from_slice(&self.sequence_number.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&self.ssrc.to_be_bytes());
        for csrc in &self.csrc {
            buf.extend_from_slice(&csrc.to_be_bytes());
        }
        if let Some(ref ext) = self.extension {
            buf.extend_from_slice(&ext.profile.to_be_bytes());
            buf.extend_from_slice(&((ext.data.len() / 4) as u16).to_be_bytes());
            buf.extend_from_slice(&ext.data);
        }
        buf.extend_from_slice(&self.payload);
        if self.padding_len > 0 {
            // Padding bytes are zero except the final count byte.
            buf.extend(std::iter::repeat(0u8).take(self.padding_len as usize - 1));
            buf.push(self.padding_len);
        }
        buf
    }

    /// Parse wire bytes into a packet. Version must be 2.
    pub fn decode(data: &[u8]) -> Result<Self, RtpError> {
        if data.len() < RTP_HEADER_SIZE {
            return Err(RtpError::MalformedRtp("packet shorter than fixed header"));
        }

        let version = data[0] >> 6;
        if version != 2 {
            return Err(RtpError::UnsupportedVersion(version));
        }
        let has_padding = data[0] & 0x20 != 0;
        let has_extension = data[0] & 0x10 != 0;
        let csrc_count = (data[0] & 0x0F) as usize;
        let marker = data[1] & 0x80 != 0;
        let payload_type = data[1] & 0x7F;
        let sequence_number = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let mut offset = RTP_HEADER_SIZE;
        if data.len() < offset + csrc_count * 4 {
            return Err(RtpError::MalformedRtp("packet truncated in CSRC list"));
        }
        let mut csrc = Vec::with_capacity(csrc_count);
        for _ in 0..csrc_count {
            csrc.push(u32::from_be_bytes([
                data[offset],
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
            ]));
            offset += 4;
        }

        let extension = if has_extension {
            if data.len() < offset + 4 {
                return Err(RtpError::MalformedRtp("packet truncated in extension prelude"));
            }
            let profile = u16::from_be_bytes([data[offset], data[offset + 1]]);
            let words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4;
            if data.len() < offset + words * 4 {
                return Err(RtpError::MalformedRtp("packet truncated in extension data"));
            }
            let ext_data = data[offset..offset + words * 4].to_vec();
            offset += words * 4;
            Some(RtpExtension {
                profile,
                data: ext_data,
            })
        } else {
            None
        };

        let mut end = data.len();
        let mut padding_len = 0u8;
        if has_padding {
            padding_len = data[end - 1];
            if padding_len == 0 || (padding_len as usize) > end - offset {
                return Err(RtpError::MalformedRtp("invalid padding count"));
            }
            end -= padding_len as usize;
        }

        Ok(Self {
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc,
            extension,
            payload: data[offset..end].to_vec(),
            padding_len,
        })
    }

    /// Length of the header section (fixed header + CSRCs + extension)
    /// in the encoded form. This is the portion SRTP leaves in the clear.
    pub fn header_len(&self) -> usize {
        let mut len = RTP_HEADER_SIZE + self.csrc.len() * 4;
        if let Some(ref ext) = self.extension {
            len += 4 + ext.data.len();
        }
        len
    }
}

/// Compute the full RTP header length from raw packet bytes, accounting
/// for CSRC entries and the extension header. `None` if truncated.
pub fn full_header_len(data: &[u8]) -> Option<usize> {
    if data.len() < RTP_HEADER_SIZE {
        return None;
    }
    let csrc_count = (data[0] & 0x0F) as usize;
    let has_extension = (data[0] >> 4) & 0x01 != 0;
    let mut len = RTP_HEADER_SIZE + csrc_count * 4;
    if data.len() < len {
        return None;
    }
    if has_extension {
        if data.len() < len + 4 {
            return None;
        }
        let ext_words = u16::from_be_bytes([data[len + 2], data[len + 3]]) as usize;
        len += 4 + ext_words * 4;
        if data.len() < len {
            return None;
        }
    }
    Some(len)
}
