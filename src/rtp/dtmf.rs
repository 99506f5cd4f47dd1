//! Telephone-event DTMF payload codec (RFC 4733).
//!
//! Payload format:
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     event     |E|R| volume    |          duration             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use thiserror::Error;

use super::RtpPacket;

/// Payload size of a telephone-event packet.
pub const TELEPHONE_EVENT_LEN: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DtmfError {
    #[error("telephone-event payload must be 4 bytes, got {0}")]
    BadLength(usize),
}

/// DTMF event codes 0-9 map to digits, 10 = `*`, 11 = `#`, 12-15 = A-D.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelephoneEvent {
    pub event: u8,
    /// End-of-event flag; retransmitted end packets keep it set.
    pub end: bool,
    /// Power level in dBm0, 0 to -63. Values outside the range are
    /// clamped on encode.
    pub volume: i8,
    /// Duration in timestamp units since the event began.
    pub duration: u16,
}

impl TelephoneEvent {
    pub fn new(event: u8, volume: i8, duration: u16) -> Self {
        Self {
            event,
            end: false,
            volume,
            duration,
        }
    }

    /// The event code for an ASCII digit / `*` / `#` / `A`-`D`.
    pub fn event_for_char(c: char) -> Option<u8> {
        match c {
            '0'..='9' => Some(c as u8 - b'0'),
            '*' => Some(10),
            '#' => Some(11),
            'A'..='D' => Some(c as u8 - b'A' + 12),
            'a'..='d' => Some(c as u8 - b'a' + 12),
            _ => None,
        }
    }

    /// The dial character for this event code, if it maps to one.
    pub fn to_char(&self) -> Option<char> {
        match self.event {
            0..=9 => Some((b'0' + self.event) as char),
            10 => Some('*'),
            11 => Some('#'),
            12..=15 => Some((b'A' + self.event - 12) as char),
            _ => None,
        }
    }

    pub fn encode(&self) -> [u8; TELEPHONE_EVENT_LEN] {
        let clamped = self.volume.clamp(-63, 0);
        let mut b1 = (-clamped) as u8 & 0x3F;
        if self.end {
            b1 |= 0x80;
        }
        let dur = self.duration.to_be_bytes();
        [self.event, b1, dur[0], dur[1]]
    }

    pub fn decode(data: &[u8]) -> Result<Self, DtmfError> {
        if data.len() != TELEPHONE_EVENT_LEN {
            return Err(DtmfError::BadLength(data.len()));
        }
        Ok(Self {
            event: data[0],
            end: data[1] & 0x80 != 0,
            volume: -((data[1] & 0x3F) as i8),
            duration: u16::from_be_bytes([data[2], data[3]]),
        })
    }
}

/// Turns a telephone-event RTP stream into discrete digits.
///
/// An event spans several packets sharing one RTP timestamp: interim
/// updates, then an end packet which senders retransmit for
/// reliability. The digit is emitted when the first end packet of a
/// timestamp arrives; the retransmitted ends are absorbed.
#[derive(Debug)]
pub struct DtmfReceiver {
    payload_type: u8,
    last_completed: Option<u32>,
}

impl DtmfReceiver {
    pub fn new(payload_type: u8) -> Self {
        Self {
            payload_type,
            last_completed: None,
        }
    }

    /// Process one RTP packet; returns the completed event when its
    /// first end packet arrives. Packets of other payload types pass
    /// through as `None`.
    pub fn process(&mut self, packet: &RtpPacket) -> Result<Option<TelephoneEvent>, DtmfError> {
        if packet.payload_type != self.payload_type {
            return Ok(None);
        }
        let event = TelephoneEvent::decode(&packet.payload)?;
        if !event.end {
            return Ok(None);
        }
        if self.last_completed == Some(packet.timestamp) {
            return Ok(None);
        }
        self.last_completed = Some(packet.timestamp);
        Ok(Some(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let ev = TelephoneEvent {
            event: 5,
            end: true,
            volume: -10,
            duration: 800,
        };
        let decoded = TelephoneEvent::decode(&ev.encode()).unwrap();
        assert_eq!(decoded, ev);
    }

    #[test]
    fn test_volume_clamped_on_encode() {
        let loud = TelephoneEvent::new(1, 5, 160); // positive dBm0 is invalid
        assert_eq!(TelephoneEvent::decode(&loud.encode()).unwrap().volume, 0);

        let quiet = TelephoneEvent::new(1, -90, 160);
        assert_eq!(TelephoneEvent::decode(&quiet.encode()).unwrap().volume, -63);
    }

    #[test]
    fn test_end_flag_independent_of_volume() {
        let mut ev = TelephoneEvent::new(11, -63, 400);
        ev.end = true;
        let bytes = ev.encode();
        assert_eq!(bytes[1], 0x80 | 63);
        assert!(TelephoneEvent::decode(&bytes).unwrap().end);
    }

    #[test]
    fn test_event_for_char() {
        assert_eq!(TelephoneEvent::event_for_char('0'), Some(0));
        assert_eq!(TelephoneEvent::event_for_char('9'), Some(9));
        assert_eq!(TelephoneEvent::event_for_char('*'), Some(10));
        assert_eq!(TelephoneEvent::event_for_char('#'), Some(11));
        assert_eq!(TelephoneEvent::event_for_char('D'), Some(15));
        assert_eq!(TelephoneEvent::event_for_char('x'), None);
    }

    #[test]
    fn test_bad_length() {
        assert_eq!(
            TelephoneEvent::decode(&[1, 2, 3]),
            Err(DtmfError::BadLength(3))
        );
    }

    const PT_EVENT: u8 = 101;

    fn event_packet(event: u8, end: bool, seq: u16, timestamp: u32, duration: u16) -> RtpPacket {
        let mut ev = TelephoneEvent::new(event, -10, duration);
        ev.end = end;
        RtpPacket::new(PT_EVENT, seq, timestamp, 0xD7, ev.encode().to_vec())
    }

    #[test]
    fn test_receiver_emits_digit_once() {
        let mut rx = DtmfReceiver::new(PT_EVENT);
        let mut digits = String::new();

        // Digit 5: two updates, the end packet, and two end
        // retransmissions with the same timestamp.
        for (seq, end, duration) in [
            (1u16, false, 160u16),
            (2, false, 320),
            (3, true, 480),
            (4, true, 480),
            (5, true, 480),
        ] {
            let packet = event_packet(5, end, seq, 8000, duration);
            if let Some(event) = rx.process(&packet).unwrap() {
                digits.push(event.to_char().unwrap());
            }
        }
        assert_eq!(digits, "5");
    }

    #[test]
    fn test_receiver_separates_events_by_timestamp() {
        let mut rx = DtmfReceiver::new(PT_EVENT);
        let mut digits = String::new();
        for (event, timestamp) in [(9u8, 8000u32), (1, 12000), (11, 16000)] {
            for (i, end) in [(0u16, false), (1, true), (2, true)] {
                let packet = event_packet(event, end, timestamp as u16 + i, timestamp, 160);
                if let Some(event) = rx.process(&packet).unwrap() {
                    digits.push(event.to_char().unwrap());
                }
            }
        }
        assert_eq!(digits, "91#");
    }

    #[test]
    fn test_receiver_ignores_other_payload_types() {
        let mut rx = DtmfReceiver::new(PT_EVENT);
        let audio = RtpPacket::new(0, 1, 160, 0xD7, vec![0xFF; 160]);
        assert_eq!(rx.process(&audio).unwrap(), None);
    }
}
