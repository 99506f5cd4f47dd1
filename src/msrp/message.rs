//! MSRP chunk model and wire serialization (RFC 4975 §7).
//!
//! A chunk on the wire:
//! ```text
//! MSRP d93kswow SEND\r\n
//! To-Path: msrp://bob.example.com:8888/9di4ea;tcp\r\n
//! From-Path: msrp://alice.example.com:7777/iau39;tcp\r\n
//! Message-ID: 12339sdqwer\r\n
//! Byte-Range: 1-16/16\r\n
//! Content-Type: text/plain\r\n
//! \r\n
//! Hello, my friend\r\n
//! -------d93kswow$\r\n
//! ```
//! The blank line and body are absent on bodiless chunks (responses,
//! most REPORTs); the end-line flag says whether the chunk completes,
//! continues or aborts its message.

use std::fmt;

use super::uri::MsrpUri;
use super::MsrpError;

/// End-line continuation flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuationFlag {
    /// `$` — this chunk completes the message.
    Complete,
    /// `+` — more chunks of this message follow.
    Continuation,
    /// `#` — the sender aborted the message.
    Abort,
}

impl ContinuationFlag {
    pub fn as_char(&self) -> char {
        match self {
            ContinuationFlag::Complete => '$',
            ContinuationFlag::Continuation => '+',
            ContinuationFlag::Abort => '#',
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, MsrpError> {
        match byte {
            b'$' => Ok(ContinuationFlag::Complete),
            b'+' => Ok(ContinuationFlag::Continuation),
            b'#' => Ok(ContinuationFlag::Abort),
            _ => Err(MsrpError::MalformedMsrp("bad continuation flag")),
        }
    }
}

/// Request or response start line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MsrpKind {
    Request(String),
    Response { code: u16, comment: String },
}

/// `Byte-Range: start-end/total`, with `*` for unknown end or total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// 1-based first byte of this chunk.
    pub start: u64,
    pub end: Option<u64>,
    pub total: Option<u64>,
}

impl ByteRange {
    pub fn whole(total: u64) -> Self {
        Self {
            start: 1,
            end: Some(total),
            total: Some(total),
        }
    }

    pub fn parse(value: &str) -> Result<Self, MsrpError> {
        let (range, total) = value
            .trim()
            .split_once('/')
            .ok_or(MsrpError::MalformedMsrp("Byte-Range has no '/'"))?;
        let (start, end) = range
            .split_once('-')
            .ok_or(MsrpError::MalformedMsrp("Byte-Range has no '-'"))?;
        let parse_part = |s: &str| -> Result<Option<u64>, MsrpError> {
            if s == "*" {
                Ok(None)
            } else {
                s.parse()
                    .map(Some)
                    .map_err(|_| MsrpError::MalformedMsrp("bad Byte-Range number"))
            }
        };
        Ok(Self {
            start: parse_part(start)?.ok_or(MsrpError::MalformedMsrp("Byte-Range start is *"))?,
            end: parse_part(end)?,
            total: parse_part(total)?,
        })
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fmt_part = |part: Option<u64>| match part {
            Some(n) => n.to_string(),
            None => "*".to_string(),
        };
        write!(
            f,
            "{}-{}/{}",
            self.start,
            fmt_part(self.end),
            fmt_part(self.total)
        )
    }
}

/// `Status: 000 200 OK` carried by REPORT requests and used when
/// matching reports back to sent messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsrpStatus {
    pub code: u16,
    pub text: String,
}

impl MsrpStatus {
    pub fn parse(value: &str) -> Result<Self, MsrpError> {
        let mut parts = value.trim().splitn(3, ' ');
        let namespace = parts
            .next()
            .ok_or(MsrpError::MalformedMsrp("empty Status"))?;
        if namespace != "000" {
            return Err(MsrpError::MalformedMsrp("unknown Status namespace"));
        }
        let code = parts
            .next()
            .and_then(|c| c.parse().ok())
            .ok_or(MsrpError::MalformedMsrp("bad Status code"))?;
        Ok(Self {
            code,
            text: parts.next().unwrap_or("").to_string(),
        })
    }
}

impl fmt::Display for MsrpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.text.is_empty() {
            write!(f, "000 {}", self.code)
        } else {
            write!(f, "000 {} {}", self.code, self.text)
        }
    }
}

/// One MSRP chunk (request or response).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsrpMessage {
    pub transaction_id: String,
    pub kind: MsrpKind,
    pub to_path: Vec<MsrpUri>,
    pub from_path: Vec<MsrpUri>,
    pub message_id: Option<String>,
    pub byte_range: Option<ByteRange>,
    pub success_report: Option<String>,
    pub failure_report: Option<String>,
    pub status: Option<MsrpStatus>,
    pub content_type: Option<String>,
    pub body: Option<Vec<u8>>,
    pub flag: ContinuationFlag,
}

impl MsrpMessage {
    pub fn request(method: &str, transaction_id: &str) -> Self {
        Self {
            transaction_id: transaction_id.to_string(),
            kind: MsrpKind::Request(method.to_string()),
            to_path: Vec::new(),
            from_path: Vec::new(),
            message_id: None,
            byte_range: None,
            success_report: None,
            failure_report: None,
            status: None,
            content_type: None,
            body: None,
            flag: ContinuationFlag::Complete,
        }
    }

    /// Response to a request chunk: paths reversed, no body.
    pub fn response_to(request: &MsrpMessage, code: u16, comment: &str) -> Self {
        let mut response = Self::request("", &request.transaction_id);
        response.kind = MsrpKind::Response {
            code,
            comment: comment.to_string(),
        };
        // §7.2: the response To-Path is the first From-Path URI.
        response.to_path = request.from_path.first().cloned().into_iter().collect();
        response.from_path = request.to_path.first().cloned().into_iter().collect();
        response
    }

    pub fn method(&self) -> Option<&str> {
        match &self.kind {
            MsrpKind::Request(method) => Some(method),
            MsrpKind::Response { .. } => None,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match &self.kind {
            MsrpKind::Response { code, .. } => Some(*code),
            MsrpKind::Request(_) => None,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self.kind, MsrpKind::Request(_))
    }

    /// Serialize to wire bytes including the end-line.
    pub fn serialize(&self) -> Vec<u8> {
        let mut head = String::new();
        match &self.kind {
            MsrpKind::Request(method) => {
                head.push_str(&format!("MSRP {} {}\r\n", self.transaction_id, method));
            }
            MsrpKind::Response { code, comment } => {
                if comment.is_empty() {
                    head.push_str(&format!("MSRP {} {}\r\n", self.transaction_id, code));
                } else {
                    head.push_str(&format!(
                        "MSRP {} {} {}\r\n",
                        self.transaction_id, code, comment
                    ));
                }
            }
        }

        let paths = |uris: &[MsrpUri]| {
            uris.iter()
                .map(|u| u.to_string())
                .collect::<Vec<_>>()
                .join(" ")
        };
        head.push_str(&format!("To-Path: {}\r\n", paths(&self.to_path)));
        head.push_str(&format!("From-Path: {}\r\n", paths(&self.from_path)));

        if let Some(ref id) = self.message_id {
            head.push_str(&format!("Message-ID: {id}\r\n"));
        }
        if let Some(ref report) = self.success_report {
            head.push_str(&format!("Success-Report: {report}\r\n"));
        }
        if let Some(ref report) = self.failure_report {
            head.push_str(&format!("Failure-Report: {report}\r\n"));
        }
        if let Some(ref range) = self.byte_range {
            head.push_str(&format!("Byte-Range: {range}\r\n"));
        }
        if let Some(ref status) = self.status {
            head.push_str(&format!("Status: {status}\r\n"));
        }

        let mut out = head.into_bytes();
        if let Some(ref body) = self.body {
            if let Some(ref ct) = self.content_type {
                out.extend_from_slice(format!("Content-Type: {ct}\r\n").as_bytes());
            }
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(body);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"-------");
        out.extend_from_slice(self.transaction_id.as_bytes());
        out.push(self.flag.as_char() as u8);
        out.extend_from_slice(b"\r\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_range_forms() {
        let full = ByteRange::parse("1-16/16").unwrap();
        assert_eq!(full.start, 1);
        assert_eq!(full.end, Some(16));
        assert_eq!(full.total, Some(16));

        let open = ByteRange::parse("2049-*/*").unwrap();
        assert_eq!(open.start, 2049);
        assert_eq!(open.end, None);
        assert_eq!(open.total, None);
        assert_eq!(open.to_string(), "2049-*/*");

        assert!(ByteRange::parse("16/16").is_err());
    }

    #[test]
    fn test_status_roundtrip() {
        let status = MsrpStatus::parse("000 200 OK").unwrap();
        assert_eq!(status.code, 200);
        assert_eq!(status.text, "OK");
        assert_eq!(status.to_string(), "000 200 OK");

        assert!(MsrpStatus::parse("001 200 OK").is_err());
    }

    #[test]
    fn test_serialize_send_chunk() {
        let mut send = MsrpMessage::request("SEND", "d93kswow");
        send.to_path = vec![MsrpUri::parse("msrp://bob.example.com:8888/9di4ea;tcp").unwrap()];
        send.from_path = vec![MsrpUri::parse("msrp://alice.example.com:7777/iau39;tcp").unwrap()];
        send.message_id = Some("12339sdqwer".to_string());
        send.byte_range = Some(ByteRange::whole(16));
        send.content_type = Some("text/plain".to_string());
        send.body = Some(b"Hello, my friend".to_vec());

        let wire = String::from_utf8(send.serialize()).unwrap();
        assert!(wire.starts_with("MSRP d93kswow SEND\r\n"));
        assert!(wire.contains("To-Path: msrp://bob.example.com:8888/9di4ea;tcp\r\n"));
        assert!(wire.contains("Byte-Range: 1-16/16\r\n"));
        assert!(wire.contains("\r\n\r\nHello, my friend\r\n"));
        assert!(wire.ends_with("-------d93kswow$\r\n"));
    }

    #[test]
    fn test_serialize_bodiless_response() {
        let mut send = MsrpMessage::request("SEND", "abc123");
        send.to_path = vec![MsrpUri::new("b.example.com", 8888, "s2")];
        send.from_path = vec![MsrpUri::new("a.example.com", 7777, "s1")];

        let response = MsrpMessage::response_to(&send, 200, "OK");
        let wire = String::from_utf8(response.serialize()).unwrap();
        assert!(wire.starts_with("MSRP abc123 200 OK\r\n"));
        // Paths reversed.
        assert!(wire.contains("To-Path: msrp://a.example.com:7777/s1;tcp\r\n"));
        assert!(wire.contains("From-Path: msrp://b.example.com:8888/s2;tcp\r\n"));
        // No blank line before the end-line on bodiless chunks.
        assert!(wire.ends_with(";tcp\r\n-------abc123$\r\n"));
    }

    #[test]
    fn test_continuation_flags() {
        assert_eq!(ContinuationFlag::from_byte(b'$').unwrap(), ContinuationFlag::Complete);
        assert_eq!(
            ContinuationFlag::from_byte(b'+').unwrap(),
            ContinuationFlag::Continuation
        );
        assert_eq!(ContinuationFlag::from_byte(b'#').unwrap(), ContinuationFlag::Abort);
        assert!(ContinuationFlag::from_byte(b'!').is_err());
    }
}
