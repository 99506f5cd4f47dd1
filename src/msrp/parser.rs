//! Incremental MSRP chunk parser and message reassembly (RFC 4975 §7).
//!
//! [`ChunkParser`] is fed raw stream bytes and yields complete chunks;
//! it holds at most one partial chunk of buffered data and never copies
//! the body through a string. [`Reassembler`] merges SEND chunks by
//! `Message-ID` until a `$` end-line completes the message, dropping
//! aborted messages and enforcing the configured size ceiling.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::message::{ByteRange, ContinuationFlag, MsrpKind, MsrpMessage, MsrpStatus};
use super::uri::MsrpUri;
use super::MsrpError;

/// Extra buffered bytes allowed beyond the message ceiling before the
/// parser gives up on finding an end-line.
const CHUNK_OVERHEAD_SLACK: usize = 16 * 1024;

fn find_bytes(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() || from > haystack.len() - needle.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Byte-stream state machine producing complete MSRP chunks.
pub struct ChunkParser {
    buffer: Vec<u8>,
    max_message_bytes: usize,
    /// Transaction id of the chunk currently being buffered, once its
    /// start line has been seen.
    current_transaction: Option<String>,
}

impl ChunkParser {
    pub fn new(max_message_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_message_bytes,
            current_transaction: None,
        }
    }

    /// Transaction id of the partially buffered chunk, used to answer
    /// 413 when a single chunk overruns the ceiling.
    pub fn current_transaction(&self) -> Option<&str> {
        self.current_transaction.as_deref()
    }

    /// Consume stream bytes, returning every chunk completed by them.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<MsrpMessage>, MsrpError> {
        self.buffer.extend_from_slice(data);
        let mut chunks = Vec::new();
        while let Some(chunk) = self.try_parse_one()? {
            chunks.push(chunk);
        }
        Ok(chunks)
    }

    fn try_parse_one(&mut self) -> Result<Option<MsrpMessage>, MsrpError> {
        let Some(start_end) = find_bytes(&self.buffer, b"\r\n", 0) else {
            self.check_ceiling()?;
            return Ok(None);
        };

        let start_line = std::str::from_utf8(&self.buffer[..start_end])
            .map_err(|_| MsrpError::MalformedMsrp("start line is not UTF-8"))?;
        let (transaction_id, kind) = parse_start_line(start_line)?;
        self.current_transaction = Some(transaction_id.clone());

        // End-line: CRLF "-------" transaction-id flag CRLF.
        let mut marker = b"\r\n-------".to_vec();
        marker.extend_from_slice(transaction_id.as_bytes());
        let Some(marker_pos) = find_bytes(&self.buffer, &marker, start_end) else {
            self.check_ceiling()?;
            return Ok(None);
        };
        let flag_pos = marker_pos + marker.len();
        if self.buffer.len() < flag_pos + 3 {
            return Ok(None);
        }
        let flag = ContinuationFlag::from_byte(self.buffer[flag_pos])?;
        if &self.buffer[flag_pos + 1..flag_pos + 3] != b"\r\n" {
            return Err(MsrpError::MalformedMsrp("end-line not CRLF-terminated"));
        }

        let region = &self.buffer[start_end + 2..marker_pos];
        let chunk = parse_chunk(transaction_id, kind, flag, region)?;

        self.buffer.drain(..flag_pos + 3);
        self.current_transaction = None;
        Ok(Some(chunk))
    }

    fn check_ceiling(&self) -> Result<(), MsrpError> {
        if self.buffer.len() > self.max_message_bytes + CHUNK_OVERHEAD_SLACK {
            return Err(MsrpError::MessageTooLarge);
        }
        Ok(())
    }
}

fn parse_start_line(line: &str) -> Result<(String, MsrpKind), MsrpError> {
    let rest = line
        .strip_prefix("MSRP ")
        .ok_or(MsrpError::MalformedMsrp("chunk does not start with MSRP"))?;
    let (transaction_id, tail) = rest
        .split_once(' ')
        .ok_or(MsrpError::MalformedMsrp("start line has no method"))?;
    if transaction_id.is_empty() {
        return Err(MsrpError::MalformedMsrp("empty transaction id"));
    }

    // A leading digit means a response status; methods are alphabetic.
    let kind = if tail.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        let (code, comment) = match tail.split_once(' ') {
            Some((code, comment)) => (code, comment),
            None => (tail, ""),
        };
        MsrpKind::Response {
            code: code
                .parse()
                .map_err(|_| MsrpError::MalformedMsrp("bad response code"))?,
            comment: comment.to_string(),
        }
    } else {
        MsrpKind::Request(tail.to_string())
    };
    Ok((transaction_id.to_string(), kind))
}

/// Parse the header block (and body, if a blank line is present) of one
/// chunk whose framing has already been located.
fn parse_chunk(
    transaction_id: String,
    kind: MsrpKind,
    flag: ContinuationFlag,
    region: &[u8],
) -> Result<MsrpMessage, MsrpError> {
    let (header_bytes, body) = match find_bytes(region, b"\r\n\r\n", 0) {
        Some(pos) => (&region[..pos], Some(region[pos + 4..].to_vec())),
        None => (region, None),
    };
    let headers = std::str::from_utf8(header_bytes)
        .map_err(|_| MsrpError::MalformedMsrp("headers are not UTF-8"))?;

    let mut chunk = MsrpMessage {
        transaction_id,
        kind,
        to_path: Vec::new(),
        from_path: Vec::new(),
        message_id: None,
        byte_range: None,
        success_report: None,
        failure_report: None,
        status: None,
        content_type: None,
        body,
        flag,
    };

    for line in headers.split("\r\n").filter(|l| !l.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or(MsrpError::MalformedMsrp("header line has no colon"))?;
        let value = value.trim();
        match name.trim() {
            "To-Path" => chunk.to_path = parse_path(value)?,
            "From-Path" => chunk.from_path = parse_path(value)?,
            "Message-ID" => chunk.message_id = Some(value.to_string()),
            "Byte-Range" => chunk.byte_range = Some(ByteRange::parse(value)?),
            "Success-Report" => chunk.success_report = Some(value.to_string()),
            "Failure-Report" => chunk.failure_report = Some(value.to_string()),
            "Status" => chunk.status = Some(MsrpStatus::parse(value)?),
            "Content-Type" => chunk.content_type = Some(value.to_string()),
            _ => {}
        }
    }

    if chunk.to_path.is_empty() || chunk.from_path.is_empty() {
        return Err(MsrpError::MalformedMsrp("chunk lacks To-Path or From-Path"));
    }
    Ok(chunk)
}

fn parse_path(value: &str) -> Result<Vec<MsrpUri>, MsrpError> {
    value
        .split_whitespace()
        .map(MsrpUri::parse)
        .collect::<Result<Vec<_>, _>>()
}

/// In-progress message being merged from chunks.
struct PartialMessage {
    template: MsrpMessage,
    body: Vec<u8>,
    last_chunk_at: Instant,
}

/// Merges SEND chunks into complete messages by `Message-ID`.
pub struct Reassembler {
    max_message_bytes: usize,
    partial: HashMap<String, PartialMessage>,
}

impl Reassembler {
    pub fn new(max_message_bytes: usize) -> Self {
        Self {
            max_message_bytes,
            partial: HashMap::new(),
        }
    }

    /// Merge one SEND chunk. Returns the complete message when its `$`
    /// chunk arrives; `None` while more chunks are pending or when the
    /// sender aborted.
    pub fn push(&mut self, chunk: MsrpMessage) -> Result<Option<MsrpMessage>, MsrpError> {
        let Some(message_id) = chunk.message_id.clone() else {
            // A SEND without Message-ID cannot be reassembled; treat a
            // complete chunk as a complete message.
            return Ok(match chunk.flag {
                ContinuationFlag::Complete => Some(chunk),
                _ => None,
            });
        };

        let body = chunk.body.clone().unwrap_or_default();
        let entry = self
            .partial
            .entry(message_id.clone())
            .or_insert_with(|| PartialMessage {
                template: chunk.clone(),
                body: Vec::new(),
                last_chunk_at: Instant::now(),
            });
        entry.body.extend_from_slice(&body);
        entry.last_chunk_at = Instant::now();

        if entry.body.len() > self.max_message_bytes {
            self.partial.remove(&message_id);
            return Err(MsrpError::MessageTooLarge);
        }

        match chunk.flag {
            ContinuationFlag::Continuation => Ok(None),
            ContinuationFlag::Abort => {
                self.partial.remove(&message_id);
                tracing::debug!("message {} aborted by sender", message_id);
                Ok(None)
            }
            ContinuationFlag::Complete => {
                let partial = self.partial.remove(&message_id).expect("entry exists");
                let total = partial.body.len() as u64;
                let mut message = partial.template;
                message.body = Some(partial.body);
                message.byte_range = Some(ByteRange::whole(total));
                message.flag = ContinuationFlag::Complete;
                Ok(Some(message))
            }
        }
    }

    /// Number of messages still awaiting their final chunk.
    pub fn pending(&self) -> usize {
        self.partial.len()
    }

    /// Drop partial messages whose last chunk is older than `max_age`,
    /// returning their first-chunk templates so the session can emit
    /// 408 failure reports.
    pub fn expire(&mut self, max_age: Duration) -> Vec<MsrpMessage> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .partial
            .iter()
            .filter(|(_, p)| now.duration_since(p.last_chunk_at) > max_age)
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.partial.remove(&id))
            .map(|p| p.template)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msrp::message::MsrpMessage;

    fn send_chunk(tid: &str, message_id: &str, body: &[u8], flag: ContinuationFlag) -> Vec<u8> {
        let mut chunk = MsrpMessage::request("SEND", tid);
        chunk.to_path = vec![MsrpUri::new("b.example.com", 8888, "sb")];
        chunk.from_path = vec![MsrpUri::new("a.example.com", 7777, "sa")];
        chunk.message_id = Some(message_id.to_string());
        chunk.content_type = Some("text/plain".to_string());
        chunk.body = Some(body.to_vec());
        chunk.flag = flag;
        chunk.serialize()
    }

    #[test]
    fn test_parse_single_chunk() {
        let mut parser = ChunkParser::new(1024);
        let wire = send_chunk("t1", "m1", b"hello", ContinuationFlag::Complete);
        let chunks = parser.feed(&wire).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].method(), Some("SEND"));
        assert_eq!(chunks[0].body.as_deref(), Some(b"hello".as_slice()));
        assert_eq!(chunks[0].flag, ContinuationFlag::Complete);
    }

    #[test]
    fn test_parse_byte_by_byte() {
        let mut parser = ChunkParser::new(1024);
        let wire = send_chunk("t2", "m2", b"dripped", ContinuationFlag::Complete);
        let mut chunks = Vec::new();
        for byte in wire {
            chunks.extend(parser.feed(&[byte]).unwrap());
        }
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].body.as_deref(), Some(b"dripped".as_slice()));
    }

    #[test]
    fn test_parse_two_chunks_in_one_read() {
        let mut parser = ChunkParser::new(1024);
        let mut wire = send_chunk("t3", "m3", b"one", ContinuationFlag::Complete);
        wire.extend(send_chunk("t4", "m4", b"two", ContinuationFlag::Complete));
        let chunks = parser.feed(&wire).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].message_id.as_deref(), Some("m4"));
    }

    #[test]
    fn test_parse_bodiless_response() {
        let mut request = MsrpMessage::request("SEND", "t5");
        request.to_path = vec![MsrpUri::new("b", 1, "x")];
        request.from_path = vec![MsrpUri::new("a", 2, "y")];
        let response = MsrpMessage::response_to(&request, 200, "OK");

        let mut parser = ChunkParser::new(1024);
        let chunks = parser.feed(&response.serialize()).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].status_code(), Some(200));
        assert!(chunks[0].body.is_none());
    }

    #[test]
    fn test_binary_body_with_crlf_pairs() {
        let mut body = vec![0xFF, 0xD8];
        body.extend_from_slice(b"\r\n\r\n--------\r\n");
        body.extend([0u8, 1, 2, 254, 255]);
        let mut parser = ChunkParser::new(4096);
        let wire = send_chunk("t6", "m6", &body, ContinuationFlag::Complete);
        let chunks = parser.feed(&wire).unwrap();
        assert_eq!(chunks[0].body.as_deref(), Some(body.as_slice()));
    }

    #[test]
    fn test_oversized_buffer_rejected() {
        let mut parser = ChunkParser::new(64);
        // A chunk that never ends, larger than ceiling + slack.
        let mut wire = b"MSRP huge SEND\r\nTo-Path: msrp://b:1/x;tcp\r\nFrom-Path: msrp://a:2/y;tcp\r\n\r\n".to_vec();
        wire.extend(std::iter::repeat(b'x').take(64 + CHUNK_OVERHEAD_SLACK + 1));
        let err = parser.feed(&wire).unwrap_err();
        assert_eq!(err, MsrpError::MessageTooLarge);
        assert_eq!(parser.current_transaction(), Some("huge"));
    }

    #[test]
    fn test_malformed_start_line() {
        let mut parser = ChunkParser::new(1024);
        let err = parser.feed(b"HTTP/1.1 200 OK\r\n\r\n").unwrap_err();
        assert!(matches!(err, MsrpError::MalformedMsrp(_)));
    }

    #[test]
    fn test_reassembles_fragmented_message() {
        let mut parser = ChunkParser::new(1024);
        let mut reassembler = Reassembler::new(1024);

        let mut wire = send_chunk("f1", "msg", b"Hello", ContinuationFlag::Continuation);
        wire.extend(send_chunk("f2", "msg", b", my", ContinuationFlag::Continuation));
        wire.extend(send_chunk("f3", "msg", b" friend", ContinuationFlag::Complete));

        let mut complete = Vec::new();
        for chunk in parser.feed(&wire).unwrap() {
            if let Some(message) = reassembler.push(chunk).unwrap() {
                complete.push(message);
            }
        }
        assert_eq!(complete.len(), 1);
        assert_eq!(
            complete[0].body.as_deref(),
            Some(b"Hello, my friend".as_slice())
        );
        assert_eq!(complete[0].byte_range, Some(ByteRange::whole(16)));
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn test_abort_discards_partial() {
        let mut parser = ChunkParser::new(1024);
        let mut reassembler = Reassembler::new(1024);

        let mut wire = send_chunk("a1", "doomed", b"part", ContinuationFlag::Continuation);
        wire.extend(send_chunk("a2", "doomed", b"", ContinuationFlag::Abort));
        for chunk in parser.feed(&wire).unwrap() {
            assert!(reassembler.push(chunk).unwrap().is_none());
        }
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn test_reassembly_size_ceiling() {
        let mut reassembler = Reassembler::new(8);
        let mut parser = ChunkParser::new(1024);
        let wire = send_chunk("b1", "big", b"0123456789", ContinuationFlag::Complete);
        let chunk = parser.feed(&wire).unwrap().remove(0);
        assert_eq!(reassembler.push(chunk), Err(MsrpError::MessageTooLarge));
    }
}
