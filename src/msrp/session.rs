//! MSRP session over a reliable byte stream (RFC 4975 §5-§7).
//!
//! A session owns one connected stream (TCP or TLS — the caller
//! supplies whatever implements the tokio IO traits, so active and
//! passive setup differ only in who produced the stream). A reader
//! task deframes chunks, reassembles messages, answers transaction
//! responses and emits REPORTs; a writer task drains a bounded queue of
//! outgoing frames, which is where senders feel backpressure.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::MsrpConfig;

use super::message::{ByteRange, ContinuationFlag, MsrpKind, MsrpMessage, MsrpStatus};
use super::parser::{ChunkParser, Reassembler};
use super::uri::MsrpUri;
use super::MsrpError;

/// Outgoing frame queue depth; a full queue blocks the sender.
const SEND_QUEUE_DEPTH: usize = 32;

const EVENT_QUEUE_DEPTH: usize = 64;

/// How long a fragmented message may stall before it is dropped with a
/// 408 failure report.
const CHUNK_TIMEOUT: Duration = Duration::from_secs(30);

const EXPIRY_SWEEP_PERIOD: Duration = Duration::from_secs(5);

const READ_BUFFER_BYTES: usize = 8192;

/// Events delivered to the application from the reader task.
#[derive(Debug)]
pub enum MsrpSessionEvent {
    /// A complete (reassembled) incoming message.
    MessageReceived(MsrpMessage),
    /// An incoming REPORT matched to a sent message by Message-ID.
    ReportReceived {
        message_id: String,
        status_code: u16,
        status_text: String,
        bytes: u64,
    },
    /// The connection ended; no further events follow.
    Closed,
}

/// Which REPORTs the `Failure-Report` header asks for.
/// `partial` reports failures only and omits successes.
fn report_disposition(failure_report: Option<&str>) -> (bool, bool) {
    match failure_report {
        Some("no") => (false, false),
        Some("partial") => (false, true),
        _ => (true, true),
    }
}

/// A running MSRP session.
pub struct MsrpSession {
    local_uri: MsrpUri,
    peer_uri: MsrpUri,
    config: MsrpConfig,
    out_tx: mpsc::Sender<Vec<u8>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl MsrpSession {
    /// Start the reader and writer tasks over a connected stream.
    /// `local_uri` is this side's path element, `peer_uri` the remote
    /// one; incoming SENDs must carry them mirrored or are answered
    /// with 400.
    pub fn start<S>(
        stream: S,
        local_uri: MsrpUri,
        peer_uri: MsrpUri,
        config: MsrpConfig,
    ) -> (Self, mpsc::Receiver<MsrpSessionEvent>)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(SEND_QUEUE_DEPTH);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(err) = write_half.write_all(&frame).await {
                    tracing::debug!("MSRP write failed: {}", err);
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        let core = ReaderCore {
            local_uri: local_uri.clone(),
            peer_uri: peer_uri.clone(),
            out_tx: out_tx.clone(),
            event_tx,
            reassembler: Reassembler::new(config.max_message_bytes),
            max_message_bytes: config.max_message_bytes,
        };
        let max_message_bytes = config.max_message_bytes;
        let reader = tokio::spawn(read_loop(read_half, core, max_message_bytes));

        (
            Self {
                local_uri,
                peer_uri,
                config,
                out_tx,
                reader,
                writer,
            },
            event_rx,
        )
    }

    pub fn local_uri(&self) -> &MsrpUri {
        &self.local_uri
    }

    pub fn peer_uri(&self) -> &MsrpUri {
        &self.peer_uri
    }

    /// Send a complete message, fragmenting into chunks of the
    /// configured payload size. Returns the Message-ID for matching
    /// incoming REPORTs. Blocks (asynchronously) when the outgoing
    /// queue is full.
    pub async fn send_message(
        &self,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<String, MsrpError> {
        self.send_message_with_disposition(content_type, body, None, None)
            .await
    }

    /// As [`send_message`](Self::send_message) with explicit
    /// `Success-Report` / `Failure-Report` values.
    pub async fn send_message_with_disposition(
        &self,
        content_type: &str,
        body: Vec<u8>,
        success_report: Option<&str>,
        failure_report: Option<&str>,
    ) -> Result<String, MsrpError> {
        let message_id = uuid::Uuid::new_v4().simple().to_string();
        let total = body.len() as u64;
        let chunk_size = self.config.chunk_payload_bytes.max(1);

        let payloads: Vec<&[u8]> = if body.is_empty() {
            vec![&body[..]]
        } else {
            body.chunks(chunk_size).collect()
        };

        let mut offset = 0u64;
        let count = payloads.len();
        for (index, payload) in payloads.into_iter().enumerate() {
            let mut chunk =
                MsrpMessage::request("SEND", &uuid::Uuid::new_v4().simple().to_string());
            chunk.to_path = vec![self.peer_uri.clone()];
            chunk.from_path = vec![self.local_uri.clone()];
            chunk.message_id = Some(message_id.clone());
            chunk.success_report = success_report.map(str::to_string);
            chunk.failure_report = failure_report.map(str::to_string);
            chunk.byte_range = Some(ByteRange {
                start: offset + 1,
                end: Some(offset + payload.len() as u64),
                total: Some(total),
            });
            chunk.content_type = Some(content_type.to_string());
            chunk.body = Some(payload.to_vec());
            chunk.flag = if index + 1 == count {
                ContinuationFlag::Complete
            } else {
                ContinuationFlag::Continuation
            };
            offset += payload.len() as u64;

            self.out_tx
                .send(chunk.serialize())
                .await
                .map_err(|_| MsrpError::ConnectionClosed)?;
        }
        Ok(message_id)
    }

    /// Tear the session down; pending events end with `Closed` or the
    /// event channel closing.
    pub fn close(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl Drop for MsrpSession {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// State the reader task threads through chunk handling.
struct ReaderCore {
    local_uri: MsrpUri,
    peer_uri: MsrpUri,
    out_tx: mpsc::Sender<Vec<u8>>,
    event_tx: mpsc::Sender<MsrpSessionEvent>,
    reassembler: Reassembler,
    max_message_bytes: usize,
}

async fn read_loop<R>(mut read_half: R, mut core: ReaderCore, max_message_bytes: usize)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut parser = ChunkParser::new(max_message_bytes);
    let mut buf = vec![0u8; READ_BUFFER_BYTES];
    let mut sweep = tokio::time::interval(EXPIRY_SWEEP_PERIOD);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    'outer: loop {
        tokio::select! {
            read = read_half.read(&mut buf) => {
                let n = match read {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(err) => {
                        tracing::debug!("MSRP read failed: {}", err);
                        break;
                    }
                };
                match parser.feed(&buf[..n]) {
                    Ok(chunks) => {
                        for chunk in chunks {
                            if !core.handle_chunk(chunk).await {
                                break 'outer;
                            }
                        }
                    }
                    Err(MsrpError::MessageTooLarge) => {
                        // A single chunk overran the ceiling; tell the
                        // sender to stop, then drop the connection
                        // since the stream cannot be re-synchronized.
                        if let Some(tid) = parser.current_transaction() {
                            let mut response = MsrpMessage::request("", tid);
                            response.kind = MsrpKind::Response {
                                code: 413,
                                comment: "Stop Sending Message".to_string(),
                            };
                            response.to_path = vec![core.peer_uri.clone()];
                            response.from_path = vec![core.local_uri.clone()];
                            let _ = core.out_tx.send(response.serialize()).await;
                        }
                        break;
                    }
                    Err(err) => {
                        tracing::warn!("MSRP framing error, closing: {}", err);
                        break;
                    }
                }
            }
            _ = sweep.tick() => {
                for template in core.reassembler.expire(CHUNK_TIMEOUT) {
                    tracing::warn!(
                        "message {:?}: {}",
                        template.message_id,
                        MsrpError::ChunkTimeout
                    );
                    core.report_failure(&template, 408, "Request Timeout").await;
                }
            }
        }
    }
    let _ = core.event_tx.send(MsrpSessionEvent::Closed).await;
}

impl ReaderCore {
    /// Process one parsed chunk. Returns false when the session should
    /// stop (the application dropped the event receiver).
    async fn handle_chunk(&mut self, chunk: MsrpMessage) -> bool {
        let method = match &chunk.kind {
            MsrpKind::Response { code, .. } => {
                // Transaction responses to our own chunks need no
                // further routing; delivery state comes via REPORTs.
                tracing::debug!("MSRP {} response for {}", code, chunk.transaction_id);
                return true;
            }
            MsrpKind::Request(method) => method.clone(),
        };

        match method.as_str() {
            "SEND" => self.handle_send(chunk).await,
            "REPORT" => self.handle_report(chunk).await,
            other => {
                tracing::debug!("MSRP method {} not implemented", other);
                self.respond(&chunk, 501, "Not Implemented").await;
                true
            }
        }
    }

    /// Peer sessions must mirror our paths exactly.
    fn check_paths(&self, chunk: &MsrpMessage) -> Result<(), MsrpError> {
        if chunk.from_path.first() != Some(&self.peer_uri)
            || chunk.to_path.first() != Some(&self.local_uri)
        {
            return Err(MsrpError::PathMismatch);
        }
        Ok(())
    }

    async fn handle_send(&mut self, chunk: MsrpMessage) -> bool {
        let (send_success, send_failure) = report_disposition(chunk.failure_report.as_deref());
        let respond = chunk.failure_report.as_deref() != Some("no");

        if let Err(err) = self.check_paths(&chunk) {
            tracing::warn!("SEND rejected on session {}: {}", self.local_uri, err);
            if respond {
                self.respond(&chunk, 400, "Bad Request").await;
            }
            return true;
        }

        // A declared total over the ceiling is refused before any
        // bytes accumulate.
        let declared_total = chunk.byte_range.and_then(|r| r.total);
        if declared_total.is_some_and(|total| total as usize > self.max_message_bytes) {
            if respond {
                self.respond(&chunk, 413, "Stop Sending Message").await;
            }
            return true;
        }

        if respond {
            self.respond(&chunk, 200, "OK").await;
        }

        match self.reassembler.push(chunk.clone()) {
            Ok(Some(message)) => {
                if send_success {
                    let bytes = message.body.as_ref().map(|b| b.len() as u64).unwrap_or(0);
                    self.report(&message, 200, "OK", Some(bytes)).await;
                }
                self.event_tx
                    .send(MsrpSessionEvent::MessageReceived(message))
                    .await
                    .is_ok()
            }
            Ok(None) => true,
            Err(MsrpError::MessageTooLarge) => {
                if send_failure {
                    self.report_failure(&chunk, 413, "Stop Sending Message").await;
                }
                true
            }
            Err(err) => {
                tracing::warn!("reassembly error: {}", err);
                true
            }
        }
    }

    async fn handle_report(&mut self, chunk: MsrpMessage) -> bool {
        let (Some(message_id), Some(status)) = (chunk.message_id.clone(), chunk.status.clone())
        else {
            tracing::debug!("REPORT without Message-ID or Status");
            return true;
        };
        let bytes = chunk
            .byte_range
            .and_then(|r| r.total.or(r.end))
            .unwrap_or(0);
        self.event_tx
            .send(MsrpSessionEvent::ReportReceived {
                message_id,
                status_code: status.code,
                status_text: status.text,
                bytes,
            })
            .await
            .is_ok()
    }

    /// Transaction response for one chunk.
    async fn respond(&self, chunk: &MsrpMessage, code: u16, comment: &str) {
        let response = MsrpMessage::response_to(chunk, code, comment);
        if self.out_tx.send(response.serialize()).await.is_err() {
            tracing::debug!("writer gone, response {} dropped", code);
        }
    }

    /// Success REPORT for a delivered message.
    async fn report(&self, message: &MsrpMessage, code: u16, text: &str, bytes: Option<u64>) {
        let Some(report) = build_report(message, code, text, bytes) else {
            return;
        };
        let _ = self.out_tx.send(report.serialize()).await;
    }

    /// Failure REPORT referencing the message a chunk belongs to.
    async fn report_failure(&self, chunk: &MsrpMessage, code: u16, text: &str) {
        let Some(report) = build_report(chunk, code, text, None) else {
            return;
        };
        let _ = self.out_tx.send(report.serialize()).await;
    }
}

/// REPORT request for the message a chunk (or reassembled message)
/// belongs to. Paths run back toward the sender. `None` when the
/// source chunk carries no Message-ID.
fn build_report(source: &MsrpMessage, code: u16, text: &str, bytes: Option<u64>) -> Option<MsrpMessage> {
    let message_id = source.message_id.clone()?;
    let mut report = MsrpMessage::request(
        "REPORT",
        &uuid::Uuid::new_v4().simple().to_string(),
    );
    report.to_path = source.from_path.clone();
    report.from_path = source.to_path.clone();
    report.message_id = Some(message_id);
    report.status = Some(MsrpStatus {
        code,
        text: text.to_string(),
    });
    if let Some(bytes) = bytes {
        report.byte_range = Some(ByteRange::whole(bytes));
    }
    Some(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::{self, cpim::CpimAddress, cpim::CpimMessage, BodyPart, PartContent};
    use tokio::io::{duplex, split};
    use tokio::time::timeout;

    fn alice_uri() -> MsrpUri {
        MsrpUri::new("alice.example.com", 7777, "sa39xw")
    }

    fn bob_uri() -> MsrpUri {
        MsrpUri::new("bob.example.gov", 8888, "sb81kd")
    }

    async fn next_event(rx: &mut mpsc::Receiver<MsrpSessionEvent>) -> MsrpSessionEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event timeout")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_multipart_message_delivery_and_report() {
        let (a, b) = duplex(256 * 1024);
        let (alice, mut alice_events) =
            MsrpSession::start(a, alice_uri(), bob_uri(), MsrpConfig::default());
        let (_bob, mut bob_events) =
            MsrpSession::start(b, bob_uri(), alice_uri(), MsrpConfig::default());

        // CPIM text part plus a binary JPEG part, as an NG9-1-1 MMS
        // relay would send it.
        let cpim = CpimMessage::text(
            CpimAddress::new("im:caller@example.com"),
            CpimAddress::new("im:psap@example.gov"),
            "Here is a picture of my car crash",
        );
        let jpeg: Vec<u8> = (0..47_382u32).map(|i| (i % 251) as u8).collect();
        let parts = vec![
            BodyPart::text(
                "message/cpim",
                &String::from_utf8(cpim.build()).unwrap(),
            ),
            BodyPart::binary("image/jpeg", jpeg.clone()),
        ];
        let body_bytes = body::build(&parts, "mix1");

        let message_id = alice
            .send_message("multipart/mixed;boundary=mix1", body_bytes)
            .await
            .unwrap();

        // Bob reassembles the fragmented message and parses both parts.
        let event = next_event(&mut bob_events).await;
        let MsrpSessionEvent::MessageReceived(message) = event else {
            panic!("expected MessageReceived");
        };
        assert_eq!(
            message.content_type.as_deref(),
            Some("multipart/mixed;boundary=mix1")
        );
        let received = body::parse(
            message.body.as_deref().unwrap(),
            message.content_type.as_deref().unwrap(),
        )
        .unwrap();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].content_type, "message/cpim");
        match &received[1].content {
            PartContent::Binary(bytes) => assert_eq!(bytes, &jpeg),
            other => panic!("expected binary jpeg, got {:?}", other),
        }

        // Alice gets the 200 REPORT matched by Message-ID.
        let event = next_event(&mut alice_events).await;
        let MsrpSessionEvent::ReportReceived {
            message_id: reported,
            status_code,
            bytes,
            ..
        } = event
        else {
            panic!("expected ReportReceived");
        };
        assert_eq!(reported, message_id);
        assert_eq!(status_code, 200);
        assert!(bytes > 47_382);
    }

    #[tokio::test]
    async fn test_path_mismatch_answered_with_400() {
        let (raw, s) = duplex(64 * 1024);
        let (_session, _events) =
            MsrpSession::start(s, bob_uri(), alice_uri(), MsrpConfig::default());
        let (mut raw_read, mut raw_write) = split(raw);

        let mut bad = MsrpMessage::request("SEND", "tid400");
        bad.to_path = vec![bob_uri()];
        bad.from_path = vec![MsrpUri::new("mallory.example.com", 9999, "zz")];
        bad.message_id = Some("m400".to_string());
        bad.content_type = Some("text/plain".to_string());
        bad.body = Some(b"spoof".to_vec());
        raw_write.write_all(&bad.serialize()).await.unwrap();

        let mut parser = ChunkParser::new(1024 * 1024);
        let mut buf = [0u8; 4096];
        let response = loop {
            let n = raw_read.read(&mut buf).await.unwrap();
            let chunks = parser.feed(&buf[..n]).unwrap();
            if let Some(chunk) = chunks.into_iter().next() {
                break chunk;
            }
        };
        assert_eq!(response.status_code(), Some(400));
        assert_eq!(response.transaction_id, "tid400");
    }

    #[tokio::test]
    async fn test_unknown_method_answered_with_501() {
        let (raw, s) = duplex(64 * 1024);
        let (_session, _events) =
            MsrpSession::start(s, bob_uri(), alice_uri(), MsrpConfig::default());
        let (mut raw_read, mut raw_write) = split(raw);

        let mut auth = MsrpMessage::request("AUTH", "tid501");
        auth.to_path = vec![bob_uri()];
        auth.from_path = vec![alice_uri()];
        raw_write.write_all(&auth.serialize()).await.unwrap();

        let mut parser = ChunkParser::new(1024 * 1024);
        let mut buf = [0u8; 4096];
        let response = loop {
            let n = raw_read.read(&mut buf).await.unwrap();
            let chunks = parser.feed(&buf[..n]).unwrap();
            if let Some(chunk) = chunks.into_iter().next() {
                break chunk;
            }
        };
        assert_eq!(response.status_code(), Some(501));
    }

    #[tokio::test]
    async fn test_failure_report_no_suppresses_traffic() {
        let (raw, s) = duplex(64 * 1024);
        let (_session, mut events) =
            MsrpSession::start(s, bob_uri(), alice_uri(), MsrpConfig::default());
        let (mut raw_read, mut raw_write) = split(raw);

        let mut quiet = MsrpMessage::request("SEND", "tidquiet");
        quiet.to_path = vec![bob_uri()];
        quiet.from_path = vec![alice_uri()];
        quiet.message_id = Some("mq".to_string());
        quiet.failure_report = Some("no".to_string());
        quiet.content_type = Some("text/plain".to_string());
        quiet.body = Some(b"silent delivery".to_vec());
        raw_write.write_all(&quiet.serialize()).await.unwrap();

        // The message is still delivered to the application.
        let event = next_event(&mut events).await;
        assert!(matches!(event, MsrpSessionEvent::MessageReceived(_)));

        // But no response and no REPORT come back.
        let mut buf = [0u8; 1024];
        let read = timeout(Duration::from_millis(300), raw_read.read(&mut buf)).await;
        assert!(read.is_err(), "expected silence on the wire");
    }

    #[tokio::test]
    async fn test_oversized_message_refused_with_413() {
        let (raw, s) = duplex(1024 * 1024);
        let config = MsrpConfig {
            max_message_bytes: 1024,
            ..Default::default()
        };
        let (_session, mut events) = MsrpSession::start(s, bob_uri(), alice_uri(), config);
        let (mut raw_read, mut raw_write) = split(raw);

        let mut monster = MsrpMessage::request("SEND", "tidbig");
        monster.to_path = vec![bob_uri()];
        monster.from_path = vec![alice_uri()];
        monster.message_id = Some("mb".to_string());
        monster.byte_range = Some(ByteRange::whole(8 * 1024));
        monster.content_type = Some("application/octet-stream".to_string());
        monster.body = Some(vec![0xAB; 8 * 1024]);
        raw_write.write_all(&monster.serialize()).await.unwrap();

        let mut parser = ChunkParser::new(10 * 1024 * 1024);
        let mut buf = [0u8; 4096];
        let response = loop {
            let n = raw_read.read(&mut buf).await.unwrap();
            let chunks = parser.feed(&buf[..n]).unwrap();
            if let Some(chunk) = chunks.into_iter().next() {
                break chunk;
            }
        };
        assert_eq!(response.status_code(), Some(413));
        assert_eq!(response.transaction_id, "tidbig");

        // The session survives and still delivers well-sized messages.
        let mut small = MsrpMessage::request("SEND", "tidok");
        small.to_path = vec![bob_uri()];
        small.from_path = vec![alice_uri()];
        small.message_id = Some("ms".to_string());
        small.content_type = Some("text/plain".to_string());
        small.body = Some(b"ok".to_vec());
        raw_write.write_all(&small.serialize()).await.unwrap();

        let event = next_event(&mut events).await;
        assert!(matches!(event, MsrpSessionEvent::MessageReceived(_)));
    }

    #[tokio::test]
    async fn test_fragmentation_respects_chunk_size() {
        let (a, b) = duplex(256 * 1024);
        let config = MsrpConfig {
            chunk_payload_bytes: 16,
            ..Default::default()
        };
        let (alice, _alice_events) =
            MsrpSession::start(a, alice_uri(), bob_uri(), config.clone());
        let (_bob, mut bob_events) =
            MsrpSession::start(b, bob_uri(), alice_uri(), MsrpConfig::default());

        alice
            .send_message("text/plain", b"0123456789abcdefABCDEF0123456789!!".to_vec())
            .await
            .unwrap();

        let event = next_event(&mut bob_events).await;
        let MsrpSessionEvent::MessageReceived(message) = event else {
            panic!("expected MessageReceived");
        };
        assert_eq!(
            message.body.as_deref(),
            Some(b"0123456789abcdefABCDEF0123456789!!".as_slice())
        );
        assert_eq!(message.byte_range, Some(ByteRange::whole(34)));
    }
}
