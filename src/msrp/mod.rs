//! MSRP: chunk framing, reassembly and session transport (RFC 4975).
//!
//! [`uri`] and [`message`] model the wire format, [`parser`] turns a
//! byte stream into chunks and chunks into messages, and [`session`]
//! runs the reader/writer loops over a reliable stream with REPORT
//! generation and matching.

pub mod message;
pub mod parser;
pub mod session;
pub mod uri;

use thiserror::Error;

pub use message::{ByteRange, ContinuationFlag, MsrpKind, MsrpMessage, MsrpStatus};
pub use parser::{ChunkParser, Reassembler};
pub use session::{MsrpSession, MsrpSessionEvent};
pub use uri::MsrpUri;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MsrpError {
    #[error("malformed MSRP chunk: {0}")]
    MalformedMsrp(&'static str),
    /// A message (or a single runaway chunk) exceeded the configured
    /// ceiling; surfaced to the peer as a 413.
    #[error("message exceeds the configured size limit")]
    MessageTooLarge,
    /// A fragmented message stalled; surfaced to the peer as a 408.
    #[error("timed out waiting for a continuation chunk")]
    ChunkTimeout,
    /// A SEND arrived with paths that do not match the session;
    /// surfaced to the peer as a 400.
    #[error("chunk paths do not match the session")]
    PathMismatch,
    #[error("session is closed")]
    ConnectionClosed,
}
