//! SIP transaction layer (RFC 3261 §17) and digest authentication.
//!
//! [`message`] holds the message model and builders, [`engine`] the
//! transaction table and dispatcher, [`transaction`] the shared record
//! the four state machines in `client`/`server` mutate.

mod client;
mod server;

pub mod digest;
pub mod engine;
pub mod message;
pub mod transaction;

pub use engine::{ClientTransaction, EngineStats, ServerTransaction, TransactionEngine};
pub use message::{
    build_ack, build_cancel, generate_branch, SipMessage, SipParseError, StartLine, TransactionKey,
};
pub use transaction::{
    SipTransport, TerminationReason, TransactionKind, TransactionOutcome, TransactionState,
};
