//! Shared transaction record, states and termination reasons
//! (RFC 3261 §17).
//!
//! The four state machines are variants of one tagged record; client.rs
//! and server.rs hold the transition logic and this module holds the
//! data they mutate. Every mutation happens under the transaction's
//! mutex; transitions emit [`Action`]s that the engine executes after
//! the lock is released, so application callbacks can never re-enter a
//! locked transaction.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use super::message::SipMessage;

/// Transaction machine flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    ClientInvite,
    ClientNonInvite,
    ServerInvite,
    ServerNonInvite,
}

/// RFC 3261 §17 states, shared by all four machines. `ForceTerminated`
/// marks a client INVITE whose CANCEL could not be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Calling,
    Trying,
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
    ForceTerminated,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Terminated | TransactionState::ForceTerminated
        )
    }
}

/// Why a transaction reached a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// A 2xx final response was seen (client) or sent (server).
    OkReceived,
    /// A 3xx-6xx final response was seen (client) or sent and
    /// acknowledged (server).
    FinalResponseReceived,
    /// Timer B fired with no response at all.
    NoResponseReceived,
    /// A provisional response arrived but no final response before
    /// Timer F.
    NoFinalResponseReceived,
    /// The transport reported a send failure.
    ConnectionFailure,
    /// Timer H fired while waiting for the ACK to a final response.
    AckToFinalResponseNotReceived,
    /// The CANCEL transaction spawned by `cancel()` itself failed.
    CancelRequestFailed,
}

/// Completion report delivered exactly once per transaction, through
/// both the registered callbacks and the one-shot future.
#[derive(Debug, Clone)]
pub struct TransactionOutcome {
    pub reason: TerminationReason,
    /// The final response, when one was received (client) or sent
    /// (server).
    pub final_response: Option<SipMessage>,
}

/// Message transport below the transaction layer. Implementations wrap
/// a UDP socket or a connected stream; the engine only needs to send
/// and to know whether retransmission timers apply.
pub trait SipTransport: Send + Sync {
    fn send(&self, message: &SipMessage, remote: SocketAddr) -> std::io::Result<()>;
    /// True for TCP/TLS; suppresses the UDP-only timers.
    fn is_reliable(&self) -> bool;
}

pub type CompletionCallback = Box<dyn FnOnce(&TransactionOutcome) + Send>;
pub type ProvisionalCallback = std::sync::Arc<dyn Fn(&SipMessage) + Send + Sync>;

/// Deferred effect of a state transition, executed outside the lock.
pub(crate) enum Action {
    /// Transmit a message to the transaction's remote endpoint.
    Send(SipMessage),
    /// Deliver a provisional response to the registered callbacks.
    Provisional(SipMessage),
    /// Fire the completion callbacks and the one-shot future. The
    /// payload was already taken from the record under the lock, which
    /// is what makes the exactly-once guarantee hold.
    Complete {
        sender: Option<oneshot::Sender<TransactionOutcome>>,
        callbacks: Vec<CompletionCallback>,
        outcome: TransactionOutcome,
    },
    /// Spawn the CANCEL client transaction for this INVITE.
    SpawnCancel(SipMessage),
}

/// The mutable record every machine variant shares.
pub(crate) struct TransactionInner {
    pub kind: TransactionKind,
    pub state: TransactionState,
    pub request: SipMessage,
    pub remote: SocketAddr,
    pub reliable: bool,
    /// Client: last final response received. Server: last response sent.
    pub last_response: Option<SipMessage>,
    /// Client INVITE: the ACK most recently sent, replayed on response
    /// retransmissions.
    pub last_ack: Option<SipMessage>,
    pub reason: Option<TerminationReason>,
    /// Snapshot of the completion report, for callbacks registered
    /// after the transaction already completed.
    pub outcome: Option<TransactionOutcome>,

    pub completion_tx: Option<oneshot::Sender<TransactionOutcome>>,
    pub completion_callbacks: Vec<CompletionCallback>,
    pub provisional_callbacks: Vec<ProvisionalCallback>,

    /// Next request/response retransmission (Timer A/E/G), UDP only.
    pub retransmit_at: Option<Instant>,
    pub retransmit_interval: Duration,
    /// Overall deadline (Timer B/F/H).
    pub timeout_at: Option<Instant>,
    /// Absorption linger (Timer D/K/I/J).
    pub linger_at: Option<Instant>,
    /// Copies of the request put on the wire (client machines).
    pub transmit_count: u32,
}

impl TransactionInner {
    pub fn new(
        kind: TransactionKind,
        request: SipMessage,
        remote: SocketAddr,
        reliable: bool,
        completion_tx: oneshot::Sender<TransactionOutcome>,
    ) -> Self {
        Self {
            kind,
            state: match kind {
                TransactionKind::ClientInvite => TransactionState::Calling,
                TransactionKind::ClientNonInvite | TransactionKind::ServerNonInvite => {
                    TransactionState::Trying
                }
                TransactionKind::ServerInvite => TransactionState::Proceeding,
            },
            request,
            remote,
            reliable,
            last_response: None,
            last_ack: None,
            reason: None,
            outcome: None,
            completion_tx: Some(completion_tx),
            completion_callbacks: Vec::new(),
            provisional_callbacks: Vec::new(),
            retransmit_at: None,
            retransmit_interval: Duration::ZERO,
            timeout_at: None,
            linger_at: None,
            transmit_count: 0,
        }
    }

    /// Move to a terminal state and emit the exactly-once completion.
    /// Subsequent calls only change the state: the completion payload
    /// is gone after the first.
    pub fn terminate(
        &mut self,
        state: TransactionState,
        reason: TerminationReason,
        final_response: Option<SipMessage>,
        actions: &mut Vec<Action>,
    ) {
        self.state = state;
        self.retransmit_at = None;
        self.timeout_at = None;
        self.linger_at = None;
        self.complete(reason, final_response, actions);
    }

    /// Emit the completion report without leaving the current state
    /// (used when `Completed` lingers to absorb retransmissions).
    pub fn complete(
        &mut self,
        reason: TerminationReason,
        final_response: Option<SipMessage>,
        actions: &mut Vec<Action>,
    ) {
        if self.reason.is_none() {
            self.reason = Some(reason);
        }
        let sender = self.completion_tx.take();
        let callbacks = std::mem::take(&mut self.completion_callbacks);
        if sender.is_none() && callbacks.is_empty() {
            return;
        }
        let outcome = TransactionOutcome {
            reason,
            final_response,
        };
        self.outcome = Some(outcome.clone());
        actions.push(Action::Complete {
            sender,
            callbacks,
            outcome,
        });
    }

    /// Arm the first retransmission timer (UDP only).
    pub fn arm_retransmit(&mut self, now: Instant, initial: Duration) {
        if self.reliable {
            return;
        }
        self.retransmit_interval = initial;
        self.retransmit_at = Some(now + initial);
    }

    /// Double the retransmission interval, optionally capping at T2.
    pub fn backoff_retransmit(&mut self, now: Instant, cap: Option<Duration>) {
        let mut next = self.retransmit_interval * 2;
        if let Some(cap) = cap {
            next = next.min(cap);
        }
        self.retransmit_interval = next;
        self.retransmit_at = Some(now + next);
    }
}
