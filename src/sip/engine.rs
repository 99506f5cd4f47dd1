//! Transaction engine: table, dispatcher and timer driver.
//!
//! One engine serves one transport (UDP socket or connected stream).
//! Inbound messages go through [`TransactionEngine::receive`]; matched
//! messages are fed to their transaction under its lock, unmatched
//! requests spawn server transactions through the registered request
//! handler, and unmatched responses are dropped with a counter bump. A
//! tokio ticker drives `do_timed_events` on every live transaction well
//! under the 100 ms period the timer model assumes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::config::SipTimers;

use super::client;
use super::message::{SipMessage, SipParseError, TransactionKey};
use super::server;
use super::transaction::{
    Action, CompletionCallback, ProvisionalCallback, SipTransport, TerminationReason,
    TransactionInner, TransactionKind, TransactionOutcome, TransactionState,
};

/// Methods the dispatcher will spawn server transactions for.
const SUPPORTED_METHODS: &[&str] = &[
    "INVITE", "ACK", "CANCEL", "BYE", "OPTIONS", "MESSAGE", "INFO", "UPDATE",
];

/// Supplies the initial response for an unmatched incoming request.
/// Returning `None` declines the request; no transaction is created.
pub type RequestHandler =
    Box<dyn Fn(&SipMessage, SocketAddr) -> Option<SipMessage> + Send + Sync>;

/// Receives the handle of every server transaction the dispatcher
/// spawns, so the application can send later responses.
pub type ServerTransactionHandler = Box<dyn Fn(ServerTransaction) + Send + Sync>;

/// Ticker period; comfortably under the 100 ms bound.
const TICK_PERIOD: Duration = Duration::from_millis(50);

pub(crate) struct TransactionHandle {
    key: TransactionKey,
    kind: TransactionKind,
    remote: SocketAddr,
    inner: Mutex<TransactionInner>,
}

/// Engine-level drop counters.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    /// Responses with no matching client transaction.
    pub stray_responses: u64,
    /// Requests declined, unsupported or unparseable at dispatch.
    pub dropped_requests: u64,
    /// Byte blobs that failed SIP parsing.
    pub parse_failures: u64,
    pub active_transactions: usize,
}

struct EngineShared {
    timers: SipTimers,
    transport: Arc<dyn SipTransport>,
    table: Mutex<HashMap<TransactionKey, Arc<TransactionHandle>>>,
    request_handler: Mutex<Option<RequestHandler>>,
    transaction_handler: Mutex<Option<ServerTransactionHandler>>,
    stray_responses: AtomicU64,
    dropped_requests: AtomicU64,
    parse_failures: AtomicU64,
    shutdown: AtomicBool,
}

/// The transaction engine. Cheap to clone; clones share one table.
#[derive(Clone)]
pub struct TransactionEngine {
    shared: Arc<EngineShared>,
}

impl TransactionEngine {
    pub fn new(transport: Arc<dyn SipTransport>, timers: SipTimers) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                timers,
                transport,
                table: Mutex::new(HashMap::new()),
                request_handler: Mutex::new(None),
                transaction_handler: Mutex::new(None),
                stray_responses: AtomicU64::new(0),
                dropped_requests: AtomicU64::new(0),
                parse_failures: AtomicU64::new(0),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Register the handler that answers unmatched incoming requests
    /// with their initial response.
    pub fn set_request_handler(&self, handler: RequestHandler) {
        *self.shared.request_handler.lock().unwrap() = Some(handler);
    }

    /// Register the sink for dispatcher-spawned server transactions.
    pub fn set_server_transaction_handler(&self, handler: ServerTransactionHandler) {
        *self.shared.transaction_handler.lock().unwrap() = Some(handler);
    }

    /// Spawn the periodic timer task on the current tokio runtime.
    pub fn start(&self) {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK_PERIOD);
            loop {
                ticker.tick().await;
                if engine.shared.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                engine.do_timed_events();
            }
        });
    }

    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            stray_responses: self.shared.stray_responses.load(Ordering::Relaxed),
            dropped_requests: self.shared.dropped_requests.load(Ordering::Relaxed),
            parse_failures: self.shared.parse_failures.load(Ordering::Relaxed),
            active_transactions: self.shared.table.lock().unwrap().len(),
        }
    }

    /// Start a client transaction for an outgoing request. The request
    /// must already carry a top Via with an RFC 3261 branch.
    pub fn start_client_transaction(
        &self,
        request: SipMessage,
        remote: SocketAddr,
    ) -> Result<ClientTransaction, SipParseError> {
        let key = TransactionKey::of(&request)?;
        let kind = if request
            .method()
            .is_some_and(|m| m.eq_ignore_ascii_case("INVITE"))
        {
            TransactionKind::ClientInvite
        } else {
            TransactionKind::ClientNonInvite
        };

        let (completion_tx, completion_rx) = oneshot::channel();
        let inner = TransactionInner::new(
            kind,
            request,
            remote,
            self.shared.transport.is_reliable(),
            completion_tx,
        );
        let handle = Arc::new(TransactionHandle {
            key: key.clone(),
            kind,
            remote,
            inner: Mutex::new(inner),
        });
        self.shared
            .table
            .lock()
            .unwrap()
            .insert(key, handle.clone());

        let mut actions = Vec::new();
        {
            let mut inner = handle.inner.lock().unwrap();
            client::start(&mut inner, &self.shared.timers, Instant::now(), &mut actions);
        }
        self.run_actions(&handle, actions);

        Ok(ClientTransaction {
            engine: self.clone(),
            handle,
            completion: Mutex::new(Some(completion_rx)),
        })
    }

    /// Start a server transaction for an incoming request, immediately
    /// sending the application-supplied initial response. With a 2xx
    /// initial response the returned transaction is already terminated.
    pub fn start_server_transaction(
        &self,
        request: SipMessage,
        initial_response: SipMessage,
        remote: SocketAddr,
    ) -> Result<ServerTransaction, SipParseError> {
        let key = TransactionKey::of(&request)?;
        let kind = if request
            .method()
            .is_some_and(|m| m.eq_ignore_ascii_case("INVITE"))
        {
            TransactionKind::ServerInvite
        } else {
            TransactionKind::ServerNonInvite
        };

        let (completion_tx, completion_rx) = oneshot::channel();
        let inner = TransactionInner::new(
            kind,
            request,
            remote,
            self.shared.transport.is_reliable(),
            completion_tx,
        );
        let handle = Arc::new(TransactionHandle {
            key: key.clone(),
            kind,
            remote,
            inner: Mutex::new(inner),
        });
        self.shared
            .table
            .lock()
            .unwrap()
            .insert(key, handle.clone());

        let mut actions = Vec::new();
        {
            let mut inner = handle.inner.lock().unwrap();
            server::start(
                &mut inner,
                initial_response,
                &self.shared.timers,
                Instant::now(),
                &mut actions,
            );
        }
        self.run_actions(&handle, actions);

        Ok(ServerTransaction {
            engine: self.clone(),
            handle,
            completion: Mutex::new(Some(completion_rx)),
        })
    }

    /// Entry point for raw bytes from the transport. Parse failures are
    /// absorbed with a counter; the engine never propagates them.
    pub fn receive(&self, data: &[u8], source: SocketAddr) {
        match SipMessage::parse(data) {
            Ok(message) => self.receive_message(message, source),
            Err(err) => {
                self.shared.parse_failures.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("dropped unparseable SIP message from {}: {}", source, err);
            }
        }
    }

    /// Route one parsed message to its transaction, or dispatch it as a
    /// new request.
    pub fn receive_message(&self, message: SipMessage, source: SocketAddr) {
        let key = match TransactionKey::of(&message) {
            Ok(key) => key,
            Err(err) => {
                if message.is_request() {
                    self.shared.dropped_requests.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.shared.stray_responses.fetch_add(1, Ordering::Relaxed);
                }
                tracing::debug!("unroutable SIP message from {}: {}", source, err);
                return;
            }
        };

        let existing = self.shared.table.lock().unwrap().get(&key).cloned();

        if message.is_request() {
            match existing {
                Some(handle)
                    if matches!(
                        handle.kind,
                        TransactionKind::ServerInvite | TransactionKind::ServerNonInvite
                    ) =>
                {
                    let mut actions = Vec::new();
                    {
                        let mut inner = handle.inner.lock().unwrap();
                        server::on_request(
                            &mut inner,
                            &message,
                            &self.shared.timers,
                            Instant::now(),
                            &mut actions,
                        );
                    }
                    self.run_actions(&handle, actions);
                }
                Some(_) => {
                    // A request can never match a client transaction.
                    self.shared.dropped_requests.fetch_add(1, Ordering::Relaxed);
                }
                None => self.dispatch_new_request(message, source),
            }
        } else {
            match existing {
                Some(handle)
                    if matches!(
                        handle.kind,
                        TransactionKind::ClientInvite | TransactionKind::ClientNonInvite
                    ) =>
                {
                    let mut actions = Vec::new();
                    {
                        let mut inner = handle.inner.lock().unwrap();
                        client::on_response(
                            &mut inner,
                            &self.shared.timers,
                            Instant::now(),
                            message,
                            &mut actions,
                        );
                    }
                    self.run_actions(&handle, actions);
                }
                _ => {
                    self.shared.stray_responses.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("dropped response with no matching transaction");
                }
            }
        }
    }

    fn dispatch_new_request(&self, message: SipMessage, source: SocketAddr) {
        let method = message.method().unwrap_or_default().to_ascii_uppercase();
        if method == "ACK" {
            // ACK for a 2xx belongs to the dialog layer, not to any
            // transaction; quietly ignore it here.
            tracing::debug!("ACK with no matching transaction from {}", source);
            return;
        }
        if !SUPPORTED_METHODS.contains(&method.as_str()) {
            self.shared.dropped_requests.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("unsupported method {} from {}", method, source);
            return;
        }

        let initial_response = {
            let handler = self.shared.request_handler.lock().unwrap();
            match handler.as_ref() {
                Some(handler) => handler(&message, source),
                None => None,
            }
        };
        let Some(initial_response) = initial_response else {
            self.shared.dropped_requests.fetch_add(1, Ordering::Relaxed);
            return;
        };

        match self.start_server_transaction(message, initial_response, source) {
            Ok(transaction) => {
                let handler = self.shared.transaction_handler.lock().unwrap();
                if let Some(handler) = handler.as_ref() {
                    handler(transaction);
                }
            }
            Err(err) => {
                self.shared.dropped_requests.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("cannot spawn server transaction: {}", err);
            }
        }
    }

    /// Drive timers on every live transaction, then sweep terminated
    /// ones out of the table. Called by the ticker; tests call it
    /// directly to step virtual time.
    pub fn do_timed_events(&self) {
        let handles: Vec<Arc<TransactionHandle>> = {
            let table = self.shared.table.lock().unwrap();
            table.values().cloned().collect()
        };
        let now = Instant::now();

        for handle in &handles {
            let mut actions = Vec::new();
            {
                let mut inner = handle.inner.lock().unwrap();
                match handle.kind {
                    TransactionKind::ClientInvite | TransactionKind::ClientNonInvite => {
                        client::on_timer(&mut inner, &self.shared.timers, now, &mut actions)
                    }
                    TransactionKind::ServerInvite | TransactionKind::ServerNonInvite => {
                        server::on_timer(&mut inner, &self.shared.timers, now, &mut actions)
                    }
                }
            }
            self.run_actions(handle, actions);
        }

        let mut table = self.shared.table.lock().unwrap();
        table.retain(|_, handle| !handle.inner.lock().unwrap().state.is_terminal());
    }

    /// Execute deferred transition effects with no transaction lock
    /// held.
    fn run_actions(&self, handle: &Arc<TransactionHandle>, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send(message) => {
                    if let Err(err) = self.shared.transport.send(&message, handle.remote) {
                        tracing::warn!("transport send to {} failed: {}", handle.remote, err);
                        self.transport_failure(handle);
                    }
                }
                Action::Provisional(response) => {
                    let callbacks: Vec<ProvisionalCallback> = {
                        let inner = handle.inner.lock().unwrap();
                        inner.provisional_callbacks.clone()
                    };
                    for callback in callbacks {
                        callback(&response);
                    }
                }
                Action::Complete {
                    sender,
                    callbacks,
                    outcome,
                } => {
                    tracing::debug!(
                        "transaction {} completed: {:?}",
                        handle.key,
                        outcome.reason
                    );
                    if let Some(sender) = sender {
                        let _ = sender.send(outcome.clone());
                    }
                    for callback in callbacks {
                        callback(&outcome);
                    }
                }
                Action::SpawnCancel(cancel_request) => {
                    self.spawn_cancel(handle, cancel_request);
                }
            }
        }
    }

    /// Launch the CANCEL client transaction; its failure force-kills
    /// the INVITE it was canceling.
    fn spawn_cancel(&self, invite: &Arc<TransactionHandle>, cancel_request: SipMessage) {
        let cancel = match self.start_client_transaction(cancel_request, invite.remote) {
            Ok(cancel) => cancel,
            Err(err) => {
                tracing::warn!("cannot start CANCEL transaction: {}", err);
                self.force_terminate(invite);
                return;
            }
        };

        let engine = self.clone();
        let invite = invite.clone();
        cancel.on_completion(move |outcome| match outcome.reason {
            TerminationReason::OkReceived | TerminationReason::FinalResponseReceived => {
                // CANCEL answered; the INVITE will end with the 487.
            }
            _ => engine.force_terminate(&invite),
        });
    }

    fn force_terminate(&self, handle: &Arc<TransactionHandle>) {
        let mut actions = Vec::new();
        {
            let mut inner = handle.inner.lock().unwrap();
            client::force_terminate(&mut inner, &mut actions);
        }
        self.run_actions(handle, actions);
    }

    fn transport_failure(&self, handle: &Arc<TransactionHandle>) {
        let mut actions = Vec::new();
        {
            let mut inner = handle.inner.lock().unwrap();
            if !inner.state.is_terminal() {
                inner.terminate(
                    TransactionState::Terminated,
                    TerminationReason::ConnectionFailure,
                    None,
                    &mut actions,
                );
            }
        }
        // Only completion actions can come out of termination, so this
        // cannot recurse back into a send.
        self.run_actions(handle, actions);
    }
}

/// Application handle for a client transaction.
pub struct ClientTransaction {
    engine: TransactionEngine,
    handle: Arc<TransactionHandle>,
    completion: Mutex<Option<oneshot::Receiver<TransactionOutcome>>>,
}

impl ClientTransaction {
    pub fn key(&self) -> &TransactionKey {
        &self.handle.key
    }

    pub fn state(&self) -> TransactionState {
        self.handle.inner.lock().unwrap().state
    }

    /// Wait for the exactly-once completion report. A second call
    /// returns `None`.
    pub async fn await_completion(&self) -> Option<TransactionOutcome> {
        let receiver = self.completion.lock().unwrap().take()?;
        receiver.await.ok()
    }

    /// Register a completion callback. Registered after completion, it
    /// fires immediately with the recorded outcome.
    pub fn on_completion(&self, callback: impl FnOnce(&TransactionOutcome) + Send + 'static) {
        let already = {
            let mut inner = self.handle.inner.lock().unwrap();
            match inner.outcome.clone() {
                Some(outcome) => Some(outcome),
                None => {
                    inner
                        .completion_callbacks
                        .push(Box::new(callback) as CompletionCallback);
                    return;
                }
            }
        };
        if let Some(outcome) = already {
            callback(&outcome);
        }
    }

    /// Register a callback for provisional responses (101-199).
    pub fn on_provisional(&self, callback: impl Fn(&SipMessage) + Send + Sync + 'static) {
        self.handle
            .inner
            .lock()
            .unwrap()
            .provisional_callbacks
            .push(Arc::new(callback));
    }

    /// Cancel a pending INVITE. Accepted only while a provisional
    /// response has been received and no final response yet; any other
    /// state returns false without network traffic.
    pub fn cancel(&self) -> bool {
        let mut actions = Vec::new();
        let accepted = {
            let mut inner = self.handle.inner.lock().unwrap();
            client::request_cancel(&mut inner, &mut actions)
        };
        self.engine.run_actions(&self.handle, actions);
        accepted
    }
}

/// Application handle for a server transaction.
pub struct ServerTransaction {
    engine: TransactionEngine,
    handle: Arc<TransactionHandle>,
    completion: Mutex<Option<oneshot::Receiver<TransactionOutcome>>>,
}

impl ServerTransaction {
    pub fn key(&self) -> &TransactionKey {
        &self.handle.key
    }

    pub fn state(&self) -> TransactionState {
        self.handle.inner.lock().unwrap().state
    }

    /// The request that opened this transaction.
    pub fn request(&self) -> SipMessage {
        self.handle.inner.lock().unwrap().request.clone()
    }

    /// Send a further response. Returns false once the transaction no
    /// longer accepts responses.
    pub fn send_response(&self, response: SipMessage) -> bool {
        let mut actions = Vec::new();
        let accepted = {
            let mut inner = self.handle.inner.lock().unwrap();
            server::send_response(
                &mut inner,
                response,
                &self.engine.shared.timers,
                Instant::now(),
                &mut actions,
            )
        };
        self.engine.run_actions(&self.handle, actions);
        accepted
    }

    pub async fn await_completion(&self) -> Option<TransactionOutcome> {
        let receiver = self.completion.lock().unwrap().take()?;
        receiver.await.ok()
    }

    pub fn on_completion(&self, callback: impl FnOnce(&TransactionOutcome) + Send + 'static) {
        let already = {
            let mut inner = self.handle.inner.lock().unwrap();
            match inner.outcome.clone() {
                Some(outcome) => Some(outcome),
                None => {
                    inner
                        .completion_callbacks
                        .push(Box::new(callback) as CompletionCallback);
                    return;
                }
            }
        };
        if let Some(outcome) = already {
            callback(&outcome);
        }
    }
}
