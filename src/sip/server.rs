//! Server transaction state machines (RFC 3261 §17.2).
//!
//! Same shape as the client side: pure transitions over the shared
//! record, deferred actions for the engine. A server transaction is
//! created together with the application-supplied initial response;
//! when that response is already a 2xx the transaction terminates on
//! the spot, which mirrors §17.2.1's rule that a 2xx ends the server
//! INVITE transaction.

use std::time::Instant;

use crate::config::SipTimers;

use super::message::SipMessage;
use super::transaction::{
    Action, TerminationReason, TransactionInner, TransactionKind, TransactionState,
};

/// Send the initial response and arm the timers its class requires.
pub(crate) fn start(
    inner: &mut TransactionInner,
    initial_response: SipMessage,
    timers: &SipTimers,
    now: Instant,
    actions: &mut Vec<Action>,
) {
    send_response(inner, initial_response, timers, now, actions);
}

/// Transaction-user response path. Returns false when the state no
/// longer accepts responses.
pub(crate) fn send_response(
    inner: &mut TransactionInner,
    response: SipMessage,
    timers: &SipTimers,
    now: Instant,
    actions: &mut Vec<Action>,
) -> bool {
    let Some(code) = response.status_code() else {
        return false;
    };
    let accepting = matches!(
        inner.state,
        TransactionState::Trying | TransactionState::Proceeding
    );
    if !accepting {
        return false;
    }

    inner.last_response = Some(response.clone());
    actions.push(Action::Send(response.clone()));

    match code {
        100..=199 => {
            inner.state = TransactionState::Proceeding;
        }
        200..=299 if inner.kind == TransactionKind::ServerInvite => {
            // §17.2.1: a 2xx ends the INVITE server transaction on the
            // spot; retransmission responsibility moves to the TU.
            inner.terminate(
                TransactionState::Terminated,
                TerminationReason::OkReceived,
                Some(response),
                actions,
            );
        }
        _ => {
            let reason = if code < 300 {
                TerminationReason::OkReceived
            } else {
                TerminationReason::FinalResponseReceived
            };
            match inner.kind {
                TransactionKind::ServerInvite => {
                    // Retransmit the final response (Timer G) until the
                    // ACK arrives or Timer H gives up.
                    inner.state = TransactionState::Completed;
                    inner.arm_retransmit(now, timers.timer_g());
                    inner.timeout_at = Some(now + timers.timer_h());
                }
                _ => {
                    if inner.reliable {
                        inner.terminate(
                            TransactionState::Terminated,
                            reason,
                            Some(response),
                            actions,
                        );
                    } else {
                        inner.state = TransactionState::Completed;
                        inner.linger_at = Some(now + timers.timer_j());
                        inner.complete(reason, Some(response), actions);
                    }
                }
            }
        }
    }
    true
}

/// Handle a request arriving for an existing server transaction: a
/// retransmission of the original, or the ACK closing an INVITE.
pub(crate) fn on_request(
    inner: &mut TransactionInner,
    request: &SipMessage,
    timers: &SipTimers,
    now: Instant,
    actions: &mut Vec<Action>,
) {
    let method = request.method().unwrap_or_default().to_ascii_uppercase();

    if method == "ACK" && inner.kind == TransactionKind::ServerInvite {
        if inner.state == TransactionState::Completed {
            let response = inner.last_response.clone();
            if inner.reliable {
                inner.terminate(
                    TransactionState::Terminated,
                    TerminationReason::FinalResponseReceived,
                    response,
                    actions,
                );
            } else {
                inner.state = TransactionState::Confirmed;
                inner.retransmit_at = None;
                inner.timeout_at = None;
                inner.linger_at = Some(now + timers.timer_i());
                inner.complete(TerminationReason::FinalResponseReceived, response, actions);
            }
        }
        return;
    }

    // Retransmission of the original request: replay the last response.
    if matches!(
        inner.state,
        TransactionState::Proceeding | TransactionState::Completed
    ) {
        if let Some(response) = inner.last_response.clone() {
            actions.push(Action::Send(response));
        }
    }
}

pub(crate) fn on_timer(
    inner: &mut TransactionInner,
    timers: &SipTimers,
    now: Instant,
    actions: &mut Vec<Action>,
) {
    if inner.state.is_terminal() {
        return;
    }

    if let Some(at) = inner.timeout_at {
        if now >= at && inner.state == TransactionState::Completed {
            inner.terminate(
                TransactionState::Terminated,
                TerminationReason::AckToFinalResponseNotReceived,
                None,
                actions,
            );
            return;
        }
    }

    if let Some(at) = inner.retransmit_at {
        if now >= at && inner.state == TransactionState::Completed {
            if let Some(response) = inner.last_response.clone() {
                actions.push(Action::Send(response));
            }
            inner.backoff_retransmit(now, Some(timers.t2()));
        }
    }

    if let Some(at) = inner.linger_at {
        if now >= at
            && matches!(
                inner.state,
                TransactionState::Completed | TransactionState::Confirmed
            )
        {
            // Timer I / Timer J: quiet exit, completion already ran.
            inner.terminate(
                TransactionState::Terminated,
                inner
                    .reason
                    .unwrap_or(TerminationReason::FinalResponseReceived),
                None,
                actions,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sip::transaction::TransactionOutcome;
    use tokio::sync::oneshot;

    fn invite_request() -> SipMessage {
        let mut invite = SipMessage::request("INVITE", "sip:psap@192.0.2.10");
        invite.add_header("Via", "SIP/2.0/UDP 192.0.2.1;branch=z9hG4bKsrv1");
        invite.add_header("From", "<sip:caller@192.0.2.1>;tag=abc");
        invite.add_header("To", "<sip:psap@192.0.2.10>");
        invite.add_header("Call-ID", "cid-s1");
        invite.add_header("CSeq", "1 INVITE");
        invite
    }

    fn ack_for(invite: &SipMessage) -> SipMessage {
        let mut ack = SipMessage::request("ACK", "sip:psap@192.0.2.10");
        ack.add_header("Via", invite.header("Via").unwrap());
        ack.add_header("CSeq", "1 ACK");
        ack
    }

    fn new_server(
        kind: TransactionKind,
        request: SipMessage,
        reliable: bool,
    ) -> (TransactionInner, oneshot::Receiver<TransactionOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            TransactionInner::new(
                kind,
                request,
                "192.0.2.1:5060".parse().unwrap(),
                reliable,
                tx,
            ),
            rx,
        )
    }

    fn sends(actions: &[Action]) -> usize {
        actions
            .iter()
            .filter(|a| matches!(a, Action::Send(_)))
            .count()
    }

    #[test]
    fn test_invite_2xx_initial_response_terminates_immediately() {
        let timers = SipTimers::default();
        let request = invite_request();
        let ok = SipMessage::response_to(&request, 200, "OK");
        let (mut inner, _rx) = new_server(TransactionKind::ServerInvite, request, false);
        let mut actions = Vec::new();
        start(&mut inner, ok, &timers, Instant::now(), &mut actions);

        assert_eq!(inner.state, TransactionState::Terminated);
        assert_eq!(inner.reason, Some(TerminationReason::OkReceived));
        assert_eq!(sends(&actions), 1);
    }

    #[test]
    fn test_invite_error_response_retransmits_until_ack() {
        let timers = SipTimers::default();
        let request = invite_request();
        let trying = SipMessage::response_to(&request, 100, "Trying");
        let busy = SipMessage::response_to(&request, 486, "Busy Here");
        let (mut inner, _rx) = new_server(TransactionKind::ServerInvite, request.clone(), false);
        let mut actions = Vec::new();
        let t0 = Instant::now();
        start(&mut inner, trying, &timers, t0, &mut actions);
        assert_eq!(inner.state, TransactionState::Proceeding);

        assert!(send_response(&mut inner, busy, &timers, t0, &mut actions));
        assert_eq!(inner.state, TransactionState::Completed);
        assert!(inner.retransmit_at.is_some());

        // Timer G replays the final response with back-off.
        actions.clear();
        on_timer(&mut inner, &timers, t0 + timers.timer_g(), &mut actions);
        assert_eq!(sends(&actions), 1);

        // ACK moves to Confirmed and completes once.
        actions.clear();
        on_request(&mut inner, &ack_for(&request), &timers, t0, &mut actions);
        assert_eq!(inner.state, TransactionState::Confirmed);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Complete { .. })));

        // Timer I exits quietly.
        actions.clear();
        on_timer(&mut inner, &timers, t0 + timers.timer_i() * 2, &mut actions);
        assert_eq!(inner.state, TransactionState::Terminated);
        assert!(actions.is_empty());
    }

    #[test]
    fn test_invite_timer_h_without_ack() {
        let timers = SipTimers::default();
        let request = invite_request();
        let busy = SipMessage::response_to(&request, 486, "Busy Here");
        let (mut inner, _rx) = new_server(TransactionKind::ServerInvite, request, false);
        let mut actions = Vec::new();
        let t0 = Instant::now();
        start(&mut inner, busy, &timers, t0, &mut actions);

        on_timer(&mut inner, &timers, t0 + timers.timer_h(), &mut actions);
        assert_eq!(inner.state, TransactionState::Terminated);
        assert_eq!(
            inner.reason,
            Some(TerminationReason::AckToFinalResponseNotReceived)
        );
    }

    #[test]
    fn test_invite_retransmission_replays_response() {
        let timers = SipTimers::default();
        let request = invite_request();
        let ringing = SipMessage::response_to(&request, 180, "Ringing");
        let (mut inner, _rx) = new_server(TransactionKind::ServerInvite, request.clone(), false);
        let mut actions = Vec::new();
        let t0 = Instant::now();
        start(&mut inner, ringing, &timers, t0, &mut actions);
        actions.clear();

        on_request(&mut inner, &request, &timers, t0, &mut actions);
        assert_eq!(sends(&actions), 1);
    }

    #[test]
    fn test_reliable_invite_ack_terminates_directly() {
        let timers = SipTimers::default();
        let request = invite_request();
        let busy = SipMessage::response_to(&request, 486, "Busy Here");
        let (mut inner, _rx) = new_server(TransactionKind::ServerInvite, request.clone(), true);
        let mut actions = Vec::new();
        let t0 = Instant::now();
        start(&mut inner, busy, &timers, t0, &mut actions);
        // Reliable transport: Timer G never armed.
        assert!(inner.retransmit_at.is_none());

        on_request(&mut inner, &ack_for(&request), &timers, t0, &mut actions);
        assert_eq!(inner.state, TransactionState::Terminated);
    }

    #[test]
    fn test_non_invite_final_lingers_on_udp() {
        let timers = SipTimers::default();
        let mut message = SipMessage::request("MESSAGE", "sip:a@b");
        message.add_header("Via", "SIP/2.0/UDP h;branch=z9hG4bKsrv2");
        message.add_header("CSeq", "5 MESSAGE");
        let ok = SipMessage::response_to(&message, 200, "OK");

        let (mut inner, _rx) = new_server(TransactionKind::ServerNonInvite, message.clone(), false);
        let mut actions = Vec::new();
        let t0 = Instant::now();
        start(&mut inner, ok, &timers, t0, &mut actions);
        // Unlike INVITE, a non-INVITE 2xx still lingers in Completed.
        assert_eq!(inner.state, TransactionState::Completed);
        assert_eq!(inner.reason, Some(TerminationReason::OkReceived));

        // Retransmitted request replays the response.
        actions.clear();
        on_request(&mut inner, &message, &timers, t0, &mut actions);
        assert_eq!(sends(&actions), 1);

        // Timer J finishes quietly.
        actions.clear();
        on_timer(&mut inner, &timers, t0 + timers.timer_j(), &mut actions);
        assert_eq!(inner.state, TransactionState::Terminated);
        assert!(actions.is_empty());
    }

    #[test]
    fn test_send_response_refused_after_completion() {
        let timers = SipTimers::default();
        let request = invite_request();
        let busy = SipMessage::response_to(&request, 486, "Busy Here");
        let ringing = SipMessage::response_to(&request, 180, "Ringing");
        let (mut inner, _rx) = new_server(TransactionKind::ServerInvite, request, false);
        let mut actions = Vec::new();
        let t0 = Instant::now();
        start(&mut inner, busy, &timers, t0, &mut actions);

        assert!(!send_response(
            &mut inner,
            ringing,
            &timers,
            t0,
            &mut actions
        ));
    }
}
