//! Client transaction state machines (RFC 3261 §17.1).
//!
//! Pure transition logic: every function mutates the shared record and
//! pushes deferred [`Action`]s; the engine owns locking, transport and
//! callback delivery.

use std::time::Instant;

use crate::config::SipTimers;

use super::message::{build_ack, build_cancel, SipMessage};
use super::transaction::{
    Action, TerminationReason, TransactionInner, TransactionKind, TransactionState,
};

/// Put the request on the wire and arm the UDP retransmission and
/// overall timeout timers.
pub(crate) fn start(
    inner: &mut TransactionInner,
    timers: &SipTimers,
    now: Instant,
    actions: &mut Vec<Action>,
) {
    actions.push(Action::Send(inner.request.clone()));
    inner.transmit_count = 1;
    inner.arm_retransmit(now, timers.t1());
    inner.timeout_at = Some(
        now + match inner.kind {
            TransactionKind::ClientInvite => timers.timer_b(),
            _ => timers.timer_f(),
        },
    );
}

pub(crate) fn on_response(
    inner: &mut TransactionInner,
    timers: &SipTimers,
    now: Instant,
    response: SipMessage,
    actions: &mut Vec<Action>,
) {
    match inner.kind {
        TransactionKind::ClientInvite => invite_on_response(inner, timers, now, response, actions),
        TransactionKind::ClientNonInvite => {
            non_invite_on_response(inner, timers, now, response, actions)
        }
        _ => {}
    }
}

fn invite_on_response(
    inner: &mut TransactionInner,
    timers: &SipTimers,
    now: Instant,
    response: SipMessage,
    actions: &mut Vec<Action>,
) {
    let Some(code) = response.status_code() else {
        return;
    };
    match inner.state {
        TransactionState::Calling | TransactionState::Proceeding => match code {
            100..=199 => {
                // Retransmissions stop on any provisional response; the
                // transaction then waits for a final response (Timer B
                // applies only in Calling).
                inner.state = TransactionState::Proceeding;
                inner.retransmit_at = None;
                inner.timeout_at = None;
                if code != 100 {
                    actions.push(Action::Provisional(response));
                }
            }
            200..=299 => {
                send_ack(inner, &response, actions);
                inner.last_response = Some(response.clone());
                inner.terminate(
                    TransactionState::Terminated,
                    TerminationReason::OkReceived,
                    Some(response),
                    actions,
                );
            }
            _ => {
                send_ack(inner, &response, actions);
                inner.last_response = Some(response.clone());
                if inner.reliable {
                    inner.terminate(
                        TransactionState::Terminated,
                        TerminationReason::FinalResponseReceived,
                        Some(response),
                        actions,
                    );
                } else {
                    inner.state = TransactionState::Completed;
                    inner.retransmit_at = None;
                    inner.timeout_at = None;
                    inner.linger_at = Some(now + timers.timer_d());
                    inner.complete(
                        TerminationReason::FinalResponseReceived,
                        Some(response),
                        actions,
                    );
                }
            }
        },
        TransactionState::Completed => {
            // A retransmitted final response means our ACK was lost.
            if code >= 300 {
                if let Some(ack) = inner.last_ack.clone() {
                    actions.push(Action::Send(ack));
                }
            }
        }
        _ => {}
    }
}

fn send_ack(inner: &mut TransactionInner, response: &SipMessage, actions: &mut Vec<Action>) {
    match build_ack(&inner.request, response) {
        Ok(ack) => {
            inner.last_ack = Some(ack.clone());
            actions.push(Action::Send(ack));
        }
        Err(err) => {
            tracing::warn!("cannot build ACK: {}", err);
        }
    }
}

fn non_invite_on_response(
    inner: &mut TransactionInner,
    timers: &SipTimers,
    now: Instant,
    response: SipMessage,
    actions: &mut Vec<Action>,
) {
    let Some(code) = response.status_code() else {
        return;
    };
    match inner.state {
        TransactionState::Trying | TransactionState::Proceeding => match code {
            100..=199 => {
                inner.state = TransactionState::Proceeding;
                if !inner.reliable {
                    // Retransmissions continue at the T2 interval.
                    inner.retransmit_interval = timers.t2();
                    inner.retransmit_at = Some(now + timers.t2());
                }
                if code != 100 {
                    actions.push(Action::Provisional(response));
                }
            }
            _ => {
                let reason = if code < 300 {
                    TerminationReason::OkReceived
                } else {
                    TerminationReason::FinalResponseReceived
                };
                inner.last_response = Some(response.clone());
                if inner.reliable {
                    inner.terminate(
                        TransactionState::Terminated,
                        reason,
                        Some(response),
                        actions,
                    );
                } else {
                    inner.state = TransactionState::Completed;
                    inner.retransmit_at = None;
                    inner.timeout_at = None;
                    inner.linger_at = Some(now + timers.timer_k());
                    inner.complete(reason, Some(response), actions);
                }
            }
        },
        _ => {}
    }
}

/// Drive retransmission, timeout and linger deadlines.
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
        if now >= at {
            let reason = match (inner.kind, inner.state) {
                (TransactionKind::ClientNonInvite, TransactionState::Proceeding) => {
                    TerminationReason::NoFinalResponseReceived
                }
                _ => TerminationReason::NoResponseReceived,
            };
            inner.terminate(TransactionState::Terminated, reason, None, actions);
            return;
        }
    }

    if let Some(at) = inner.retransmit_at {
        if now >= at
            && matches!(
                inner.state,
                TransactionState::Calling | TransactionState::Trying | TransactionState::Proceeding
            )
        {
            actions.push(Action::Send(inner.request.clone()));
            inner.transmit_count += 1;
            match inner.kind {
                // Timer A doubles without bound until Timer B.
                TransactionKind::ClientInvite => inner.backoff_retransmit(now, None),
                // Timer E doubles capped at T2.
                _ => inner.backoff_retransmit(now, Some(timers.t2())),
            }
        }
    }

    if let Some(at) = inner.linger_at {
        if now >= at && inner.state == TransactionState::Completed {
            // Timer D / Timer K: leave quietly, completion already ran.
            inner.terminate(
                TransactionState::Terminated,
                inner.reason.unwrap_or(TerminationReason::FinalResponseReceived),
                None,
                actions,
            );
        }
    }
}

/// CANCEL gate (RFC 3261 §9.1): only a transaction that has seen a
/// provisional response may be canceled. Returns false, with no network
/// traffic, in any other state.
pub(crate) fn request_cancel(inner: &mut TransactionInner, actions: &mut Vec<Action>) -> bool {
    if inner.kind != TransactionKind::ClientInvite || inner.state != TransactionState::Proceeding {
        return false;
    }
    match build_cancel(&inner.request) {
        Ok(cancel) => {
            actions.push(Action::SpawnCancel(cancel));
            true
        }
        Err(err) => {
            tracing::warn!("cannot build CANCEL: {}", err);
            false
        }
    }
}

/// The spawned CANCEL transaction failed; the INVITE is abandoned.
pub(crate) fn force_terminate(inner: &mut TransactionInner, actions: &mut Vec<Action>) {
    if !inner.state.is_terminal() {
        inner.terminate(
            TransactionState::ForceTerminated,
            TerminationReason::CancelRequestFailed,
            None,
            actions,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sip::transaction::TransactionOutcome;
    use tokio::sync::oneshot;

    fn invite_request() -> SipMessage {
        let mut invite = SipMessage::request("INVITE", "sip:psap@192.0.2.10");
        invite.add_header("Via", "SIP/2.0/UDP 192.0.2.1;branch=z9hG4bKtest1");
        invite.add_header("From", "<sip:caller@192.0.2.1>;tag=abc");
        invite.add_header("To", "<sip:psap@192.0.2.10>");
        invite.add_header("Call-ID", "cid-1");
        invite.add_header("CSeq", "1 INVITE");
        invite
    }

    fn response(code: u16, reason: &str, request: &SipMessage) -> SipMessage {
        let mut r = SipMessage::response_to(request, code, reason);
        if code >= 200 {
            r.set_header("To", "<sip:psap@192.0.2.10>;tag=srv");
        }
        r
    }

    fn new_client(
        kind: TransactionKind,
        request: SipMessage,
    ) -> (TransactionInner, oneshot::Receiver<TransactionOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            TransactionInner::new(kind, request, "192.0.2.10:5060".parse().unwrap(), false, tx),
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
    fn test_invite_retransmits_double_until_timer_b() {
        let timers = SipTimers::default();
        let (mut inner, _rx) = new_client(TransactionKind::ClientInvite, invite_request());
        let mut actions = Vec::new();
        let t0 = Instant::now();
        start(&mut inner, &timers, t0, &mut actions);
        assert_eq!(sends(&actions), 1);

        // Walk simulated time through the full Timer B window. With
        // T1=500ms and B=32s, retransmissions happen at 0.5, 1.5, 3.5,
        // 7.5, 15.5, 31.5 seconds: 7 copies total.
        let mut now = t0;
        let deadline = t0 + timers.timer_b();
        while now < deadline + timers.t1() {
            now += std::time::Duration::from_millis(100);
            let mut step = Vec::new();
            on_timer(&mut inner, &timers, now, &mut step);
            actions.extend(step);
        }
        assert_eq!(inner.transmit_count, 7);
        assert_eq!(inner.state, TransactionState::Terminated);
        assert_eq!(inner.reason, Some(TerminationReason::NoResponseReceived));
    }

    #[test]
    fn test_invite_2xx_sends_ack_and_terminates() {
        let timers = SipTimers::default();
        let request = invite_request();
        let (mut inner, _rx) = new_client(TransactionKind::ClientInvite, request.clone());
        let mut actions = Vec::new();
        let now = Instant::now();
        start(&mut inner, &timers, now, &mut actions);
        actions.clear();

        on_response(
            &mut inner,
            &timers,
            now,
            response(200, "OK", &request),
            &mut actions,
        );
        assert_eq!(inner.state, TransactionState::Terminated);
        assert_eq!(inner.reason, Some(TerminationReason::OkReceived));

        // One Send (the ACK) and one Complete.
        assert_eq!(sends(&actions), 1);
        let ack = actions
            .iter()
            .find_map(|a| match a {
                Action::Send(m) => Some(m),
                _ => None,
            })
            .unwrap();
        assert_eq!(ack.method(), Some("ACK"));
        assert_eq!(ack.cseq().unwrap().0, 1);
        assert_eq!(ack.to_tag(), Some("srv".to_string()));
    }

    #[test]
    fn test_invite_final_error_lingers_through_timer_d() {
        let timers = SipTimers::default();
        let request = invite_request();
        let (mut inner, _rx) = new_client(TransactionKind::ClientInvite, request.clone());
        let mut actions = Vec::new();
        let now = Instant::now();
        start(&mut inner, &timers, now, &mut actions);
        actions.clear();

        on_response(
            &mut inner,
            &timers,
            now,
            response(487, "Request Terminated", &request),
            &mut actions,
        );
        assert_eq!(inner.state, TransactionState::Completed);
        assert_eq!(inner.reason, Some(TerminationReason::FinalResponseReceived));

        // A retransmitted 487 triggers an ACK replay.
        actions.clear();
        on_response(
            &mut inner,
            &timers,
            now,
            response(487, "Request Terminated", &request),
            &mut actions,
        );
        assert_eq!(sends(&actions), 1);

        // Timer D moves to Terminated without a second completion.
        actions.clear();
        on_timer(
            &mut inner,
            &timers,
            now + timers.timer_d(),
            &mut actions,
        );
        assert_eq!(inner.state, TransactionState::Terminated);
        assert!(actions.is_empty());
    }

    #[test]
    fn test_provisional_stops_retransmission_and_gates_cancel() {
        let timers = SipTimers::default();
        let request = invite_request();
        let (mut inner, _rx) = new_client(TransactionKind::ClientInvite, request.clone());
        let mut actions = Vec::new();
        let now = Instant::now();
        start(&mut inner, &timers, now, &mut actions);

        // CANCEL before any provisional: refused, no traffic.
        let mut cancel_actions = Vec::new();
        assert!(!request_cancel(&mut inner, &mut cancel_actions));
        assert!(cancel_actions.is_empty());

        on_response(
            &mut inner,
            &timers,
            now,
            response(180, "Ringing", &request),
            &mut actions,
        );
        assert_eq!(inner.state, TransactionState::Proceeding);
        assert!(inner.retransmit_at.is_none());

        let mut cancel_actions = Vec::new();
        assert!(request_cancel(&mut inner, &mut cancel_actions));
        assert!(matches!(cancel_actions[0], Action::SpawnCancel(_)));
    }

    #[test]
    fn test_non_invite_timeout_reason_depends_on_state() {
        let timers = SipTimers::default();
        let mut options = SipMessage::request("OPTIONS", "sip:a@b");
        options.add_header("Via", "SIP/2.0/UDP h;branch=z9hG4bKni1");
        options.add_header("From", "<sip:x@y>;tag=1");
        options.add_header("To", "<sip:a@b>");
        options.add_header("Call-ID", "cid-2");
        options.add_header("CSeq", "2 OPTIONS");

        // Timeout in Trying: nothing at all was received.
        let (mut inner, _rx) = new_client(TransactionKind::ClientNonInvite, options.clone());
        let mut actions = Vec::new();
        let now = Instant::now();
        start(&mut inner, &timers, now, &mut actions);
        on_timer(&mut inner, &timers, now + timers.timer_f(), &mut actions);
        assert_eq!(inner.reason, Some(TerminationReason::NoResponseReceived));

        // Timeout in Proceeding: a provisional was seen first.
        let (mut inner, _rx) = new_client(TransactionKind::ClientNonInvite, options.clone());
        let mut actions = Vec::new();
        start(&mut inner, &timers, now, &mut actions);
        on_response(
            &mut inner,
            &timers,
            now,
            response(183, "Session Progress", &options),
            &mut actions,
        );
        on_timer(&mut inner, &timers, now + timers.timer_f(), &mut actions);
        assert_eq!(inner.reason, Some(TerminationReason::NoFinalResponseReceived));
    }

    #[test]
    fn test_non_invite_retransmit_caps_at_t2() {
        let timers = SipTimers::default();
        let mut info = SipMessage::request("INFO", "sip:a@b");
        info.add_header("Via", "SIP/2.0/UDP h;branch=z9hG4bKni2");
        info.add_header("CSeq", "3 INFO");
        let (mut inner, _rx) = new_client(TransactionKind::ClientNonInvite, info);
        let mut actions = Vec::new();
        let t0 = Instant::now();
        start(&mut inner, &timers, t0, &mut actions);

        let mut now = t0;
        for _ in 0..6 {
            now += inner.retransmit_interval;
            on_timer(&mut inner, &timers, now, &mut actions);
        }
        assert_eq!(inner.retransmit_interval, timers.t2());
    }

    #[test]
    fn test_force_terminate_reports_cancel_failure() {
        let (mut inner, _rx) = new_client(TransactionKind::ClientInvite, invite_request());
        inner.state = TransactionState::Proceeding;
        let mut actions = Vec::new();
        force_terminate(&mut inner, &mut actions);
        assert_eq!(inner.state, TransactionState::ForceTerminated);
        assert_eq!(inner.reason, Some(TerminationReason::CancelRequestFailed));
        assert_eq!(actions.len(), 1);
    }
}
