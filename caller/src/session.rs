//! Caller-side call state machine.
//!
//! Pure: builds requests and consumes responses, never touches a socket.
//! The driver in [`crate::call`] owns the sockets and feeds events in.
//!
//! ```text
//! Idle -> InviteSent -> Established -> ByeSent -> Terminated
//!            |                            |
//!            +--------> Failed <----------+
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use tracing::{debug, info, warn};
use voice_call_common::sip::{
    CSeq, CallId, CallLeg, DialogIdentity, Method, Request, Response, SessionDescription,
    SipMessage,
};
use voice_call_common::{CallConfig, CallError, Result};

/// Caller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerState {
    Idle,
    InviteSent,
    Established,
    ByeSent,
    Terminated,
    Failed,
}

impl CallerState {
    // ---
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }
}

impl fmt::Display for CallerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Why a call ended in [`CallerState::Failed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// No final response arrived in time
    Timeout,

    /// The peer answered with a non-2xx final status
    Rejected { status: u16, reason: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("no response within timeout"),
            Self::Rejected { status, reason } => write!(f, "rejected with {status} {reason}"),
        }
    }
}

/// What the driver should do after feeding an event in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallerEvent {
    /// Nothing changed; keep waiting
    Ignored,

    /// 1xx received; keep waiting without extending the deadline
    Provisional(u16),

    /// Call is up: send `ack`, then stream media to `media`
    Established { ack: Request, media: SocketAddr },

    /// Call failed; no media was or will be sent
    Failed(FailureReason),

    /// Call is over
    Terminated,
}

/// Caller side of one call.
///
/// Owns the Call-ID and the CSeq counter. INVITE, ACK and BYE take
/// 1, 2 and 3 in that order.
pub struct CallerSession {
    // ---
    leg: CallLeg,
    state: CallerState,
    next_cseq: u32,

    /// CSeq of the request whose final response we are waiting for
    pending_cseq: Option<CSeq>,

    offer: SessionDescription,
    default_media: SocketAddr,
    failure: Option<FailureReason>,
}

impl CallerSession {
    // ---
    /// Creates an idle session.
    ///
    /// `local_media_port` is advertised in the offer; media goes to the
    /// peer's answered port, or to `config.remote_media_port` on the
    /// peer's control IP when the answer has no description.
    pub fn new(config: &CallConfig, leg: CallLeg, local_media_port: u16) -> Self {
        // ---
        let default_media = SocketAddr::new(leg.remote_addr.ip(), config.remote_media_port);
        Self {
            offer: SessionDescription::for_endpoint(config, local_media_port),
            leg,
            state: CallerState::Idle,
            next_cseq: 1,
            pending_cseq: None,
            default_media,
            failure: None,
        }
    }

    pub fn call_id(&self) -> &CallId {
        &self.leg.call_id
    }

    pub fn state(&self) -> CallerState {
        self.state
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        self.failure.as_ref()
    }

    /// `Idle -> InviteSent`: builds the INVITE carrying the offer.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::InvalidTransition`] outside `Idle`.
    pub fn invite(&mut self) -> Result<Request> {
        // ---
        self.expect_state(CallerState::Idle, "place call")?;
        let cseq = self.take_cseq();
        let invite = self.leg.request(Method::Invite, cseq, Some(&self.offer));
        self.pending_cseq = Some(CSeq::new(cseq, Method::Invite));
        self.transition(CallerState::InviteSent);
        Ok(invite)
    }

    /// `Established -> ByeSent`: builds the BYE.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::InvalidTransition`] outside `Established`.
    pub fn bye(&mut self) -> Result<Request> {
        // ---
        self.expect_state(CallerState::Established, "hang up")?;
        let cseq = self.take_cseq();
        let bye = self.leg.request(Method::Bye, cseq, None);
        self.pending_cseq = Some(CSeq::new(cseq, Method::Bye));
        self.transition(CallerState::ByeSent);
        Ok(bye)
    }

    /// Feeds a response in.
    ///
    /// Responses for another Call-ID, or whose CSeq does not match the
    /// outstanding request, are logged and ignored.
    pub fn on_response(&mut self, response: &Response) -> CallerEvent {
        // ---
        let message = SipMessage::Response(response.clone());
        if let Err(e) = self.correlate(&message) {
            warn!("Ignoring {}: {}", message.summary(), e);
            return CallerEvent::Ignored;
        }

        match self.state {
            CallerState::InviteSent if response.is_provisional() => {
                info!("Call {}: {} {}", self.leg.call_id, response.status, response.reason);
                CallerEvent::Provisional(response.status)
            }
            CallerState::InviteSent if response.is_success() => {
                let media = self.media_target(response);
                let cseq = self.take_cseq();
                let ack = self.leg.request(Method::Ack, cseq, None);
                self.pending_cseq = None;
                self.transition(CallerState::Established);
                CallerEvent::Established { ack, media }
            }
            CallerState::InviteSent | CallerState::ByeSent
                if response.status >= 200 && !response.is_success() =>
            {
                warn!(
                    "Call {}: {} rejected with {} {}",
                    self.leg.call_id,
                    if self.state == CallerState::InviteSent { "INVITE" } else { "BYE" },
                    response.status,
                    response.reason
                );
                self.fail(FailureReason::Rejected {
                    status: response.status,
                    reason: response.reason.clone(),
                })
            }
            CallerState::ByeSent if response.is_success() => {
                self.pending_cseq = None;
                self.transition(CallerState::Terminated);
                CallerEvent::Terminated
            }
            _ => {
                debug!("Call {}: ignoring {} in {}", self.leg.call_id, message.summary(), self.state);
                CallerEvent::Ignored
            }
        }
    }

    /// The response wait elapsed.
    ///
    /// An unanswered INVITE fails the call; an unanswered BYE terminates
    /// it anyway.
    pub fn on_timeout(&mut self, waited: Duration) -> CallerEvent {
        // ---
        let waiting_for = match self.state {
            CallerState::InviteSent => "INVITE response",
            CallerState::ByeSent => "BYE response",
            _ => return CallerEvent::Ignored,
        };
        warn!(
            "Call {}: {}",
            self.leg.call_id,
            CallError::ProtocolTimeout {
                waiting_for,
                elapsed_ms: waited.as_millis() as u64,
            }
        );

        self.pending_cseq = None;
        if self.state == CallerState::InviteSent {
            self.fail(FailureReason::Timeout)
        } else {
            self.transition(CallerState::Terminated);
            CallerEvent::Terminated
        }
    }

    /// Feeds a request from the peer in.
    ///
    /// Only a BYE for this call while established (or while our own BYE
    /// is outstanding) is honoured; it is answered with 200 and ends the
    /// call. Anything else is logged and ignored.
    pub fn on_request(&mut self, request: &Request) -> Option<Response> {
        // ---
        let message = SipMessage::Request(request.clone());
        if let Err(e) = self.correlate_call_id(&message) {
            warn!("Ignoring {}: {}", message.summary(), e);
            return None;
        }

        let active = matches!(self.state, CallerState::Established | CallerState::ByeSent);
        if request.method != Method::Bye || !active {
            debug!("Call {}: ignoring {} in {}", self.leg.call_id, request.method, self.state);
            return None;
        }

        let reply = DialogIdentity::capture(request).and_then(|id| id.response(request, 200, None));
        match reply {
            Ok(ok) => {
                info!("Call {}: remote hang-up", self.leg.call_id);
                self.pending_cseq = None;
                self.transition(CallerState::Terminated);
                Some(ok)
            }
            Err(e) => {
                warn!("Ignoring BYE: {}", e);
                None
            }
        }
    }

    fn correlate_call_id(&self, message: &SipMessage) -> Result<()> {
        // ---
        match message.call_id() {
            Some(id) if id == self.leg.call_id.as_str() => Ok(()),
            other => Err(CallError::UnknownCorrelation(
                other.unwrap_or("<missing>").to_string(),
            )),
        }
    }

    fn correlate(&self, message: &SipMessage) -> Result<()> {
        // ---
        self.correlate_call_id(message)?;
        let cseq = message.cseq()?;
        // Number and method must both match the outstanding request
        if Some(cseq) != self.pending_cseq {
            return Err(CallError::InvalidTransition {
                state: self.state.to_string(),
                event: "response with unexpected CSeq",
            });
        }
        Ok(())
    }

    /// Prefers the answer's media address, falling back to the default.
    fn media_target(&self, response: &Response) -> SocketAddr {
        // ---
        let Some(body) = response.body.as_deref() else {
            return self.default_media;
        };
        match SessionDescription::parse(body) {
            Ok(answer) => answer.audio_endpoint().unwrap_or(self.default_media),
            Err(e) => {
                warn!("Unusable answer ({}), sending media to {}", e, self.default_media);
                self.default_media
            }
        }
    }

    fn expect_state(&self, expected: CallerState, event: &'static str) -> Result<()> {
        // ---
        if self.state != expected {
            return Err(CallError::InvalidTransition {
                state: self.state.to_string(),
                event,
            });
        }
        Ok(())
    }

    fn take_cseq(&mut self) -> u32 {
        // ---
        let cseq = self.next_cseq;
        self.next_cseq += 1;
        cseq
    }

    fn fail(&mut self, reason: FailureReason) -> CallerEvent {
        // ---
        self.failure = Some(reason.clone());
        self.transition(CallerState::Failed);
        CallerEvent::Failed(reason)
    }

    fn transition(&mut self, next: CallerState) {
        // ---
        info!("Call {}: {} -> {}", self.leg.call_id, self.state, next);
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use voice_call_common::sip::Headers;

    fn session() -> CallerSession {
        // ---
        let leg = CallLeg::new(
            "caller",
            "127.0.0.1:5070".parse().unwrap(),
            "callee",
            "127.0.0.1:5060".parse().unwrap(),
        );
        CallerSession::new(&CallConfig::default(), leg, 5006)
    }

    /// Answers `request` the way a peer would.
    fn answer(request: &Request, status: u16, sdp: Option<&SessionDescription>) -> Response {
        // ---
        DialogIdentity::capture(request)
            .unwrap()
            .response(request, status, sdp)
            .unwrap()
    }

    #[test]
    fn test_invite_uses_cseq_one_and_offers_media_port() {
        // ---
        let mut s = session();
        let invite = s.invite().unwrap();

        assert_eq!(s.state(), CallerState::InviteSent);
        assert_eq!(invite.headers.get("CSeq"), Some("1 INVITE"));
        assert_eq!(invite.headers.get("Call-ID"), Some(s.call_id().as_str()));
        assert!(invite.body.as_deref().unwrap().contains("m=audio 5006 RTP/AVP 0 96"));
    }

    #[test]
    fn test_invite_twice_is_rejected() {
        // ---
        let mut s = session();
        s.invite().unwrap();
        assert!(matches!(s.invite(), Err(CallError::InvalidTransition { .. })));
    }

    #[test]
    fn test_ok_establishes_and_acks_with_cseq_two() {
        // ---
        let mut s = session();
        let invite = s.invite().unwrap();

        let mut callee = CallConfig::default();
        callee.local_ip = "127.0.0.2".parse().unwrap();
        let sdp = SessionDescription::for_endpoint(&callee, 7000);

        match s.on_response(&answer(&invite, 200, Some(&sdp))) {
            CallerEvent::Established { ack, media } => {
                assert_eq!(ack.method, Method::Ack);
                assert_eq!(ack.headers.get("CSeq"), Some("2 ACK"));
                assert_eq!(media, "127.0.0.2:7000".parse().unwrap());
            }
            other => panic!("expected Established, got {other:?}"),
        }
        assert_eq!(s.state(), CallerState::Established);
    }

    #[test]
    fn test_ok_without_answer_uses_default_media() {
        // ---
        let mut s = session();
        let invite = s.invite().unwrap();

        match s.on_response(&answer(&invite, 200, None)) {
            CallerEvent::Established { media, .. } => {
                assert_eq!(media, "127.0.0.1:5004".parse().unwrap());
            }
            other => panic!("expected Established, got {other:?}"),
        }
    }

    #[test]
    fn test_provisional_keeps_waiting() {
        // ---
        let mut s = session();
        let invite = s.invite().unwrap();

        assert_eq!(s.on_response(&answer(&invite, 180, None)), CallerEvent::Provisional(180));
        assert_eq!(s.state(), CallerState::InviteSent);
    }

    #[test]
    fn test_rejection_fails_the_call() {
        // ---
        let mut s = session();
        let invite = s.invite().unwrap();

        let event = s.on_response(&answer(&invite, 486, None));
        assert_eq!(
            event,
            CallerEvent::Failed(FailureReason::Rejected {
                status: 486,
                reason: "Busy Here".to_string()
            })
        );
        assert_eq!(s.state(), CallerState::Failed);
    }

    #[test]
    fn test_invite_timeout_fails() {
        // ---
        let mut s = session();
        s.invite().unwrap();

        let event = s.on_timeout(Duration::from_secs(5));
        assert_eq!(event, CallerEvent::Failed(FailureReason::Timeout));
        assert_eq!(s.failure(), Some(&FailureReason::Timeout));
        assert!(s.state().is_terminal());
    }

    /// Copy of `response` with one header value replaced.
    fn with_header(response: &Response, header: &str, replacement: &str) -> Response {
        // ---
        let mut headers = Headers::new();
        for (name, value) in response.headers.iter() {
            let value = if name == header { replacement } else { value };
            headers.push(name, value);
        }
        Response {
            headers,
            ..response.clone()
        }
    }

    #[test]
    fn test_stale_cseq_response_is_ignored() {
        // ---
        let mut s = session();
        let invite = s.invite().unwrap();
        let ok = answer(&invite, 200, None);
        s.on_response(&ok);
        let bye = s.bye().unwrap();

        // Late duplicate of the INVITE's 200
        assert_eq!(s.on_response(&ok), CallerEvent::Ignored);
        // Right number, wrong method
        let wrong_method = with_header(&answer(&bye, 200, None), "CSeq", "3 INVITE");
        assert_eq!(s.on_response(&wrong_method), CallerEvent::Ignored);
        // A rejection numbered for the INVITE must not fail the call either
        assert_eq!(s.on_response(&answer(&invite, 486, None)), CallerEvent::Ignored);
        assert_eq!(s.state(), CallerState::ByeSent);

        assert_eq!(s.on_response(&answer(&bye, 200, None)), CallerEvent::Terminated);
    }

    #[test]
    fn test_foreign_call_id_is_ignored() {
        // ---
        let mut s = session();
        let invite = s.invite().unwrap();

        let ok = with_header(&answer(&invite, 200, None), "Call-ID", "someone-else");

        assert_eq!(s.on_response(&ok), CallerEvent::Ignored);
        assert_eq!(s.state(), CallerState::InviteSent);
    }

    #[test]
    fn test_bye_then_ok_terminates() {
        // ---
        let mut s = session();
        let invite = s.invite().unwrap();
        s.on_response(&answer(&invite, 200, None));

        let bye = s.bye().unwrap();
        assert_eq!(bye.headers.get("CSeq"), Some("3 BYE"));

        // A stale 200 for the INVITE does not end the call
        assert_eq!(s.on_response(&answer(&invite, 200, None)), CallerEvent::Ignored);
        assert_eq!(s.state(), CallerState::ByeSent);

        assert_eq!(s.on_response(&answer(&bye, 200, None)), CallerEvent::Terminated);
        assert_eq!(s.state(), CallerState::Terminated);
    }

    #[test]
    fn test_unanswered_bye_still_terminates() {
        // ---
        let mut s = session();
        let invite = s.invite().unwrap();
        s.on_response(&answer(&invite, 200, None));
        s.bye().unwrap();

        assert_eq!(s.on_timeout(Duration::from_secs(5)), CallerEvent::Terminated);
        assert!(s.failure().is_none());
    }

    #[test]
    fn test_remote_bye_is_answered_and_terminates() {
        // ---
        let mut s = session();
        let invite = s.invite().unwrap();
        s.on_response(&answer(&invite, 200, None));

        // Same Call-ID, numbered by the peer
        let remote_bye = s.leg.request(Method::Bye, 1, None);

        let ok = s.on_request(&remote_bye).expect("BYE should be answered");
        assert_eq!(ok.status, 200);
        assert_eq!(ok.headers.get("Call-ID"), Some(s.call_id().as_str()));
        assert_eq!(s.state(), CallerState::Terminated);
    }
}
