//! Callee-side call state machine.
//!
//! ```text
//! Idle -> InviteReceived -> Established -> Terminated
//! ```
//!
//! Pure: takes requests, returns the response to send (if any). The
//! Call-ID, From and To of the INVITE are captured once and reused
//! verbatim in every later response.

use std::fmt;
use std::net::SocketAddr;

use tracing::{info, warn};
use voice_call_common::sip::{CSeq, CallId, DialogIdentity, Method, Request, Response, SessionDescription};
use voice_call_common::{CallConfig, CallError, Result};

/// Callee state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalleeState {
    Idle,
    InviteReceived,
    Established,
    Terminated,
}

impl fmt::Display for CalleeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Callee side of one call.
pub struct CalleeSession {
    // ---
    state: CalleeState,
    identity: Option<DialogIdentity>,

    /// Answer naming our actual media port
    answer: SessionDescription,

    /// Media address from the caller's offer, if it sent one
    remote_media: Option<SocketAddr>,

    /// Highest CSeq number processed for this call
    last_cseq: u32,
}

impl CalleeSession {
    // ---
    pub fn new(config: &CallConfig, media_port: u16) -> Self {
        // ---
        Self {
            state: CalleeState::Idle,
            identity: None,
            answer: SessionDescription::for_endpoint(config, media_port),
            remote_media: None,
            last_cseq: 0,
        }
    }

    pub fn state(&self) -> CalleeState {
        self.state
    }

    pub fn call_id(&self) -> Option<&CallId> {
        self.identity.as_ref().map(|id| &id.call_id)
    }

    pub fn remote_media(&self) -> Option<SocketAddr> {
        self.remote_media
    }

    /// Media is only queued between ACK and BYE.
    pub fn accepts_media(&self) -> bool {
        self.state == CalleeState::Established
    }

    /// Feeds a request in and returns the response to send, if any.
    ///
    /// - INVITE in `Idle` is answered 200 with our session description.
    ///   A retransmitted INVITE gets the same 200 again.
    /// - ACK moves `InviteReceived` to `Established`; it is not answered.
    /// - BYE is answered 200 and terminates the call. A repeated BYE after
    ///   termination is answered again.
    ///
    /// # Errors
    ///
    /// - [`CallError::UnknownCorrelation`] for another Call-ID
    /// - [`CallError::InvalidTransition`] for a request the current state
    ///   rejects, or a CSeq below the last one processed
    /// - [`CallError::MalformedMessage`] when identity headers are missing
    ///
    /// All of these leave the session unchanged; the driver logs and
    /// drops the request.
    pub fn on_request(&mut self, request: &Request) -> Result<Option<Response>> {
        // ---
        let call_id = request.headers.require("Call-ID")?;
        let cseq: CSeq = request.headers.require("CSeq")?.parse()?;

        if self.identity.is_none() {
            if request.method != Method::Invite {
                return Err(CallError::UnknownCorrelation(call_id.to_string()));
            }
            self.accept_invite(request, DialogIdentity::capture(request)?);
            self.last_cseq = cseq.number;
            return self.reply(request, 200, true).map(Some);
        }

        let same_call = self
            .identity
            .as_ref()
            .is_some_and(|id| id.call_id.as_str() == call_id);
        if !same_call {
            return Err(CallError::UnknownCorrelation(call_id.to_string()));
        }

        let retransmit = cseq.number == self.last_cseq;
        if cseq.number < self.last_cseq {
            return Err(self.invalid("request with stale CSeq"));
        }

        match (self.state, request.method) {
            (CalleeState::InviteReceived, Method::Invite) if retransmit => {
                self.reply(request, 200, true).map(Some)
            }
            (CalleeState::InviteReceived, Method::Ack) => {
                self.last_cseq = cseq.number;
                self.transition(CalleeState::Established);
                Ok(None)
            }
            (CalleeState::InviteReceived | CalleeState::Established, Method::Bye) => {
                let ok = self.reply(request, 200, false)?;
                self.last_cseq = cseq.number;
                self.transition(CalleeState::Terminated);
                Ok(Some(ok))
            }
            (CalleeState::Terminated, Method::Bye) if retransmit => {
                self.reply(request, 200, false).map(Some)
            }
            (_, Method::Invite) => Err(self.invalid("INVITE")),
            (_, Method::Ack) => Err(self.invalid("ACK")),
            (_, Method::Bye) => Err(self.invalid("BYE")),
        }
    }

    fn accept_invite(&mut self, invite: &Request, identity: DialogIdentity) {
        // ---
        if let Some(body) = invite.body.as_deref() {
            match SessionDescription::parse(body) {
                Ok(offer) => self.remote_media = offer.audio_endpoint(),
                Err(e) => warn!("Ignoring unusable offer in INVITE: {}", e),
            }
        }

        info!(
            "Incoming call {} from {} (media {:?})",
            identity.call_id, identity.from, self.remote_media
        );
        self.identity = Some(identity);
        self.transition(CalleeState::InviteReceived);
    }

    fn reply(&self, request: &Request, status: u16, with_answer: bool) -> Result<Response> {
        // ---
        let identity = self
            .identity
            .as_ref()
            .ok_or_else(|| self.invalid("reply before INVITE"))?;
        let sdp = with_answer.then_some(&self.answer);
        identity.response(request, status, sdp)
    }

    fn invalid(&self, event: &'static str) -> CallError {
        // ---
        CallError::InvalidTransition {
            state: self.state.to_string(),
            event,
        }
    }

    fn transition(&mut self, next: CalleeState) {
        // ---
        let call_id = self.call_id().map_or("-", CallId::as_str);
        info!("Call {}: {} -> {}", call_id, self.state, next);
        self.state = next;
    }
}
