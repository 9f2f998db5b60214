//! Text control protocol: messages, session descriptions, and the
//! per-call request/response builders.

mod dialog;
mod message;
mod sdp;

pub use dialog::{CallId, CallLeg, DialogIdentity};
pub use message::{
    reason_phrase, CSeq, Headers, Method, Request, Response, SipMessage, PROTOCOL,
    REQUIRED_HEADERS,
};
pub use sdp::{MediaDescription, RtpMap, SessionDescription};
