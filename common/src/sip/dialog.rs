//! Request and response construction for one call.
//!
//! The initiating side owns a [`CallLeg`] and numbers its own requests.
//! The answering side captures a [`DialogIdentity`] from the INVITE and
//! reuses it verbatim in every response.

use std::fmt;
use std::net::SocketAddr;

use super::message::{reason_phrase, CSeq, Headers, Method, Request, Response};
use super::sdp::SessionDescription;
use crate::error::Result;

/// Magic cookie prefixing every branch parameter (RFC 3261 §8.1.1.7).
const BRANCH_COOKIE: &str = "z9hG4bK";

/// Opaque token correlating all control messages of one call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallId(String);

impl CallId {
    // ---
    /// Generates a fresh, globally unique Call-ID.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller-side view of a call: who we are, who we're calling, and the
/// identifiers every request must carry.
#[derive(Debug, Clone)]
pub struct CallLeg {
    // ---
    pub call_id: CallId,
    pub local_user: String,
    pub local_addr: SocketAddr,
    pub remote_user: String,
    pub remote_addr: SocketAddr,
    from_tag: String,
}

impl CallLeg {
    // ---
    /// Starts a new leg with a fresh Call-ID and From tag.
    pub fn new(
        local_user: &str,
        local_addr: SocketAddr,
        remote_user: &str,
        remote_addr: SocketAddr,
    ) -> Self {
        // ---
        Self {
            call_id: CallId::generate(),
            local_user: local_user.to_string(),
            local_addr,
            remote_user: remote_user.to_string(),
            remote_addr,
            from_tag: random_token(),
        }
    }

    /// Builds a request for this leg.
    ///
    /// `Content-Type` is emitted only when `sdp` is present, and INVITE
    /// additionally carries a `Contact` header.
    pub fn request(&self, method: Method, cseq: u32, sdp: Option<&SessionDescription>) -> Request {
        // ---
        let local_ip = self.local_addr.ip();
        let remote_ip = self.remote_addr.ip();

        let mut headers = Headers::new()
            .with(
                "Via",
                format!(
                    "SIP/2.0/UDP {};branch={}{}",
                    self.local_addr,
                    BRANCH_COOKIE,
                    random_token()
                ),
            )
            .with(
                "From",
                format!("<sip:{}@{}>;tag={}", self.local_user, local_ip, self.from_tag),
            )
            .with("To", format!("<sip:{}@{}>", self.remote_user, remote_ip))
            .with("Call-ID", self.call_id.as_str())
            .with("CSeq", CSeq::new(cseq, method).to_string());

        if method == Method::Invite {
            headers.push(
                "Contact",
                format!("<sip:{}@{}>", self.local_user, self.local_addr),
            );
        }
        if sdp.is_some() {
            headers.push("Content-Type", "application/sdp");
        }

        Request {
            method,
            target: format!("sip:{}@{}", self.remote_user, self.remote_addr),
            headers,
            body: sdp.map(|s| s.to_string()),
        }
    }
}

/// Call-ID, From and To captured verbatim from an INVITE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogIdentity {
    pub call_id: CallId,
    pub from: String,
    pub to: String,
}

impl DialogIdentity {
    // ---
    /// Captures the identity headers of `invite`.
    ///
    /// # Errors
    ///
    /// Returns `MalformedMessage` if any of the three headers is missing.
    pub fn capture(invite: &Request) -> Result<Self> {
        // ---
        Ok(Self {
            call_id: CallId::from(invite.headers.require("Call-ID")?),
            from: invite.headers.require("From")?.to_string(),
            to: invite.headers.require("To")?.to_string(),
        })
    }

    /// Builds a response to `request` using the captured identity.
    ///
    /// `Via` and `CSeq` are echoed from the request being answered;
    /// `From`, `To` and `Call-ID` always come from the capture.
    ///
    /// # Errors
    ///
    /// Returns `MalformedMessage` if `request` lacks `Via` or `CSeq`.
    pub fn response(
        &self,
        request: &Request,
        status: u16,
        sdp: Option<&SessionDescription>,
    ) -> Result<Response> {
        // ---
        let mut headers = Headers::new()
            .with("Via", request.headers.require("Via")?)
            .with("From", self.from.as_str())
            .with("To", self.to.as_str())
            .with("Call-ID", self.call_id.as_str())
            .with("CSeq", request.headers.require("CSeq")?);

        if sdp.is_some() {
            headers.push("Content-Type", "application/sdp");
        }

        Ok(Response {
            status,
            reason: reason_phrase(status).to_string(),
            headers,
            body: sdp.map(|s| s.to_string()),
        })
    }
}

/// Short random hex token for tags and branches.
fn random_token() -> String {
    format!("{:08x}", rand::random::<u32>())
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::config::CallConfig;
    use crate::sip::SipMessage;

    fn leg() -> CallLeg {
        CallLeg::new(
            "caller",
            "127.0.0.1:5070".parse().unwrap(),
            "callee",
            "127.0.0.1:5060".parse().unwrap(),
        )
    }

    #[test]
    fn invite_carries_required_headers_and_sdp() {
        // ---
        let leg = leg();
        let sdp = SessionDescription::for_endpoint(&CallConfig::default(), 5004);
        let invite = SipMessage::from(leg.request(Method::Invite, 1, Some(&sdp)));
        let text = invite.serialize();

        assert!(text.starts_with("INVITE sip:callee@127.0.0.1:5060 SIP/2.0\r\n"));
        assert!(text.contains("Via: SIP/2.0/UDP 127.0.0.1:5070;branch=z9hG4bK"));
        assert!(text.contains("CSeq: 1 INVITE\r\n"));
        assert!(text.contains("Content-Type: application/sdp\r\n"));
        assert!(text.contains("Contact: <sip:caller@127.0.0.1:5070>\r\n"));
        assert!(text.contains(&format!("Call-ID: {}\r\n", leg.call_id)));

        let parsed = SipMessage::parse(text.as_bytes()).expect("INVITE must parse");
        assert_eq!(parsed.body().map(str::len), Some(sdp.to_string().len()));
    }

    #[test]
    fn requests_share_call_id_and_from_tag() {
        // ---
        let leg = leg();
        let ack = leg.request(Method::Ack, 2, None);
        let bye = leg.request(Method::Bye, 3, None);

        assert_eq!(ack.headers.get("Call-ID"), bye.headers.get("Call-ID"));
        assert_eq!(ack.headers.get("From"), bye.headers.get("From"));
        assert_eq!(bye.headers.get("CSeq"), Some("3 BYE"));
        assert!(ack.headers.get("Content-Type").is_none());
        assert!(ack.body.is_none());
    }

    #[test]
    fn fresh_legs_get_distinct_call_ids() {
        // ---
        assert_ne!(leg().call_id, leg().call_id);
    }

    #[test]
    fn response_reuses_captured_identity() {
        // ---
        let leg = leg();
        let invite = leg.request(Method::Invite, 1, None);
        let identity = DialogIdentity::capture(&invite).unwrap();

        let bye = leg.request(Method::Bye, 3, None);
        let ok = identity.response(&bye, 200, None).unwrap();

        assert_eq!(ok.status, 200);
        assert_eq!(ok.reason, "OK");
        assert_eq!(ok.headers.get("Call-ID"), Some(leg.call_id.as_str()));
        assert_eq!(ok.headers.get("From"), invite.headers.get("From"));
        assert_eq!(ok.headers.get("To"), invite.headers.get("To"));
        assert_eq!(ok.headers.get("CSeq"), Some("3 BYE"));
        assert_eq!(ok.headers.get("Via"), bye.headers.get("Via"));
    }
}
