//! Error taxonomy shared by the caller and callee.
//!
//! Codec-level failures are typed so the call drivers can tell a
//! discardable datagram apart from an error about the call itself.

/// Errors raised by the wire codecs and call state machines.
///
/// - **Recoverable, datagram-scoped**: [`MalformedMessage`](Self::MalformedMessage),
///   [`MalformedPacket`](Self::MalformedPacket), [`MalformedSdp`](Self::MalformedSdp),
///   [`UnknownCorrelation`](Self::UnknownCorrelation). The offending datagram is
///   dropped and processing continues.
/// - **Call-scoped**: [`ProtocolTimeout`](Self::ProtocolTimeout),
///   [`InvalidTransition`](Self::InvalidTransition).
/// - **Setup**: [`InvalidConfig`](Self::InvalidConfig), raised before any
///   socket is bound.
///
/// A full jitter buffer is not an error; see `JitterBuffer::offer`.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// The configured payload type and frame interval do not describe a
    /// usable frame.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A control message could not be parsed.
    #[error("malformed control message: {0}")]
    MalformedMessage(String),

    /// A media or report datagram could not be parsed.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// A session description body could not be parsed or is inconsistent.
    #[error("malformed session description: {0}")]
    MalformedSdp(String),

    /// No response arrived within the wait window.
    #[error("timed out after {elapsed_ms}ms waiting for {waiting_for}")]
    ProtocolTimeout {
        waiting_for: &'static str,
        elapsed_ms: u64,
    },

    /// The message references a Call-ID with no matching session.
    #[error("no session for Call-ID {0}")]
    UnknownCorrelation(String),

    /// The state machine was driven with an event its current state rejects.
    #[error("invalid transition: {event} in state {state}")]
    InvalidTransition { state: String, event: &'static str },
}

impl CallError {
    /// Returns `true` when the error only invalidates a single datagram.
    pub fn is_discardable(&self) -> bool {
        matches!(
            self,
            Self::MalformedMessage(_)
                | Self::MalformedPacket(_)
                | Self::MalformedSdp(_)
                | Self::UnknownCorrelation(_)
        )
    }
}

/// Convenience alias for `Result<T, CallError>`.
pub type Result<T> = std::result::Result<T, CallError>;

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn malformed_errors_are_discardable() {
        // ---
        assert!(CallError::MalformedMessage("x".into()).is_discardable());
        assert!(CallError::UnknownCorrelation("abc".into()).is_discardable());
        assert!(!CallError::ProtocolTimeout {
            waiting_for: "200 OK",
            elapsed_ms: 5000
        }
        .is_discardable());
        assert!(!CallError::InvalidTransition {
            state: "Idle".into(),
            event: "BYE"
        }
        .is_discardable());
    }

    #[test]
    fn timeout_message_names_what_was_awaited() {
        // ---
        let err = CallError::ProtocolTimeout {
            waiting_for: "response to INVITE",
            elapsed_ms: 250,
        };
        assert_eq!(
            err.to_string(),
            "timed out after 250ms waiting for response to INVITE"
        );
    }
}
