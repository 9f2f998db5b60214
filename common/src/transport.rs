//! UDP transport for control messages.
//!
//! Wraps a tokio UDP socket so both endpoints send and receive parsed
//! [`SipMessage`]s. Malformed datagrams are logged, counted, and surfaced
//! as `None` rather than as errors.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::observability::MetricsContext;
use crate::sip::SipMessage;

/// Control-message socket bound for the lifetime of one call.
///
/// Dropping it releases the port on every exit path.
pub struct ControlSocket {
    // ---
    socket: UdpSocket,
    buf_size: usize,
    metrics: MetricsContext,
}

impl ControlSocket {
    // ---
    /// Binds the control socket.
    ///
    /// # Errors
    ///
    /// Returns error if socket binding fails.
    pub async fn bind(addr: SocketAddr, buf_size: usize, metrics: MetricsContext) -> Result<Self> {
        // ---
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("failed to bind control socket to {addr}"))?;

        info!("Control socket bound to {}", socket.local_addr()?);

        Ok(Self {
            socket,
            buf_size,
            metrics,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .context("control socket has no local address")
    }

    /// Serializes and sends one message. Exactly one attempt is made.
    pub async fn send(&self, message: &SipMessage, to: SocketAddr) -> Result<()> {
        // ---
        let text = message.serialize();
        self.socket
            .send_to(text.as_bytes(), to)
            .await
            .with_context(|| format!("failed to send {} to {to}", message.summary()))?;

        let kind = kind_label(message);
        self.metrics
            .control_sent_total
            .with_label_values(&[kind.as_str()])
            .inc();
        debug!("Sent {} to {} ({} bytes)", message.summary(), to, text.len());
        Ok(())
    }

    /// Receives the next datagram.
    ///
    /// # Returns
    ///
    /// The sender address and the parsed message, or `None` when the
    /// datagram was malformed (already logged).
    ///
    /// # Errors
    ///
    /// Returns error if network reception fails.
    pub async fn recv(&self) -> Result<(SocketAddr, Option<SipMessage>)> {
        // ---
        let mut buf = vec![0u8; self.buf_size];
        let (len, src) = self
            .socket
            .recv_from(&mut buf)
            .await
            .context("failed to receive control datagram")?;

        match SipMessage::parse(&buf[..len]) {
            Ok(message) => {
                let kind = kind_label(&message);
                self.metrics
                    .control_received_total
                    .with_label_values(&[kind.as_str()])
                    .inc();
                debug!("Received {} from {}", message.summary(), src);
                Ok((src, Some(message)))
            }
            Err(e) => {
                self.metrics.malformed_datagrams_total.inc();
                warn!("Dropped malformed control message from {}: {}", src, e);
                Ok((src, None))
            }
        }
    }
}

/// Metric label: method name for requests, status code for responses.
fn kind_label(message: &SipMessage) -> String {
    // ---
    match message {
        SipMessage::Request(r) => r.method.to_string(),
        SipMessage::Response(r) => r.status.to_string(),
    }
}
