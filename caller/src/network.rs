//! UDP transmission for media packets and sender reports.
//!
//! Media goes to the peer's media port; sender reports go to the
//! paired report port (media + 1).

use anyhow::{Context, Result};
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::{debug, error, warn};

use voice_call_common::rtcp::build_sender_report;
use voice_call_common::rtp::HEADER_LEN;
use voice_call_common::{CallConfig, MetricsContext};

/// UDP sender for one media session.
///
/// Counts packets and payload octets for sender reports. Network errors
/// are logged and the stream carries on.
pub struct MediaSender {
    // ---
    socket: UdpSocket,
    media_addr: SocketAddr,
    report_addr: SocketAddr,
    packets_sent: u32,
    octets_sent: u32,
    metrics: MetricsContext,
}

impl MediaSender {
    // ---
    /// Binds the local media socket.
    ///
    /// Bound before the INVITE goes out so the offer can name its port.
    ///
    /// # Errors
    ///
    /// Returns error if socket binding fails.
    pub async fn bind_socket(addr: SocketAddr) -> Result<UdpSocket> {
        // ---
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("failed to bind media socket to {addr}"))?;

        debug!("Media socket bound to {}", socket.local_addr()?);
        Ok(socket)
    }

    /// Wraps a bound socket and points it at the peer's media address.
    pub fn new(socket: UdpSocket, media_addr: SocketAddr, metrics: MetricsContext) -> Self {
        // ---
        let report_port = CallConfig::report_port_for(media_addr.port());
        Self {
            socket,
            media_addr,
            report_addr: SocketAddr::new(media_addr.ip(), report_port),
            packets_sent: 0,
            octets_sent: 0,
            metrics,
        }
    }

    /// Sends one framed media packet.
    ///
    /// Transmission errors are logged, not returned, so the stream keeps
    /// its cadence.
    pub async fn send(&mut self, packet: &[u8]) {
        // ---
        match self.socket.send_to(packet, self.media_addr).await {
            Ok(_) => {
                let payload = packet.len().saturating_sub(HEADER_LEN);
                self.packets_sent = self.packets_sent.wrapping_add(1);
                self.octets_sent = self.octets_sent.wrapping_add(payload as u32);
                self.metrics.packets_sent_total.inc();
                self.metrics.bytes_sent_total.inc_by(payload as u64);

                if self.packets_sent % 100 == 0 {
                    debug!(
                        "Sent {} packets ({} payload bytes) to {}",
                        self.packets_sent, self.octets_sent, self.media_addr
                    );
                }
            }
            Err(e) => {
                error!("Failed to send media packet to {}: {}", self.media_addr, e);
                warn!("Continuing despite network error");
            }
        }
    }

    /// Sends a sender report describing everything sent so far.
    pub async fn send_report(&mut self, ssrc: u32, last_timestamp: u32) {
        // ---
        let report = build_sender_report(ssrc, last_timestamp, self.packets_sent, self.octets_sent);

        match self.socket.send_to(&report, self.report_addr).await {
            Ok(_) => {
                self.metrics.sender_reports_sent_total.inc();
                debug!(
                    "Sender report to {}: {} packets, {} octets, ts={}",
                    self.report_addr, self.packets_sent, self.octets_sent, last_timestamp
                );
            }
            Err(e) => warn!("Failed to send sender report to {}: {}", self.report_addr, e),
        }
    }

    pub fn media_addr(&self) -> SocketAddr {
        self.media_addr
    }

    /// Returns (packets sent, payload octets sent).
    pub fn stats(&self) -> (u32, u32) {
        // ---
        (self.packets_sent, self.octets_sent)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use voice_call_common::rtcp::{SenderReport, SENDER_REPORT_LEN};
    use voice_call_common::rtp::deframe;

    async fn sender_to(peer: &UdpSocket) -> MediaSender {
        // ---
        let socket = MediaSender::bind_socket("127.0.0.1:0".parse().unwrap())
            .await
            .expect("bind failed");
        let metrics = MetricsContext::new("test").unwrap();
        MediaSender::new(socket, peer.local_addr().unwrap(), metrics)
    }

    #[tokio::test]
    async fn test_send_counts_payload_octets() {
        // ---
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut sender = sender_to(&peer).await;

        let packet = voice_call_common::packetize(0, &[0xAB; 160], 7, 1120, 0x1234_5678);
        sender.send(&packet).await;

        let mut buf = [0u8; 2048];
        let (len, _) = peer.recv_from(&mut buf).await.unwrap();
        let (header, payload) = deframe(&buf[..len]).unwrap();
        assert_eq!(header.sequence, 7);
        assert_eq!(payload.len(), 160);

        assert_eq!(sender.stats(), (1, 160));
        assert_eq!(sender.metrics.packets_sent_total.get(), 1);
    }

    #[tokio::test]
    async fn test_report_goes_to_media_port_plus_one() {
        // ---
        let report_peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let report_port = report_peer.local_addr().unwrap().port();

        let socket = MediaSender::bind_socket("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let media_addr = SocketAddr::new("127.0.0.1".parse().unwrap(), report_port - 1);
        let mut sender = MediaSender::new(socket, media_addr, MetricsContext::new("test").unwrap());

        sender.send_report(0xCAFE_F00D, 640).await;

        let mut buf = [0u8; 64];
        let (len, _) = report_peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(len, SENDER_REPORT_LEN);

        let report = SenderReport::parse(&buf[..len]).unwrap();
        assert_eq!(report.ssrc, 0xCAFE_F00D);
        assert_eq!(report.rtp_timestamp, 640);
        assert_eq!(report.packet_count, 0);
    }
}
