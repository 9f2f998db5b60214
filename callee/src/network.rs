//! UDP network reception for media packets and sender reports.
//!
//! Provides async UDP socket handling for the media port and its paired
//! report port (media + 1).

use anyhow::{Context, Result};
use std::io;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use voice_call_common::rtcp::SenderReport;
use voice_call_common::rtp::RTP_VERSION;
use voice_call_common::{CallError, MediaPacket, MetricsContext};

/// UDP receiver for media packets.
///
/// Invalid datagrams are logged, counted as malformed, and skipped.
pub struct MediaReceiver {
    // ---
    socket: UdpSocket,
    buf_size: usize,
    packets_received: u64,
    bytes_received: u64,
    packets_dropped: u64,
    metrics: MetricsContext,
}

impl MediaReceiver {
    // ---
    /// Creates a media receiver bound to `addr`.
    ///
    /// # Errors
    ///
    /// Returns error if socket binding fails.
    pub async fn bind(addr: SocketAddr, buf_size: usize, metrics: MetricsContext) -> Result<Self> {
        // ---
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("failed to bind media socket to {addr}"))?;

        info!("Media socket bound to {}", socket.local_addr()?);

        Ok(Self {
            socket,
            buf_size,
            packets_received: 0,
            bytes_received: 0,
            packets_dropped: 0,
            metrics,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .context("media socket has no local address")
    }

    /// Receives the next media packet.
    ///
    /// # Returns
    ///
    /// The next valid packet, or `None` if the datagram was invalid.
    ///
    /// # Errors
    ///
    /// Returns error if network reception fails.
    pub async fn receive(&mut self) -> Result<Option<MediaPacket>> {
        // ---
        let mut buf = vec![0u8; self.buf_size];

        let (len, src) = self
            .socket
            .recv_from(&mut buf)
            .await
            .context("failed to receive media packet")?;

        Ok(self.accept(&buf[..len], src))
    }

    /// Receives every datagram already queued on the socket, without
    /// waiting for more. Invalid datagrams are skipped as in [`receive`].
    ///
    /// [`receive`]: Self::receive
    ///
    /// # Errors
    ///
    /// Returns error if network reception fails.
    pub fn receive_pending(&mut self) -> Result<Vec<MediaPacket>> {
        // ---
        let mut buf = vec![0u8; self.buf_size];
        let mut packets = Vec::new();

        loop {
            match self.socket.try_recv_from(&mut buf) {
                Ok((len, src)) => packets.extend(self.accept(&buf[..len], src)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e).context("failed to receive queued media"),
            }
        }

        if !packets.is_empty() {
            debug!("Collected {} queued media packets", packets.len());
        }
        Ok(packets)
    }

    /// Counts one datagram and returns it if it is a valid media packet.
    fn accept(&mut self, data: &[u8], src: SocketAddr) -> Option<MediaPacket> {
        // ---
        match parse_media(data) {
            Ok(packet) => {
                self.packets_received += 1;
                self.bytes_received += packet.payload.len() as u64;
                self.metrics.packets_received_total.inc();
                self.metrics
                    .bytes_received_total
                    .inc_by(packet.payload.len() as u64);

                if self.packets_received % 100 == 0 {
                    debug!(
                        "Received {} packets ({} bytes, {} dropped) from {} - seq={}",
                        self.packets_received,
                        self.bytes_received,
                        self.packets_dropped,
                        src,
                        packet.sequence()
                    );
                }

                Some(packet)
            }
            Err(e) => {
                self.packets_dropped += 1;
                self.metrics.malformed_datagrams_total.inc();
                warn!("Dropped invalid packet from {}: {}", src, e);
                None
            }
        }
    }

    /// Returns (packets received, payload bytes received, packets dropped).
    pub fn stats(&self) -> (u64, u64, u64) {
        // ---
        (
            self.packets_received,
            self.bytes_received,
            self.packets_dropped,
        )
    }
}

/// Deframes and checks the version, which the framer itself leaves alone.
fn parse_media(data: &[u8]) -> voice_call_common::Result<MediaPacket> {
    // ---
    let packet = MediaPacket::deserialize(data)?;
    if packet.header.version != RTP_VERSION {
        return Err(CallError::MalformedPacket(format!(
            "invalid RTP version: {}",
            packet.header.version
        )));
    }
    Ok(packet)
}

/// Listener on the report port for the peer's sender reports.
pub struct ReportReceiver {
    // ---
    socket: UdpSocket,
    metrics: MetricsContext,
}

impl ReportReceiver {
    // ---
    /// Binds the report port.
    ///
    /// # Errors
    ///
    /// Returns error if socket binding fails.
    pub async fn bind(addr: SocketAddr, metrics: MetricsContext) -> Result<Self> {
        // ---
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("failed to bind report socket to {addr}"))?;

        info!("Report socket bound to {}", socket.local_addr()?);
        Ok(Self { socket, metrics })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .context("report socket has no local address")
    }

    /// Receives the next sender report, or `None` for anything else.
    ///
    /// # Errors
    ///
    /// Returns error if network reception fails.
    pub async fn receive(&self) -> Result<Option<SenderReport>> {
        // ---
        let mut buf = [0u8; 512];
        let (len, src) = self
            .socket
            .recv_from(&mut buf)
            .await
            .context("failed to receive report")?;

        match SenderReport::parse(&buf[..len]) {
            Ok(report) => Ok(Some(report)),
            Err(e) => {
                self.metrics.malformed_datagrams_total.inc();
                warn!("Dropped invalid report from {}: {}", src, e);
                Ok(None)
            }
        }
    }
}
