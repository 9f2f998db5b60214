//! Callee side of a voice call.
//!
//! Answers one incoming call, queues its media into a [`JitterBuffer`]
//! for a playout consumer, and tracks arrival statistics. Usable as a
//! library so tests can run a callee in-process.

pub mod jitter_buffer;
pub mod network;
pub mod playout;
pub mod session;
pub mod stats;

pub use jitter_buffer::JitterBuffer;
pub use network::{MediaReceiver, ReportReceiver};
pub use playout::{playout, PlayoutSummary};
pub use session::{CalleeSession, CalleeState};
pub use stats::{Arrival, ReceiverStats};

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use voice_call_common::rtcp::{build_receiver_report, ReportBlock, SenderReport};
use voice_call_common::sip::{CallId, SipMessage};
use voice_call_common::{CallConfig, CallError, ControlSocket, MediaPacket, MetricsContext};

/// How a served call ended.
#[derive(Debug, Clone)]
pub struct CallSummary {
    // ---
    pub call_id: Option<CallId>,
    pub state: CalleeState,

    /// Media address the caller offered, if its INVITE carried one
    pub remote_media: Option<SocketAddr>,

    /// Media packets queued into the jitter buffer
    pub packets_queued: u64,

    /// Media packets dropped because the jitter buffer was full
    pub packets_dropped: u64,

    /// Sender reports received on the report port
    pub sender_reports: u64,

    /// Reception quality at hang-up, if any media arrived
    pub report: Option<ReportBlock>,
}

/// Bound sockets for one callee.
///
/// Binding is separate from serving so callers (and tests) can learn the
/// actual ports before the call starts.
pub struct CalleeEndpoint {
    // ---
    config: CallConfig,
    control: ControlSocket,
    media: MediaReceiver,
    reports: Option<ReportReceiver>,
    metrics: MetricsContext,
}

impl CalleeEndpoint {
    // ---
    /// Binds the control, media and report sockets.
    ///
    /// The report socket goes on media + 1. If that port is taken the
    /// callee carries on without it.
    ///
    /// # Errors
    ///
    /// Returns error if the control or media socket cannot be bound.
    pub async fn bind(config: &CallConfig, metrics: MetricsContext) -> Result<Self> {
        // ---
        let control =
            ControlSocket::bind(config.control_addr(), config.max_datagram, metrics.clone()).await?;
        let media = MediaReceiver::bind(config.media_addr(), config.max_datagram, metrics.clone()).await?;

        let media_port = media.local_addr()?.port();
        let report_addr = SocketAddr::new(config.local_ip, CallConfig::report_port_for(media_port));
        let reports = match ReportReceiver::bind(report_addr, metrics.clone()).await {
            Ok(r) => Some(r),
            Err(e) => {
                warn!("Running without report channel: {:#}", e);
                None
            }
        };

        Ok(Self {
            config: config.clone(),
            control,
            media,
            reports,
            metrics,
        })
    }

    pub fn control_addr(&self) -> Result<SocketAddr> {
        self.control.local_addr()
    }

    pub fn media_addr(&self) -> Result<SocketAddr> {
        self.media.local_addr()
    }

    /// Serves one call from INVITE to BYE.
    ///
    /// Control, media and report sockets are multiplexed so a BYE is
    /// seen at any point during media reception. Media is queued only
    /// between ACK and BYE; packets already waiting on the media socket
    /// when the BYE is handled still count as before it. After BYE, waits
    /// up to `drain_grace` for the playout consumer to empty `jitter`.
    /// Sockets are released on return.
    ///
    /// # Errors
    ///
    /// Returns error if a socket fails.
    pub async fn serve_call(mut self, jitter: Arc<JitterBuffer>) -> Result<CallSummary> {
        // ---
        let media_port = self.media.local_addr()?.port();
        let clock_rate = self
            .config
            .active_codec()
            .map_or(8000, |codec| codec.clock_rate);

        let mut session = CalleeSession::new(&self.config, media_port);
        let mut intake = Intake {
            stats: ReceiverStats::new(clock_rate, Duration::from_secs(5)),
            packets_queued: 0,
            packets_dropped: 0,
        };
        let mut sender_reports = 0u64;

        info!("Waiting for a call on {}", self.control.local_addr()?);

        while session.state() != CalleeState::Terminated {
            // Control first: an ACK queued ahead of media must open the gate
            tokio::select! {
                biased;
                received = self.control.recv() => {
                    let (src, message) = received?;
                    let was_accepting = session.accepts_media();
                    self.handle_control(&mut session, src, message).await?;

                    if was_accepting && !session.accepts_media() {
                        // Already on the socket when the BYE was handled
                        for packet in self.media.receive_pending()? {
                            intake.queue(packet, &jitter, &self.metrics);
                        }
                    }
                }
                received = self.media.receive() => {
                    let Some(packet) = received? else { continue };
                    if !session.accepts_media() {
                        debug!("Ignoring media seq={} in {}", packet.sequence(), session.state());
                        continue;
                    }
                    intake.queue(packet, &jitter, &self.metrics);
                }
                received = next_report(self.reports.as_ref()) => {
                    if let Some(report) = received? {
                        sender_reports += 1;
                        log_sender_report(&report);
                    }
                }
            }
        }

        self.metrics.calls_terminated_total.inc();
        drain(&jitter, self.config.drain_grace, self.config.frame_interval).await;
        self.metrics.jitter_buffer_occupancy_packets.set(jitter.len() as i64);

        intake.stats.log();
        let report = intake.stats.report_block();
        if let Some(block) = &report {
            let rr = build_receiver_report(rand::random::<u32>(), block);
            info!(
                "Receiver report ({} bytes): ssrc=0x{:08X} lost={} fraction={}/256 highest={} jitter={}",
                rr.len(),
                block.source_ssrc,
                block.cumulative_lost,
                block.fraction_lost,
                block.highest_sequence,
                block.jitter
            );
        }

        Ok(CallSummary {
            call_id: session.call_id().cloned(),
            state: session.state(),
            remote_media: session.remote_media(),
            packets_queued: intake.packets_queued,
            packets_dropped: intake.packets_dropped,
            sender_reports,
            report,
        })
    }

    async fn handle_control(
        &self,
        session: &mut CalleeSession,
        src: SocketAddr,
        message: Option<SipMessage>,
    ) -> Result<()> {
        // ---
        let request = match message {
            Some(SipMessage::Request(request)) => request,
            Some(SipMessage::Response(response)) => {
                debug!("Ignoring unsolicited {} {}", response.status, response.reason);
                return Ok(());
            }
            None => return Ok(()),
        };

        let before = session.state();
        match session.on_request(&request) {
            Ok(Some(response)) => self.control.send(&SipMessage::from(response), src).await?,
            Ok(None) => {}
            Err(e) if e.is_discardable() => {
                warn!("Discarding {} from {}: {}", request.method, src, e);
                return Ok(());
            }
            Err(e @ CallError::InvalidTransition { .. }) => {
                // Retransmits and stragglers; the call carries on
                warn!("Ignoring {} from {}: {}", request.method, src, e);
                return Ok(());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("{} from {src}", request.method));
            }
        }

        if before != CalleeState::Established && session.state() == CalleeState::Established {
            self.metrics.calls_established_total.inc();
            if let Some(media) = session.remote_media() {
                info!("Call established; caller sends media from {}", media);
            }
        }
        Ok(())
    }
}

/// Media accepted into one call so far.
struct Intake {
    // ---
    stats: ReceiverStats,
    packets_queued: u64,
    packets_dropped: u64,
}

impl Intake {
    // ---
    /// Records `packet` and offers it to the jitter buffer.
    fn queue(&mut self, packet: MediaPacket, jitter: &JitterBuffer, metrics: &MetricsContext) {
        // ---
        self.stats.record_packet(&packet.header);
        if jitter.offer(packet) {
            self.packets_queued += 1;
        } else {
            self.packets_dropped += 1;
            metrics.jitter_buffer_dropped_total.inc();
        }
        metrics.jitter_buffer_occupancy_packets.set(jitter.len() as i64);
    }
}

/// Next sender report, or never when there is no report socket.
async fn next_report(reports: Option<&ReportReceiver>) -> Result<Option<SenderReport>> {
    // ---
    match reports {
        Some(r) => r.receive().await,
        None => std::future::pending().await,
    }
}

fn log_sender_report(report: &SenderReport) {
    // ---
    info!(
        "Sender report: ssrc=0x{:08X} packets={} octets={} ts={} ntp={}.{:08X}",
        report.ssrc,
        report.packet_count,
        report.octet_count,
        report.rtp_timestamp,
        report.ntp.seconds,
        report.ntp.fraction
    );
}

/// Waits for the playout consumer to empty the buffer, up to `grace`.
async fn drain(jitter: &JitterBuffer, grace: Duration, poll: Duration) {
    // ---
    let deadline = Instant::now() + grace;
    while !jitter.is_empty() {
        let now = Instant::now();
        if now >= deadline {
            warn!("Drain grace elapsed with {} packets still queued", jitter.len());
            return;
        }
        sleep(poll.min(deadline - now)).await;
    }
    debug!("Jitter buffer drained");
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[tokio::test]
    async fn test_drain_returns_once_empty() {
        // ---
        let jitter = JitterBuffer::new(4);
        let started = Instant::now();
        drain(&jitter, Duration::from_secs(5), Duration::from_millis(1)).await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_drain_gives_up_after_grace() {
        // ---
        let jitter = JitterBuffer::new(4);
        jitter.offer(MediaPacket::new(0, 0, 0, 1, vec![0]));

        let started = Instant::now();
        drain(&jitter, Duration::from_millis(30), Duration::from_millis(5)).await;
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(jitter.len(), 1);
    }

    #[tokio::test]
    async fn test_endpoint_binds_report_port_next_to_media() {
        // ---
        let config = CallConfig::ephemeral("callee");
        let endpoint = CalleeEndpoint::bind(&config, MetricsContext::new("test").unwrap())
            .await
            .unwrap();

        let media_port = endpoint.media_addr().unwrap().port();
        if let Some(reports) = &endpoint.reports {
            let report_port = reports.local_addr().unwrap().port();
            assert_eq!(report_port, media_port.wrapping_add(1));
        }
        assert_ne!(endpoint.control_addr().unwrap().port(), 0);
    }
}
