//! Paced media streaming.
//!
//! Frames go out at a fixed real-time cadence. Falling behind is logged
//! and recorded as drift; the loop never bursts to catch up.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use voice_call_common::{CallConfig, MediaCounters, MetricsContext};

use crate::network::MediaSender;

/// Why the send loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// Every frame was sent
    Exhausted,

    /// A hang-up or remote BYE stopped it early
    Stopped,
}

/// Totals for one media session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSummary {
    // ---
    pub ssrc: u32,
    pub frames_sent: usize,
    pub packets_sent: u32,
    pub octets_sent: u32,
    pub end: StreamEnd,
}

/// Splits raw payload bytes into frames of `frame_bytes`.
///
/// The last frame may be short; [`stream_frames`] pads it.
pub fn chunk_frames(data: &[u8], frame_bytes: usize) -> Vec<Vec<u8>> {
    // ---
    data.chunks(frame_bytes.max(1)).map(<[u8]>::to_vec).collect()
}

/// Streams `frames` to the peer until they run out or `stop` flips to `true`.
///
/// Owns the session's sequence/timestamp counters and SSRC for its whole
/// lifetime. A sender report goes out every `report_interval_packets`
/// packets.
pub async fn stream_frames(
    frames: Vec<Vec<u8>>,
    mut sender: MediaSender,
    config: CallConfig,
    metrics: MetricsContext,
    mut stop: watch::Receiver<bool>,
) -> StreamSummary {
    // ---
    let ssrc = rand::random::<u32>();
    let mut counters = MediaCounters::new(ssrc, config.samples_per_frame);
    let silence = config.silence_byte();
    let report_every = config.report_interval_packets.max(1);

    info!(
        "Streaming {} frames to {} (SSRC 0x{:08X})",
        frames.len(),
        sender.media_addr(),
        ssrc
    );

    let mut ticker = interval(config.frame_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut end = StreamEnd::Exhausted;
    let mut frames_sent = 0;

    for mut frame in frames {
        // ---
        let scheduled = tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => {
                end = StreamEnd::Stopped;
                break;
            }
            scheduled = ticker.tick() => scheduled,
        };
        observe_drift(&metrics, scheduled, config.frame_interval);

        // Pad last frame if needed
        if frame.len() < config.frame_bytes {
            warn!(
                "Padding last frame: {} bytes -> {}",
                frame.len(),
                config.frame_bytes
            );
            frame.resize(config.frame_bytes, silence);
        }

        let packet = counters.next_packet(config.payload_type, &frame);
        sender.send(&packet).await;
        frames_sent += 1;

        let (packets_sent, _) = sender.stats();
        if packets_sent > 0 && packets_sent % report_every == 0 {
            sender.send_report(ssrc, counters.last_timestamp()).await;
        }
    }

    // The last frame still occupies its slot before the call can end
    if end == StreamEnd::Exhausted && frames_sent > 0 {
        tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => {}
            _ = ticker.tick() => {}
        }
    }

    let (packets_sent, octets_sent) = sender.stats();
    info!(
        "Media stream {:?}: {} frames, {} packets, {} bytes",
        end, frames_sent, packets_sent, octets_sent
    );

    StreamSummary {
        ssrc,
        frames_sent,
        packets_sent,
        octets_sent,
        end,
    }
}

/// Records how late this frame went out relative to its slot.
fn observe_drift(metrics: &MetricsContext, scheduled: Instant, frame_interval: Duration) {
    // ---
    let drift = Instant::now().saturating_duration_since(scheduled);
    metrics.pacing_drift_seconds.observe(drift.as_secs_f64());

    if drift > frame_interval {
        debug!("Send loop {:?} behind schedule", drift);
    }
}
