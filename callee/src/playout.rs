//! Playout consumer.
//!
//! Takes one packet per frame interval from the jitter buffer and
//! appends its payload to an optional sink. Stands in for an audio
//! device: it drains the buffer at the real-time cadence.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::jitter_buffer::JitterBuffer;

/// Totals for one playout run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlayoutSummary {
    // ---
    /// Ticks that found a packet
    pub frames_played: u64,

    /// Ticks that found the buffer empty
    pub underruns: u64,

    pub bytes_written: u64,
}

/// Plays out packets until `stop` is set and the buffer is empty.
///
/// # Errors
///
/// Returns error if writing to `sink` fails.
pub async fn playout<W>(
    jitter: Arc<JitterBuffer>,
    frame_interval: Duration,
    mut sink: Option<W>,
    stop: watch::Receiver<bool>,
) -> Result<PlayoutSummary>
where
    W: AsyncWrite + Unpin,
{
    // ---
    let mut ticker = interval(frame_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut summary = PlayoutSummary::default();

    loop {
        ticker.tick().await;

        match jitter.take() {
            Some(packet) => {
                if let Some(out) = sink.as_mut() {
                    out.write_all(&packet.payload)
                        .await
                        .context("failed to write playout output")?;
                }
                summary.frames_played += 1;
                summary.bytes_written += packet.payload.len() as u64;

                if summary.frames_played % 100 == 0 {
                    info!("Played {} frames", summary.frames_played);
                }
            }
            None if *stop.borrow() => break,
            None => {
                // Nothing arrived in time for this slot
                summary.underruns += 1;
            }
        }
    }

    if let Some(out) = sink.as_mut() {
        out.flush().await.context("failed to flush playout output")?;
    }
    debug!("Playout finished: {:?}", summary);
    Ok(summary)
}
