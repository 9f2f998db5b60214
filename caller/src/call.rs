//! Caller call driver.
//!
//! Owns the control and media sockets for one call and feeds network
//! events into [`CallerSession`]. Once the call is up, media streaming
//! runs as its own task so a BYE (or its answer) is seen while frames
//! are still being paced out.

use std::future::Future;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use voice_call_common::sip::{CallId, CallLeg, SipMessage};
use voice_call_common::{CallConfig, ControlSocket, MetricsContext};

use crate::network::MediaSender;
use crate::session::{CallerEvent, CallerSession, CallerState, FailureReason};
use crate::stream::{stream_frames, StreamSummary};

/// How a call ended, as seen by the caller.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    // ---
    pub call_id: CallId,

    /// `Terminated` or `Failed`
    pub state: CallerState,

    pub failure: Option<FailureReason>,

    /// `None` when the call never reached `Established`
    pub media: Option<StreamSummary>,

    /// The peer hung up first
    pub remote_hangup: bool,
}

impl CallOutcome {
    // ---
    pub fn packets_sent(&self) -> u32 {
        self.media.map_or(0, |m| m.packets_sent)
    }
}

/// Places one call, streams `frames`, and hangs up.
///
/// The call ends when the frames run out, when `hangup` completes, or
/// when the peer sends BYE, whichever happens first. A call that fails
/// to establish sends no media. Every socket is released on return.
///
/// # Errors
///
/// Returns error on socket failures only; protocol failures (timeout,
/// rejection) are reported through [`CallOutcome`].
pub async fn run_call<H>(
    config: &CallConfig,
    remote_control: SocketAddr,
    remote_user: &str,
    frames: Vec<Vec<u8>>,
    hangup: H,
    metrics: &MetricsContext,
) -> Result<CallOutcome>
where
    H: Future<Output = ()>,
{
    // ---
    let control = ControlSocket::bind(config.control_addr(), config.max_datagram, metrics.clone())
        .await?;
    let media_socket = MediaSender::bind_socket(config.media_addr()).await?;
    let local_media_port = media_socket.local_addr()?.port();

    let local = SocketAddr::new(config.local_ip, control.local_addr()?.port());
    let leg = CallLeg::new(&config.local_user, local, remote_user, remote_control);
    let mut session = CallerSession::new(config, leg, local_media_port);

    info!(
        "Calling {}@{} (Call-ID {})",
        remote_user,
        remote_control,
        session.call_id()
    );

    let invite = session.invite()?;
    control
        .send(&SipMessage::from(invite), remote_control)
        .await
        .context("failed to send INVITE")?;
    metrics.calls_placed_total.inc();

    let media_addr = match await_final(&control, &mut session, config).await? {
        CallerEvent::Established { ack, media } => {
            control
                .send(&SipMessage::from(ack), remote_control)
                .await
                .context("failed to send ACK")?;
            media
        }
        _ => {
            metrics.calls_failed_total.inc();
            warn!(
                "Call {} failed: {}",
                session.call_id(),
                session
                    .failure()
                    .map_or_else(|| "unknown".to_string(), ToString::to_string)
            );
            return Ok(outcome(&session, None, false));
        }
    };
    metrics.calls_established_total.inc();

    // Media runs beside the control loop from here on
    let (stop_tx, stop_rx) = watch::channel(false);
    let sender = MediaSender::new(media_socket, media_addr, metrics.clone());
    let mut media_task = tokio::spawn(stream_frames(
        frames,
        sender,
        config.clone(),
        metrics.clone(),
        stop_rx,
    ));

    tokio::pin!(hangup);
    let mut hung_up = false;
    let mut remote_hangup = false;

    let summary = loop {
        tokio::select! {
            joined = &mut media_task => {
                break joined.context("media task failed")?;
            }
            _ = &mut hangup, if !hung_up => {
                info!("Call {}: local hang-up", session.call_id());
                hung_up = true;
                let _ = stop_tx.send(true);
            }
            received = control.recv() => {
                let (src, message) = received?;
                match message {
                    Some(SipMessage::Request(request)) => {
                        if let Some(reply) = session.on_request(&request) {
                            control.send(&SipMessage::from(reply), src).await?;
                            remote_hangup = true;
                            let _ = stop_tx.send(true);
                        }
                    }
                    Some(SipMessage::Response(response)) => {
                        // Late duplicates of the INVITE answer land here
                        session.on_response(&response);
                    }
                    None => {}
                }
            }
        }
    };

    if !remote_hangup {
        let bye = session.bye()?;
        control
            .send(&SipMessage::from(bye), remote_control)
            .await
            .context("failed to send BYE")?;
        await_final(&control, &mut session, config).await?;
    }

    if session.state() == CallerState::Terminated {
        metrics.calls_terminated_total.inc();
    }
    info!("Call {} ended in {}", session.call_id(), session.state());

    Ok(outcome(&session, Some(summary), remote_hangup))
}

/// Waits for the final response to the outstanding request.
///
/// Provisional and uncorrelated messages do not extend the deadline. No
/// media flows while this runs.
async fn await_final(
    control: &ControlSocket,
    session: &mut CallerSession,
    config: &CallConfig,
) -> Result<CallerEvent> {
    // ---
    let started = Instant::now();
    let deadline = started + config.response_timeout;

    loop {
        let (src, message) = match timeout_at(deadline, control.recv()).await {
            Ok(received) => received?,
            Err(_) => return Ok(session.on_timeout(started.elapsed())),
        };

        match message {
            Some(SipMessage::Response(response)) => match session.on_response(&response) {
                CallerEvent::Ignored | CallerEvent::Provisional(_) => continue,
                event => return Ok(event),
            },
            Some(SipMessage::Request(request)) => {
                // A BYE crossing ours still gets its 200
                if let Some(reply) = session.on_request(&request) {
                    control.send(&SipMessage::from(reply), src).await?;
                    return Ok(CallerEvent::Terminated);
                }
            }
            None => debug!("Skipping malformed datagram while waiting"),
        }
    }
}

fn outcome(
    session: &CallerSession,
    media: Option<StreamSummary>,
    remote_hangup: bool,
) -> CallOutcome {
    // ---
    CallOutcome {
        call_id: session.call_id().clone(),
        state: session.state(),
        failure: session.failure().cloned(),
        media,
        remote_hangup,
    }
}
