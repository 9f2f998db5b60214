//! Voice call caller - CLI binary.
//!
//! Places a call, streams a raw payload file as paced media frames,
//! and hangs up when the file runs out or on Ctrl-C.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::info;

use caller::{chunk_frames, run_call, CallerState};
use voice_call_common::{init_tracing, CallConfig, ColorWhen, MetricsContext};

#[derive(clap::ValueEnum, Debug, Clone, Copy)]
enum ColorArg {
    Auto,
    Always,
    Never,
}

impl From<ColorArg> for ColorWhen {
    fn from(v: ColorArg) -> Self {
        match v {
            ColorArg::Auto => ColorWhen::Auto,
            ColorArg::Always => ColorWhen::Always,
            ColorArg::Never => ColorWhen::Never,
        }
    }
}

/// Voice Call Caller - Place a call and stream audio frames
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    // ---
    /// Callee control address (IP:port)
    #[arg(short, long, default_value = "127.0.0.1:5060")]
    remote: SocketAddr,

    /// User part of the callee's URI
    #[arg(long, default_value = "callee")]
    remote_user: String,

    /// Input file of raw, already-encoded payload bytes.
    ///
    /// Without it, `--frames` frames of silence are sent.
    #[arg(short, long)]
    input: Option<String>,

    /// Silence frames to send when no input file is given
    #[arg(long, default_value = "250")]
    frames: usize,

    /// Local IP advertised in headers and the session description
    #[arg(long, default_value = "127.0.0.1")]
    local_ip: IpAddr,

    /// User part of our own URI
    #[arg(long, default_value = "caller")]
    user: String,

    /// Local control port
    #[arg(long, default_value = "5070")]
    control_port: u16,

    /// Local media port
    #[arg(long, default_value = "5006")]
    media_port: u16,

    /// Payload type stamped on media packets (0 = PCMU, 96 = L16)
    #[arg(long, default_value = "0")]
    payload_type: u8,

    /// Packet transmission interval in milliseconds
    ///
    /// Controls pacing of packet transmission. Default 20ms matches
    /// the frame duration for real-time streaming.
    #[arg(short = 't', long, default_value = "20")]
    interval_ms: u64,

    /// How long to wait for a final response to INVITE or BYE
    #[arg(long, default_value = "5000")]
    timeout_ms: u64,

    /// Prometheus metrics bind address (serves `GET /metrics`).
    #[arg(long, default_value = "127.0.0.1:9100")]
    metrics_bind: String,

    /// Coloring
    #[arg(long, value_enum, default_value = "auto")]
    color: ColorArg,
}

/// Capture version number from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    let args = Args::parse();

    init_tracing(args.color.into())?;

    info!("Starting voice call caller v{VERSION}");
    info!("Remote: {}@{}", args.remote_user, args.remote);
    info!("Transmission interval: {}ms", args.interval_ms);
    info!("Metrics bind: {}", args.metrics_bind);

    let mut config = CallConfig {
        local_ip: args.local_ip,
        local_user: args.user.clone(),
        control_port: args.control_port,
        media_port: args.media_port,
        response_timeout: Duration::from_millis(args.timeout_ms),
        ..CallConfig::default()
    };
    config
        .set_media_format(args.payload_type, Duration::from_millis(args.interval_ms))
        .context("unusable payload type / interval combination")?;
    info!(
        "Frame: {} bytes, {} samples (payload type {})",
        config.frame_bytes, config.samples_per_frame, config.payload_type
    );

    let metrics = MetricsContext::new("caller")?;
    let metrics_bind = args.metrics_bind.parse().context("invalid metrics bind")?;
    let _metrics_task = metrics.spawn_metrics_server(metrics_bind);

    let frames = match &args.input {
        Some(path) => {
            info!("Input file: {}", path);
            let data = tokio::fs::read(path)
                .await
                .with_context(|| format!("failed to read {path}"))?;
            chunk_frames(&data, config.frame_bytes)
        }
        None => vec![vec![config.silence_byte(); config.frame_bytes]; args.frames],
    };
    info!(
        "Loaded {} frames ({:.2}s)",
        frames.len(),
        frames.len() as f64 * config.frame_interval.as_secs_f64()
    );

    let hangup = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    let outcome = run_call(&config, args.remote, &args.remote_user, frames, hangup, &metrics).await?;

    if outcome.state == CallerState::Failed {
        let reason = outcome
            .failure
            .map_or_else(|| "unknown".to_string(), |f| f.to_string());
        bail!("call {} failed: {}", outcome.call_id, reason);
    }

    info!(
        "Call {} complete: {} packets sent",
        outcome.call_id,
        outcome.packets_sent()
    );

    Ok(())
}
