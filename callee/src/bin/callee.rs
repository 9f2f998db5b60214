//! Voice call callee - CLI binary.
//!
//! Answers one incoming call, plays its media out at the frame cadence,
//! and optionally writes the received payload bytes to a raw file.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use callee::{playout, CalleeEndpoint, JitterBuffer};
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

/// Voice Call Callee - Answer a call and play out its audio
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    // ---
    /// Local IP to bind and advertise
    #[arg(long, default_value = "127.0.0.1")]
    local_ip: IpAddr,

    /// User part of our own URI
    #[arg(long, default_value = "callee")]
    user: String,

    /// Control port to listen on
    #[arg(short, long, default_value = "5060")]
    port: u16,

    /// Media port to listen on (reports arrive on media + 1)
    #[arg(short, long, default_value = "5004")]
    media_port: u16,

    /// Write received payload bytes to this raw file
    #[arg(short, long)]
    output: Option<String>,

    /// Jitter buffer capacity in packets
    #[arg(short = 'b', long, default_value = "100")]
    buffer_packets: usize,

    /// Playout interval in milliseconds
    #[arg(short = 't', long, default_value = "20")]
    interval_ms: u64,

    /// Prometheus metrics bind address (serves `GET /metrics`).
    #[arg(long, default_value = "127.0.0.1:9200")]
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
    info!("Starting voice call callee v{VERSION}");
    info!("Control port: {}, media port: {}", args.port, args.media_port);
    info!("Jitter buffer capacity: {} packets", args.buffer_packets);
    info!("Metrics bind: {}", args.metrics_bind);

    let mut config = CallConfig {
        local_ip: args.local_ip,
        local_user: args.user.clone(),
        control_port: args.port,
        media_port: args.media_port,
        jitter_capacity: args.buffer_packets,
        ..CallConfig::default()
    };
    let payload_type = config.payload_type;
    config
        .set_media_format(payload_type, Duration::from_millis(args.interval_ms))
        .context("unusable playout interval")?;

    let metrics = MetricsContext::new("callee")?;
    let metrics_bind = args.metrics_bind.parse().context("invalid metrics bind")?;
    let _metrics_task = metrics.spawn_metrics_server(metrics_bind);

    let sink = match &args.output {
        Some(path) => {
            info!("Output file: {}", path);
            let file = tokio::fs::File::create(path)
                .await
                .with_context(|| format!("failed to create {path}"))?;
            Some(tokio::io::BufWriter::new(file))
        }
        None => None,
    };

    let endpoint = CalleeEndpoint::bind(&config, metrics.clone()).await?;
    let jitter = Arc::new(JitterBuffer::new(config.jitter_capacity));

    let (stop_tx, stop_rx) = watch::channel(false);
    let player = tokio::spawn(playout(
        Arc::clone(&jitter),
        config.frame_interval,
        sink,
        stop_rx,
    ));

    info!("Ready to receive a call...");

    let served = tokio::select! {
        summary = endpoint.serve_call(Arc::clone(&jitter)) => Some(summary?),
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted before the call ended");
            None
        }
    };

    let _ = stop_tx.send(true);
    let played = player.await.context("playout task failed")??;

    if let Some(summary) = served {
        info!(
            "Call {} {}: {} packets queued, {} dropped, {} sender reports",
            summary
                .call_id
                .as_ref()
                .map_or_else(|| "-".to_string(), ToString::to_string),
            summary.state,
            summary.packets_queued,
            summary.packets_dropped,
            summary.sender_reports
        );
    }
    info!(
        "Played {} frames ({} bytes, {} underruns)",
        played.frames_played, played.bytes_written, played.underruns
    );

    Ok(())
}
