//! Shared building blocks for both ends of a voice call.
//!
//! - [`sip`]: text control messages and session descriptions
//! - [`rtp`]: media packet framing
//! - [`rtcp`]: sender/receiver transport reports
//! - [`config`], [`error`], [`observability`]: ambient plumbing

pub mod config;
pub mod error;
pub mod observability;
pub mod rtcp;
pub mod rtp;
pub mod sip;
pub mod transport;

pub use config::{CallConfig, Codec};
pub use error::{CallError, Result};
pub use observability::{init_tracing, ColorWhen, MetricsContext};
pub use rtp::{deframe, packetize, MediaCounters, MediaPacket, RtpHeader};
pub use transport::ControlSocket;
