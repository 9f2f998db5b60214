//! Call configuration.
//!
//! One `CallConfig` is built by each binary (or test) and handed to the
//! session at construction. Nothing in the workspace reads process-wide
//! mutable settings.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::error::{CallError, Result};

/// Default control (signaling) port.
pub const DEFAULT_CONTROL_PORT: u16 = 5060;

/// Default media port. Should be even; the report channel uses `media + 1`.
pub const DEFAULT_MEDIA_PORT: u16 = 5004;

/// Payload type for G.711 mu-law.
pub const PAYLOAD_TYPE_PCMU: u8 = 0;

/// Payload type used for 16-bit linear PCM.
pub const PAYLOAD_TYPE_L16: u8 = 96;

/// Codec entry advertised in session descriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Codec {
    // ---
    /// 7-bit payload type carried in media packets
    pub payload_type: u8,

    /// Encoding name (e.g. `PCMU`)
    pub name: String,

    /// Media clock rate in Hz
    pub clock_rate: u32,

    /// Channel count
    pub channels: u8,
}

impl Codec {
    // ---
    pub fn new(payload_type: u8, name: &str, clock_rate: u32, channels: u8) -> Self {
        // ---
        Self {
            payload_type,
            name: name.to_string(),
            clock_rate,
            channels,
        }
    }

    /// Bytes one sample takes on the wire: two for 16-bit linear PCM,
    /// one for the companded G.711 laws.
    pub fn bytes_per_sample(&self) -> usize {
        // ---
        if self.name.eq_ignore_ascii_case("L16") {
            2
        } else {
            1
        }
    }
}

/// Configuration for one endpoint of a call.
///
/// Defaults describe narrowband telephony: 8 kHz mu-law, 20 ms frames
/// (160 samples, 160 bytes), paced at 50 packets per second.
#[derive(Debug, Clone)]
pub struct CallConfig {
    // ---
    /// Address placed in Via/From/Contact headers and the SDP connection line
    pub local_ip: IpAddr,

    /// User part of this endpoint's SIP URI
    pub local_user: String,

    /// Port for control messages (0 picks an ephemeral port)
    pub control_port: u16,

    /// Port for media packets (0 picks an ephemeral port)
    pub media_port: u16,

    /// Peer media port assumed when its answer carries no session description
    pub remote_media_port: u16,

    /// Payload type stamped on every outgoing media packet
    pub payload_type: u8,

    /// Codecs advertised in session descriptions
    pub codecs: Vec<Codec>,

    /// Media clock ticks represented by one frame
    pub samples_per_frame: u32,

    /// Payload bytes in one full frame; a short final frame is padded to this
    pub frame_bytes: usize,

    /// Wall-clock duration of one frame
    pub frame_interval: Duration,

    /// How long to wait for a response to INVITE or BYE
    pub response_timeout: Duration,

    /// Jitter buffer capacity in packets
    pub jitter_capacity: usize,

    /// Emit one sender report every this many media packets
    pub report_interval_packets: u32,

    /// After BYE, how long the callee waits for queued media to drain
    pub drain_grace: Duration,

    /// Receive buffer size for control and media datagrams
    pub max_datagram: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        // ---
        Self {
            local_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            local_user: "caller".to_string(),
            control_port: DEFAULT_CONTROL_PORT,
            media_port: DEFAULT_MEDIA_PORT,
            remote_media_port: DEFAULT_MEDIA_PORT,
            payload_type: PAYLOAD_TYPE_PCMU,
            codecs: vec![
                Codec::new(PAYLOAD_TYPE_PCMU, "PCMU", 8000, 1),
                Codec::new(PAYLOAD_TYPE_L16, "L16", 8000, 1),
            ],
            samples_per_frame: 160,
            frame_bytes: 160,
            frame_interval: Duration::from_millis(20),
            response_timeout: Duration::from_secs(5),
            jitter_capacity: 100,
            report_interval_packets: 250, // ~5s at 20ms per frame
            drain_grace: Duration::from_millis(500),
            max_datagram: 2048,
        }
    }
}

impl CallConfig {
    // ---
    /// Control socket bind address.
    pub fn control_addr(&self) -> SocketAddr {
        // ---
        SocketAddr::new(self.local_ip, self.control_port)
    }

    /// Media socket bind address.
    pub fn media_addr(&self) -> SocketAddr {
        // ---
        SocketAddr::new(self.local_ip, self.media_port)
    }

    /// Report channel port paired with a media port.
    pub fn report_port_for(media_port: u16) -> u16 {
        // ---
        media_port.wrapping_add(1)
    }

    /// Codec entry for the configured payload type, if advertised.
    pub fn active_codec(&self) -> Option<&Codec> {
        // ---
        self.codecs
            .iter()
            .find(|c| c.payload_type == self.payload_type)
    }

    /// Selects the payload type and frame duration together.
    ///
    /// `samples_per_frame` and `frame_bytes` are derived from the codec so
    /// the media timestamp always advances by the samples one frame holds.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::InvalidConfig`] if the payload type is not
    /// advertised, or the interval is not a whole, non-zero number of
    /// samples at the codec's clock rate.
    pub fn set_media_format(&mut self, payload_type: u8, frame_interval: Duration) -> Result<()> {
        // ---
        let codec = self
            .codecs
            .iter()
            .find(|c| c.payload_type == payload_type)
            .ok_or_else(|| {
                CallError::InvalidConfig(format!("payload type {payload_type} is not advertised"))
            })?;

        let ticks = codec.clock_rate as u128 * frame_interval.as_micros();
        if ticks == 0 || ticks % 1_000_000 != 0 {
            return Err(CallError::InvalidConfig(format!(
                "{frame_interval:?} is not a whole number of samples at {} Hz",
                codec.clock_rate
            )));
        }
        let samples = u32::try_from(ticks / 1_000_000).map_err(|_| {
            CallError::InvalidConfig(format!("{frame_interval:?} is too long for one frame"))
        })?;

        self.frame_bytes = samples as usize * codec.channels as usize * codec.bytes_per_sample();
        self.samples_per_frame = samples;
        self.payload_type = payload_type;
        self.frame_interval = frame_interval;
        Ok(())
    }

    /// Byte used to pad a short final frame: mu-law silence for PCMU,
    /// zero for linear formats.
    pub fn silence_byte(&self) -> u8 {
        // ---
        if self.payload_type == PAYLOAD_TYPE_PCMU {
            0xFF
        } else {
            0x00
        }
    }

    /// Configuration bound entirely to ephemeral loopback ports.
    ///
    /// Used by tests so several endpoints can run side by side.
    pub fn ephemeral(local_user: &str) -> Self {
        // ---
        Self {
            local_user: local_user.to_string(),
            control_port: 0,
            media_port: 0,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn default_frame_matches_narrowband_cadence() {
        // ---
        let config = CallConfig::default();
        let active = config.active_codec().expect("PCMU advertised");

        assert_eq!(active.name, "PCMU");
        let frames_per_second = 1000 / config.frame_interval.as_millis() as u32;
        assert_eq!(config.samples_per_frame * frames_per_second, active.clock_rate);
    }

    #[test]
    fn media_format_derives_frame_from_codec() {
        // ---
        let mut config = CallConfig::default();

        config
            .set_media_format(PAYLOAD_TYPE_L16, Duration::from_millis(20))
            .unwrap();
        assert_eq!(config.samples_per_frame, 160);
        assert_eq!(config.frame_bytes, 320);
        assert_eq!(config.silence_byte(), 0x00);

        config
            .set_media_format(PAYLOAD_TYPE_PCMU, Duration::from_millis(10))
            .unwrap();
        assert_eq!(config.samples_per_frame, 80);
        assert_eq!(config.frame_bytes, 80);
        assert_eq!(config.frame_interval, Duration::from_millis(10));
    }

    #[test]
    fn default_frame_matches_its_own_media_format() {
        // ---
        let default = CallConfig::default();
        let mut derived = CallConfig::default();
        derived
            .set_media_format(default.payload_type, default.frame_interval)
            .unwrap();

        assert_eq!(derived.samples_per_frame, default.samples_per_frame);
        assert_eq!(derived.frame_bytes, default.frame_bytes);
    }

    #[test]
    fn unusable_media_format_is_rejected() {
        // ---
        let mut config = CallConfig::default();

        let unknown = config.set_media_format(8, Duration::from_millis(20));
        assert!(matches!(unknown, Err(CallError::InvalidConfig(_))));

        let zero = config.set_media_format(PAYLOAD_TYPE_PCMU, Duration::ZERO);
        assert!(matches!(zero, Err(CallError::InvalidConfig(_))));

        // 8000 Hz * 0.1 ms is not a whole sample
        let fractional = config.set_media_format(PAYLOAD_TYPE_PCMU, Duration::from_micros(100));
        assert!(matches!(fractional, Err(CallError::InvalidConfig(_))));

        // Nothing changed on failure
        assert_eq!(config.payload_type, PAYLOAD_TYPE_PCMU);
        assert_eq!(config.frame_bytes, 160);
    }

    #[test]
    fn report_port_is_media_plus_one() {
        // ---
        assert_eq!(CallConfig::report_port_for(5004), 5005);
    }

    #[test]
    fn silence_depends_on_payload_type() {
        // ---
        let mut config = CallConfig::default();
        assert_eq!(config.silence_byte(), 0xFF);

        config.payload_type = PAYLOAD_TYPE_L16;
        assert_eq!(config.silence_byte(), 0x00);
    }

    #[test]
    fn ephemeral_config_uses_port_zero() {
        // ---
        let config = CallConfig::ephemeral("callee");
        assert_eq!(config.control_addr().port(), 0);
        assert_eq!(config.media_addr().port(), 0);
        assert_eq!(config.local_user, "callee");
    }
}
