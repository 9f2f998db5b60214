//! Transport statistics reports (RFC 3550 §6.4).
//!
//! Sender reports carry wall-clock/media-clock correlation plus send
//! counters. Receiver reports carry one report block describing loss and
//! jitter for a single source. Both builders are stateless.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{CallError, Result};

/// Packet type for sender reports.
pub const PT_SENDER_REPORT: u8 = 200;

/// Packet type for receiver reports.
pub const PT_RECEIVER_REPORT: u8 = 201;

/// Seconds between 1900-01-01 (NTP epoch) and 1970-01-01 (Unix epoch).
pub const NTP_EPOCH_OFFSET: u64 = 2_208_988_800;

/// Sender report length: 8-byte header + 20-byte sender info.
pub const SENDER_REPORT_LEN: usize = 28;

/// Receiver report length: 8-byte header + one 24-byte report block.
pub const RECEIVER_REPORT_LEN: usize = 32;

/// 64-bit NTP timestamp split into whole seconds and a 2^-32 fraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NtpTimestamp {
    pub seconds: u32,
    pub fraction: u32,
}

impl NtpTimestamp {
    // ---
    /// Converts a wall-clock instant to NTP format.
    ///
    /// Times before the Unix epoch clamp to the epoch itself.
    pub fn from_system_time(time: SystemTime) -> Self {
        // ---
        let since_unix = time.duration_since(UNIX_EPOCH).unwrap_or_default();
        let seconds = (since_unix.as_secs() + NTP_EPOCH_OFFSET) as u32;
        let fraction = ((since_unix.subsec_nanos() as u64) << 32) / 1_000_000_000;

        Self {
            seconds,
            fraction: fraction as u32,
        }
    }

    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }
}

/// Fields of a sender report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderReport {
    // ---
    pub ssrc: u32,
    pub ntp: NtpTimestamp,
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
}

impl SenderReport {
    // ---
    /// Serializes into the 28-byte wire layout.
    ///
    /// ```text
    /// byte 0   : 0x80 (V=2, P=0, RC=0)
    /// byte 1   : 200  (SR)
    /// byte 2-3 : length in 32-bit words minus one (6)
    /// then ssrc, NTP seconds, NTP fraction, RTP timestamp,
    /// packet count, octet count (4 bytes each, big-endian)
    /// ```
    pub fn serialize(&self) -> Vec<u8> {
        // ---
        let mut buf = Vec::with_capacity(SENDER_REPORT_LEN);
        buf.push(0x80);
        buf.push(PT_SENDER_REPORT);
        buf.extend_from_slice(&length_words(SENDER_REPORT_LEN).to_be_bytes());
        buf.extend_from_slice(&self.ssrc.to_be_bytes());
        buf.extend_from_slice(&self.ntp.seconds.to_be_bytes());
        buf.extend_from_slice(&self.ntp.fraction.to_be_bytes());
        buf.extend_from_slice(&self.rtp_timestamp.to_be_bytes());
        buf.extend_from_slice(&self.packet_count.to_be_bytes());
        buf.extend_from_slice(&self.octet_count.to_be_bytes());
        buf
    }

    /// Parses a sender report received on the report channel.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::MalformedPacket`] on short input, a version other
    /// than 2, or a packet type other than SR.
    pub fn parse(data: &[u8]) -> Result<Self> {
        // ---
        if data.len() < SENDER_REPORT_LEN {
            return Err(CallError::MalformedPacket(format!(
                "sender report too small: {} bytes",
                data.len()
            )));
        }
        if data[0] >> 6 != 2 {
            return Err(CallError::MalformedPacket(format!(
                "invalid report version: {}",
                data[0] >> 6
            )));
        }
        if data[1] != PT_SENDER_REPORT {
            return Err(CallError::MalformedPacket(format!(
                "not a sender report: packet type {}",
                data[1]
            )));
        }

        let word = |i: usize| u32::from_be_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);

        Ok(Self {
            ssrc: word(4),
            ntp: NtpTimestamp {
                seconds: word(8),
                fraction: word(12),
            },
            rtp_timestamp: word(16),
            packet_count: word(20),
            octet_count: word(24),
        })
    }
}

/// Builds a sender report stamped with the current wall-clock time.
///
/// Always returns exactly [`SENDER_REPORT_LEN`] bytes beginning with `0x80`.
pub fn build_sender_report(ssrc: u32, last_timestamp: u32, packet_count: u32, octet_count: u32) -> Vec<u8> {
    // ---
    SenderReport {
        ssrc,
        ntp: NtpTimestamp::now(),
        rtp_timestamp: last_timestamp,
        packet_count,
        octet_count,
    }
    .serialize()
}

/// Reception statistics for one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportBlock {
    // ---
    /// Source being reported on
    pub source_ssrc: u32,

    /// Fraction lost since the previous report, scaled to 0-255
    pub fraction_lost: u8,

    /// Cumulative packets lost (24-bit, clamped)
    pub cumulative_lost: u32,

    /// Extended highest sequence number received
    pub highest_sequence: u32,

    /// Interarrival jitter in timestamp units
    pub jitter: u32,
}

/// Builds a receiver report with a single report block.
///
/// Last-SR and delay-since-last-SR are written as zero; round-trip
/// estimation is not performed.
pub fn build_receiver_report(reporter_ssrc: u32, block: &ReportBlock) -> Vec<u8> {
    // ---
    let mut buf = Vec::with_capacity(RECEIVER_REPORT_LEN);
    buf.push(0x81); // V=2, P=0, RC=1
    buf.push(PT_RECEIVER_REPORT);
    buf.extend_from_slice(&length_words(RECEIVER_REPORT_LEN).to_be_bytes());
    buf.extend_from_slice(&reporter_ssrc.to_be_bytes());

    buf.extend_from_slice(&block.source_ssrc.to_be_bytes());
    let lost = block.cumulative_lost.min(0x00FF_FFFF);
    buf.push(block.fraction_lost);
    buf.extend_from_slice(&lost.to_be_bytes()[1..]);
    buf.extend_from_slice(&block.highest_sequence.to_be_bytes());
    buf.extend_from_slice(&block.jitter.to_be_bytes());
    buf.extend_from_slice(&0u32.to_be_bytes()); // LSR
    buf.extend_from_slice(&0u32.to_be_bytes()); // DLSR
    buf
}

/// Length field: size in 32-bit words minus one.
fn length_words(len: usize) -> u16 {
    (len / 4 - 1) as u16
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_sender_report_shape() {
        // ---
        let report = build_sender_report(0x12345678, 640, 5, 800);

        assert_eq!(report.len(), SENDER_REPORT_LEN);
        assert_eq!(report[0], 0x80);
        assert_eq!(report[1], PT_SENDER_REPORT);
        assert_eq!(u16::from_be_bytes([report[2], report[3]]), 6);
    }

    #[test]
    fn test_sender_report_fields_parse_back() {
        // ---
        let report = build_sender_report(0xDEADBEEF, 3200, 20, 3200);
        let parsed = SenderReport::parse(&report).expect("parse failed");

        assert_eq!(parsed.ssrc, 0xDEADBEEF);
        assert_eq!(parsed.rtp_timestamp, 3200);
        assert_eq!(parsed.packet_count, 20);
        assert_eq!(parsed.octet_count, 3200);
    }

    #[test]
    fn test_ntp_conversion() {
        // ---
        let time = UNIX_EPOCH + Duration::from_millis(1_500);
        let ntp = NtpTimestamp::from_system_time(time);

        assert_eq!(ntp.seconds as u64, NTP_EPOCH_OFFSET + 1);
        assert_eq!(ntp.fraction, 1 << 31); // half a second
    }

    #[test]
    fn test_parse_rejects_receiver_report() {
        // ---
        let block = ReportBlock {
            source_ssrc: 1,
            fraction_lost: 0,
            cumulative_lost: 0,
            highest_sequence: 0,
            jitter: 0,
        };
        let rr = build_receiver_report(2, &block);
        assert!(SenderReport::parse(&rr).is_err());
        assert!(SenderReport::parse(&[0x80, 200]).is_err());
    }

    #[test]
    fn test_receiver_report_layout() {
        // ---
        let block = ReportBlock {
            source_ssrc: 0xAABBCCDD,
            fraction_lost: 64,
            cumulative_lost: 0x0100_0005, // clamps to 24 bits
            highest_sequence: 65540,
            jitter: 12,
        };
        let rr = build_receiver_report(0x01020304, &block);

        assert_eq!(rr.len(), RECEIVER_REPORT_LEN);
        assert_eq!(rr[0], 0x81);
        assert_eq!(rr[1], PT_RECEIVER_REPORT);
        assert_eq!(u16::from_be_bytes([rr[2], rr[3]]), 7);
        assert_eq!(&rr[8..12], &0xAABBCCDDu32.to_be_bytes());
        assert_eq!(rr[12], 64);
        assert_eq!(&rr[13..16], &[0xFF, 0xFF, 0xFF]);
        assert_eq!(u32::from_be_bytes([rr[16], rr[17], rr[18], rr[19]]), 65540);
        assert_eq!(u32::from_be_bytes([rr[20], rr[21], rr[22], rr[23]]), 12);
    }
}
