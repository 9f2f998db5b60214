//! Media packet framing.
//!
//! Implements the RFC 3550 fixed header for audio streaming without
//! contributing sources or header extensions. Sequence numbers and
//! timestamps are supplied by the caller so framing stays stateless.

use crate::error::{CallError, Result};

/// RTP packet version 2 (as per RFC 3550)
pub const RTP_VERSION: u8 = 2;

/// Size of the fixed header in bytes
pub const HEADER_LEN: usize = 12;

/// Header fields unpacked from a media packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    // ---
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

/// Media packet for audio transmission.
///
/// # Protocol Details
///
/// - Version: Always 2 (RFC 3550)
/// - Padding, extension, CSRC count, marker: always 0 on send
/// - Sequence: Increments by 1 for each packet, wrapping at 65535
/// - Timestamp: Increments by the samples in one frame, wrapping at 2^32
/// - SSRC: Constant for the lifetime of one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPacket {
    // ---
    /// Header fields
    pub header: RtpHeader,

    /// Raw frame bytes
    pub payload: Vec<u8>,
}

impl MediaPacket {
    // ---
    /// Creates a packet with a clean header (no padding/extension/CSRC/marker).
    ///
    /// # Arguments
    ///
    /// * `payload_type` - 7-bit payload type; the high bit is masked off
    /// * `sequence` - Packet sequence number
    /// * `timestamp` - Media timestamp in clock-rate units
    /// * `ssrc` - Synchronization source identifier
    /// * `payload` - Frame bytes
    pub fn new(payload_type: u8, sequence: u16, timestamp: u32, ssrc: u32, payload: Vec<u8>) -> Self {
        // ---
        Self {
            header: RtpHeader {
                version: RTP_VERSION,
                padding: false,
                extension: false,
                csrc_count: 0,
                marker: false,
                payload_type: payload_type & 0x7F,
                sequence,
                timestamp,
                ssrc,
            },
            payload,
        }
    }

    pub fn sequence(&self) -> u16 {
        self.header.sequence
    }

    pub fn timestamp(&self) -> u32 {
        self.header.timestamp
    }

    pub fn ssrc(&self) -> u32 {
        self.header.ssrc
    }

    /// Serializes the packet into wire format.
    ///
    /// # Wire Format
    ///
    /// ```text
    ///  0                   1                   2                   3
    ///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |V=2|P|X|  CC   |M|     PT      |       sequence number         |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |                           timestamp                           |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |           synchronization source (SSRC) identifier            |
    /// +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
    /// |                           payload...                          |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// ```
    pub fn serialize(&self) -> Vec<u8> {
        // ---
        let h = &self.header;
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());

        // Byte 0: V(2) | P(1) | X(1) | CC(4)
        buf.push(
            (h.version << 6)
                | ((h.padding as u8) << 5)
                | ((h.extension as u8) << 4)
                | (h.csrc_count & 0x0F),
        );

        // Byte 1: M(1) | PT(7)
        buf.push(((h.marker as u8) << 7) | (h.payload_type & 0x7F));

        buf.extend_from_slice(&h.sequence.to_be_bytes());
        buf.extend_from_slice(&h.timestamp.to_be_bytes());
        buf.extend_from_slice(&h.ssrc.to_be_bytes());
        buf.extend_from_slice(&self.payload);

        buf
    }

    /// Parses a packet from wire format, copying the payload.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::MalformedPacket`] if the datagram is shorter
    /// than the fixed header.
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        // ---
        let (header, payload) = deframe(data)?;
        Ok(Self {
            header,
            payload: payload.to_vec(),
        })
    }
}

/// Builds the wire bytes for one frame.
///
/// Pure and deterministic: the same inputs always yield the same bytes.
pub fn packetize(payload_type: u8, frame: &[u8], sequence: u16, timestamp: u32, ssrc: u32) -> Vec<u8> {
    // ---
    MediaPacket::new(payload_type, sequence, timestamp, ssrc, frame.to_vec()).serialize()
}

/// Splits a datagram into header fields and payload.
///
/// Only the length is validated; version checks are left to the receiver.
///
/// # Errors
///
/// Returns [`CallError::MalformedPacket`] if `data` is shorter than 12 bytes.
pub fn deframe(data: &[u8]) -> Result<(RtpHeader, &[u8])> {
    // ---
    if data.len() < HEADER_LEN {
        return Err(CallError::MalformedPacket(format!(
            "packet too small: {} bytes",
            data.len()
        )));
    }

    let header = RtpHeader {
        version: (data[0] >> 6) & 0x03,
        padding: (data[0] >> 5) & 0x01 == 1,
        extension: (data[0] >> 4) & 0x01 == 1,
        csrc_count: data[0] & 0x0F,
        marker: (data[1] >> 7) & 0x01 == 1,
        payload_type: data[1] & 0x7F,
        sequence: u16::from_be_bytes([data[2], data[3]]),
        timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
    };

    Ok((header, &data[HEADER_LEN..]))
}

/// Per-session send counters.
///
/// Owned by the task running the send loop; advanced once per packet.
#[derive(Debug, Clone)]
pub struct MediaCounters {
    // ---
    pub ssrc: u32,
    pub sequence: u16,
    pub timestamp: u32,
    samples_per_frame: u32,
}

impl MediaCounters {
    // ---
    /// Starts a session at sequence 0, timestamp 0.
    pub fn new(ssrc: u32, samples_per_frame: u32) -> Self {
        // ---
        Self {
            ssrc,
            sequence: 0,
            timestamp: 0,
            samples_per_frame,
        }
    }

    /// Frames `frame` with the current counters, then advances them.
    pub fn next_packet(&mut self, payload_type: u8, frame: &[u8]) -> Vec<u8> {
        // ---
        let bytes = packetize(payload_type, frame, self.sequence, self.timestamp, self.ssrc);
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(self.samples_per_frame);
        bytes
    }

    /// Timestamp of the most recently framed packet.
    pub fn last_timestamp(&self) -> u32 {
        // ---
        self.timestamp.wrapping_sub(self.samples_per_frame)
    }
}
