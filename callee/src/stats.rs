//! Arrival statistics for the media receiver.
//!
//! Tracks loss, reordering, duplicates and interarrival jitter from the
//! sequence numbers and timestamps of arriving packets. Runs beside the
//! FIFO jitter buffer and never holds a packet back.

use std::time::{Duration, Instant};
use tracing::info;

use voice_call_common::rtcp::ReportBlock;
use voice_call_common::RtpHeader;

/// Sequence distance beyond which a packet counts as behind, not ahead.
const MAX_FORWARD_JUMP: u16 = 0x8000;

/// Width of the duplicate-detection window, in sequence numbers.
const WINDOW: u16 = 64;

/// How one arrival relates to what came before.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// First packet, or the next sequence number
    InOrder,

    /// Ahead of the expected sequence; `skipped` numbers have not arrived
    Gap { skipped: u16 },

    /// Behind the highest sequence seen, and new
    Reordered,

    /// Already seen
    Duplicate,
}

/// Network and reception statistics.
///
/// Tracks key metrics for monitoring receiver health and network conditions.
/// Statistics are designed to be logged periodically for observability.
#[derive(Debug, Clone)]
pub struct ReceiverStats {
    // ---
    /// Total packets received, duplicates included
    pub packets_received: u64,

    /// Packets that arrived behind a later sequence number
    pub packets_reordered: u64,

    /// Packets seen more than once
    pub packets_duplicate: u64,

    /// Sequence numbers skipped over when a later packet arrived
    pub packets_skipped: u64,

    /// SSRC of the stream being tracked
    source_ssrc: Option<u32>,

    /// Extended (cycle-counting) sequence numbers
    base_sequence: u32,
    highest_sequence: u32,

    /// Bit `i` set means `highest - i` has arrived
    window: u64,

    /// Unique packets received
    unique_received: u64,

    /// RFC 3550 interarrival jitter, in timestamp units
    jitter: f64,
    last_transit: Option<u32>,
    clock_rate: u32,

    /// Snapshot at the previous report, for fraction lost
    expected_prior: u64,
    received_prior: u64,

    /// Start time for rate calculations
    start_time: Instant,

    /// Last time stats were logged
    last_log_time: Instant,

    /// Interval between periodic logs
    log_interval: Duration,
}

impl ReceiverStats {
    // ---
    /// Creates a new stats tracker.
    ///
    /// # Arguments
    ///
    /// * `clock_rate` - Media clock rate, used to express jitter in timestamp units
    /// * `log_interval` - How often to automatically log stats
    pub fn new(clock_rate: u32, log_interval: Duration) -> Self {
        // ---
        let now = Instant::now();
        Self {
            packets_received: 0,
            packets_reordered: 0,
            packets_duplicate: 0,
            packets_skipped: 0,
            source_ssrc: None,
            base_sequence: 0,
            highest_sequence: 0,
            window: 0,
            unique_received: 0,
            jitter: 0.0,
            last_transit: None,
            clock_rate,
            expected_prior: 0,
            received_prior: 0,
            start_time: now,
            last_log_time: now,
            log_interval,
        }
    }

    /// Records a packet that arrived now.
    pub fn record_packet(&mut self, header: &RtpHeader) -> Arrival {
        // ---
        self.record_packet_at(header, Instant::now())
    }

    /// Records a packet that arrived at `arrival`.
    pub fn record_packet_at(&mut self, header: &RtpHeader, arrival: Instant) -> Arrival {
        // ---
        self.packets_received += 1;

        let outcome = match self.source_ssrc {
            None => {
                self.source_ssrc = Some(header.ssrc);
                self.base_sequence = header.sequence as u32;
                self.highest_sequence = header.sequence as u32;
                self.window = 1;
                Arrival::InOrder
            }
            Some(_) => self.classify(header.sequence),
        };

        match outcome {
            Arrival::Duplicate => self.packets_duplicate += 1,
            Arrival::Reordered => self.packets_reordered += 1,
            Arrival::Gap { skipped } => self.packets_skipped += skipped as u64,
            Arrival::InOrder => {}
        }

        if outcome != Arrival::Duplicate {
            self.unique_received += 1;
            self.update_jitter(header.timestamp, arrival);
        }

        self.maybe_log();
        outcome
    }

    /// Places `sequence` relative to the highest sequence seen.
    fn classify(&mut self, sequence: u16) -> Arrival {
        // ---
        let highest = self.highest_sequence as u16;
        let ahead = sequence.wrapping_sub(highest);

        if ahead == 0 {
            return Arrival::Duplicate;
        }

        if ahead < MAX_FORWARD_JUMP {
            // Extended sequence keeps counting across 16-bit wraps
            self.highest_sequence = self.highest_sequence.wrapping_add(ahead as u32);
            self.window = if ahead >= WINDOW {
                1
            } else {
                (self.window << ahead) | 1
            };
            return match ahead - 1 {
                0 => Arrival::InOrder,
                skipped => Arrival::Gap { skipped },
            };
        }

        let behind = highest.wrapping_sub(sequence);
        if behind < WINDOW {
            let bit = 1u64 << behind;
            if self.window & bit != 0 {
                return Arrival::Duplicate;
            }
            self.window |= bit;

            // Older than the first arrival: the expected range starts here now
            let span = self.highest_sequence.wrapping_sub(self.base_sequence);
            let behind = behind as u32;
            if behind > span && behind <= self.highest_sequence {
                self.base_sequence = self.highest_sequence - behind;
            }
        }
        Arrival::Reordered
    }

    /// Updates the RFC 3550 jitter estimate: `J += (|D| - J) / 16`.
    fn update_jitter(&mut self, timestamp: u32, arrival: Instant) {
        // ---
        let elapsed = arrival.saturating_duration_since(self.start_time);
        let arrival_units = (elapsed.as_secs_f64() * self.clock_rate as f64) as u64 as u32;
        let transit = arrival_units.wrapping_sub(timestamp);

        if let Some(last) = self.last_transit {
            let d = (transit.wrapping_sub(last) as i32).unsigned_abs() as f64;
            self.jitter += (d - self.jitter) / 16.0;
        }
        self.last_transit = Some(transit);
    }

    /// Packets expected from the first to the highest sequence seen.
    pub fn expected(&self) -> u64 {
        // ---
        if self.source_ssrc.is_none() {
            return 0;
        }
        self.highest_sequence.wrapping_sub(self.base_sequence) as u64 + 1
    }

    /// Expected packets that never arrived (never negative).
    pub fn cumulative_lost(&self) -> u64 {
        // ---
        self.expected().saturating_sub(self.unique_received)
    }

    /// Extended highest sequence number seen.
    pub fn highest_sequence(&self) -> Option<u32> {
        // ---
        self.source_ssrc.map(|_| self.highest_sequence)
    }

    /// Current interarrival jitter, in timestamp units.
    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    /// Calculates current packet loss percentage.
    pub fn loss_percentage(&self) -> f64 {
        // ---
        let expected = self.expected();
        if expected == 0 {
            0.0
        } else {
            (self.cumulative_lost() as f64 / expected as f64) * 100.0
        }
    }

    /// Calculates reorder percentage.
    pub fn reorder_percentage(&self) -> f64 {
        // ---
        if self.packets_received == 0 {
            0.0
        } else {
            (self.packets_reordered as f64 / self.packets_received as f64) * 100.0
        }
    }

    /// Calculates packets per second reception rate.
    pub fn packets_per_second(&self) -> f64 {
        // ---
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            0.0
        } else {
            self.packets_received as f64 / elapsed
        }
    }

    /// Builds a report block and starts a new fraction-lost interval.
    ///
    /// Returns `None` until a packet has been seen.
    pub fn report_block(&mut self) -> Option<ReportBlock> {
        // ---
        let source_ssrc = self.source_ssrc?;

        let expected = self.expected();
        let expected_interval = expected - self.expected_prior;
        let received_interval = self.unique_received - self.received_prior;
        let lost_interval = expected_interval.saturating_sub(received_interval);
        self.expected_prior = expected;
        self.received_prior = self.unique_received;

        let fraction_lost = if expected_interval == 0 {
            0
        } else {
            ((lost_interval << 8) / expected_interval).min(255) as u8
        };

        Some(ReportBlock {
            source_ssrc,
            fraction_lost,
            cumulative_lost: self.cumulative_lost().min(u32::MAX as u64) as u32,
            highest_sequence: self.highest_sequence,
            jitter: self.jitter as u32,
        })
    }

    /// Logs statistics if interval has elapsed.
    fn maybe_log(&mut self) {
        // ---
        if self.last_log_time.elapsed() >= self.log_interval {
            self.log();
            self.last_log_time = Instant::now();
        }
    }

    /// Force log current statistics.
    pub fn log(&self) {
        // ---
        info!(
            "RX Stats: {} pkts ({:.2} pkt/s), {:.2}% loss, {:.2}% reordered, {} duplicate, jitter {:.1}",
            self.packets_received,
            self.packets_per_second(),
            self.loss_percentage(),
            self.reorder_percentage(),
            self.packets_duplicate,
            self.jitter
        );
    }
}

impl Default for ReceiverStats {
    fn default() -> Self {
        // ---
        Self::new(8000, Duration::from_secs(5))
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use voice_call_common::MediaPacket;

    fn header(seq: u16) -> RtpHeader {
        MediaPacket::new(0, seq, seq as u32 * 160, 0x12345678, Vec::new()).header
    }

    fn record_all(stats: &mut ReceiverStats, seqs: &[u16]) -> Vec<Arrival> {
        seqs.iter().map(|s| stats.record_packet(&header(*s))).collect()
    }

    #[test]
    fn test_stats_no_loss() {
        // ---
        let mut stats = ReceiverStats::default();
        record_all(&mut stats, &[0, 1, 2]);

        assert_eq!(stats.packets_received, 3);
        assert_eq!(stats.cumulative_lost(), 0);
        assert_eq!(stats.loss_percentage(), 0.0);
        assert_eq!(stats.highest_sequence(), Some(2));
    }

    #[test]
    fn test_stats_with_loss() {
        // ---
        let mut stats = ReceiverStats::default();
        let arrivals = record_all(&mut stats, &[0, 1, 5]);

        assert_eq!(arrivals[2], Arrival::Gap { skipped: 3 });
        assert_eq!(stats.cumulative_lost(), 3); // Packets 2, 3, 4
        assert_eq!(stats.loss_percentage(), 50.0); // 3 lost out of 6 expected
    }

    #[test]
    fn test_late_arrival_fills_gap() {
        // ---
        let mut stats = ReceiverStats::default();
        let arrivals = record_all(&mut stats, &[0, 2, 1]);

        assert_eq!(arrivals, vec![Arrival::InOrder, Arrival::Gap { skipped: 1 }, Arrival::Reordered]);
        assert_eq!(stats.packets_reordered, 1);
        assert_eq!(stats.cumulative_lost(), 0);

        let expected = 100.0 / 3.0;
        let actual = stats.reorder_percentage();
        assert!(
            (actual - expected).abs() < 0.001,
            "Expected ~{}, got {}",
            expected,
            actual
        );
    }

    #[test]
    fn test_arrival_before_first_lowers_base() {
        // ---
        let mut stats = ReceiverStats::default();
        let arrivals = record_all(&mut stats, &[5, 6, 3]);

        assert_eq!(arrivals[2], Arrival::Reordered);
        assert_eq!(stats.expected(), 4); // 3 through 6
        assert_eq!(stats.cumulative_lost(), 1); // 4 never came
        assert_eq!(stats.highest_sequence(), Some(6));

        // Filling the hole clears the loss
        record_all(&mut stats, &[4]);
        assert_eq!(stats.expected(), 4);
        assert_eq!(stats.cumulative_lost(), 0);
    }

    #[test]
    fn test_duplicates_are_detected() {
        // ---
        let mut stats = ReceiverStats::default();
        let arrivals = record_all(&mut stats, &[0, 1, 1, 2, 0]);

        assert_eq!(arrivals[2], Arrival::Duplicate);
        assert_eq!(arrivals[4], Arrival::Duplicate);
        assert_eq!(stats.packets_duplicate, 2);
        assert_eq!(stats.cumulative_lost(), 0);
    }

    #[test]
    fn test_sequence_wraparound() {
        // ---
        let mut stats = ReceiverStats::default();
        record_all(&mut stats, &[65534, 65535, 0]);

        assert_eq!(stats.packets_received, 3);
        assert_eq!(stats.cumulative_lost(), 0);
        assert_eq!(stats.highest_sequence(), Some(65536));
    }

    #[test]
    fn test_report_block_fraction_lost() {
        // ---
        let mut stats = ReceiverStats::default();
        assert!(stats.report_block().is_none());

        record_all(&mut stats, &[0, 1, 3]); // 2 missing: 1 of 4
        let block = stats.report_block().unwrap();
        assert_eq!(block.source_ssrc, 0x12345678);
        assert_eq!(block.fraction_lost, 64);
        assert_eq!(block.cumulative_lost, 1);
        assert_eq!(block.highest_sequence, 3);

        record_all(&mut stats, &[4, 5]); // Clean interval
        let block = stats.report_block().unwrap();
        assert_eq!(block.fraction_lost, 0);
        assert_eq!(block.cumulative_lost, 1);
    }

    #[test]
    fn test_jitter_zero_for_perfect_pacing() {
        // ---
        let mut stats = ReceiverStats::new(8000, Duration::from_secs(60));
        let start = stats.start_time;

        // 160 samples at 8 kHz = 20 ms per packet
        for seq in 0..10u16 {
            let arrival = start + Duration::from_millis(20 * seq as u64);
            stats.record_packet_at(&header(seq), arrival);
        }
        assert!(stats.jitter() < 1.0, "jitter {}", stats.jitter());
    }

    #[test]
    fn test_jitter_grows_with_irregular_arrivals() {
        // ---
        let mut stats = ReceiverStats::new(8000, Duration::from_secs(60));
        let start = stats.start_time;

        for seq in 0..20u16 {
            let wobble = if seq % 2 == 0 { 0 } else { 15 };
            let arrival = start + Duration::from_millis(20 * seq as u64 + wobble);
            stats.record_packet_at(&header(seq), arrival);
        }
        assert!(stats.jitter() > 10.0, "jitter {}", stats.jitter());
    }
}
