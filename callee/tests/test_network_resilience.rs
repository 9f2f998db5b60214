//! Integration tests for the receive path under bad network conditions.
//!
//! Packets flow simulator -> jitter buffer + receiver statistics, the same
//! way the callee's receive loop feeds them.


use callee::{Arrival, JitterBuffer, ReceiverStats};
use network_simulator::{make_packet, NetworkSimulator, NetworkSimulatorConfig};
use std::time::Duration;

/// Feeds every arriving packet to both the buffer and the stats.
fn deliver(
    packets: Vec<voice_call_common::MediaPacket>,
    buffer: &JitterBuffer,
    stats: &mut ReceiverStats,
) -> Vec<u16> {
    // ---
    let mut arrival_order = Vec::new();
    for packet in packets {
        stats.record_packet(&packet.header);
        arrival_order.push(packet.sequence());
        buffer.offer(packet);
    }
    arrival_order
}

/// Tests the buffer plays out in arrival order on a clean network.
#[test]
fn test_perfect_network_keeps_sequence() {
    // ---
    let mut sim = NetworkSimulator::new(NetworkSimulatorConfig::default());
    let buffer = JitterBuffer::new(100);
    let mut stats = ReceiverStats::default();

    for seq in 0..5 {
        sim.send(make_packet(seq));
    }
    deliver(sim.flush(), &buffer, &mut stats);

    for seq in 0..5u16 {
        let packet = buffer.take().expect("packet should be available");
        assert_eq!(packet.sequence(), seq);
        assert_eq!(packet.timestamp(), seq as u32 * 160);
    }
    assert_eq!(stats.cumulative_lost(), 0);
    assert_eq!(stats.highest_sequence(), Some(4));
}

/// Tests reordered packets come out in arrival order, not sequence order.
#[test]
fn test_reordering_is_not_undone_by_buffer() {
    // ---
    let mut sim = NetworkSimulator::new(NetworkSimulatorConfig {
        reorder_rate: 0.3,
        seed: Some(42),
        ..Default::default()
    });
    let buffer = JitterBuffer::new(100);
    let mut stats = ReceiverStats::default();

    for seq in 0..50 {
        sim.send(make_packet(seq));
    }
    let arrival_order = deliver(sim.flush(), &buffer, &mut stats);

    let mut played = Vec::new();
    while let Some(packet) = buffer.take() {
        played.push(packet.sequence());
    }
    assert_eq!(played, arrival_order);

    if sim.stats().packets_reordered > 0 {
        assert!(stats.packets_reordered > 0);
    }
    // Nothing was lost, only moved
    assert_eq!(stats.cumulative_lost(), 0);
    assert_eq!(stats.packets_duplicate, 0);
    // Even when a later packet arrived first
    assert_eq!(stats.expected(), 50);
}

/// Tests loss accounting through a lossy simulated network.
#[test]
fn test_random_loss_is_counted() {
    // ---
    let mut sim = NetworkSimulator::new(NetworkSimulatorConfig {
        loss_rate: 0.1,
        seed: Some(7),
        ..Default::default()
    });
    let buffer = JitterBuffer::new(200);
    let mut stats = ReceiverStats::default();

    for seq in 0..100 {
        sim.send(make_packet(seq));
    }
    let arrived = deliver(sim.flush(), &buffer, &mut stats);

    let first = arrived[0] as u64;
    let last = *arrived.last().unwrap() as u64;
    assert_eq!(stats.expected(), last - first + 1);
    assert_eq!(stats.cumulative_lost(), stats.expected() - arrived.len() as u64);
    assert!(stats.loss_percentage() < 30.0);
    assert_eq!(buffer.len(), arrived.len());
}

/// Tests fraction lost in the report block for a fixed loss pattern.
#[test]
fn test_report_block_fraction_lost() {
    // ---
    let buffer = JitterBuffer::new(200);
    let mut stats = ReceiverStats::default();

    // Every fourth packet goes missing
    let packets = (0..100u16)
        .filter(|seq| seq % 4 != 1)
        .map(make_packet)
        .collect();
    deliver(packets, &buffer, &mut stats);

    let block = stats.report_block().expect("packets were seen");
    assert_eq!(block.source_ssrc, 0x1234_5678);
    assert_eq!(block.cumulative_lost, 25);
    assert_eq!(block.highest_sequence, 99);
    assert_eq!(block.fraction_lost, 64); // 25/100 * 256

    // No new packets: the next interval reports no loss
    let next = stats.report_block().unwrap();
    assert_eq!(next.fraction_lost, 0);
    assert_eq!(next.cumulative_lost, 25);
}

/// Tests duplicates are detected and do not hide loss.
#[test]
fn test_duplicates_are_not_counted_as_received() {
    // ---
    let mut stats = ReceiverStats::default();

    for seq in [0u16, 1, 1, 3, 3, 4] {
        stats.record_packet(&make_packet(seq).header);
    }

    assert_eq!(stats.packets_duplicate, 2);
    assert_eq!(stats.expected(), 5);
    assert_eq!(stats.cumulative_lost(), 1);
}

/// Tests the extended sequence keeps counting across the 16-bit wrap.
#[test]
fn test_sequence_wrap_extends_highest() {
    // ---
    let mut stats = ReceiverStats::default();
    let mut outcomes = Vec::new();

    for i in 0..12u16 {
        let seq = 65530u16.wrapping_add(i);
        outcomes.push(stats.record_packet(&make_packet(seq).header));
    }

    assert!(outcomes.iter().all(|a| *a == Arrival::InOrder));
    assert_eq!(stats.highest_sequence(), Some(65536 + 5));
    assert_eq!(stats.expected(), 12);
    assert_eq!(stats.cumulative_lost(), 0);
}

/// Tests a full buffer drops the newest packets and keeps the oldest.
#[test]
fn test_overflow_drops_newest() {
    // ---
    let mut sim = NetworkSimulator::new(NetworkSimulatorConfig::default());
    let buffer = JitterBuffer::new(10);
    let mut stats = ReceiverStats::default();

    for seq in 0..30 {
        sim.send(make_packet(seq));
    }
    deliver(sim.flush(), &buffer, &mut stats);

    assert_eq!(buffer.len(), 10);
    assert_eq!(buffer.dropped(), 20);
    // Statistics see every arrival, buffered or not
    assert_eq!(stats.packets_received, 30);

    let kept: Vec<u16> = std::iter::from_fn(|| buffer.take())
        .map(|p| p.sequence())
        .collect();
    assert_eq!(kept, (0..10).collect::<Vec<_>>());
}

/// Tests delayed packets eventually arrive and jitter becomes non-zero.
#[test]
fn test_jittered_delivery_raises_jitter_estimate() {
    // ---
    let mut sim = NetworkSimulator::new(NetworkSimulatorConfig {
        jitter_ms: 10,
        seed: Some(42),
        ..Default::default()
    });
    let buffer = JitterBuffer::new(100);
    let mut stats = ReceiverStats::default();

    for seq in 0..20 {
        sim.send(make_packet(seq));
    }

    // Every packet is sent at once, so arrival spacing cannot match
    // the 20 ms timestamp spacing
    let deadline = std::time::Instant::now() + Duration::from_millis(500);
    while sim.in_flight() > 0 && std::time::Instant::now() < deadline {
        while let Some(packet) = sim.receive() {
            stats.record_packet(&packet.header);
            buffer.offer(packet);
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    assert_eq!(sim.in_flight(), 0);
    assert_eq!(buffer.len(), 20);
    assert!(stats.jitter() > 0.0);
}
