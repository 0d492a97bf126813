//! Statistics display and formatting

use rist::{FlowStats, ReceiverStats, SenderStats};
use std::time::Duration;

/// Byte count with a binary-prefix unit
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Bitrate with a decimal-prefix unit
pub fn format_bandwidth(bps: u64) -> String {
    const UNITS: [&str; 4] = ["bps", "kbps", "Mbps", "Gbps"];

    let mut value = bps as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} bps", bps)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Format a round-trip time
pub fn format_rtt(rtt: Duration) -> String {
    let us = rtt.as_micros();
    if us >= 1_000_000 {
        format!("{:.2}s", rtt.as_secs_f64())
    } else if us >= 1_000 {
        format!("{:.2}ms", us as f64 / 1_000.0)
    } else {
        format!("{}µs", us)
    }
}

/// One-line sender summary for continuous display
pub fn sender_line(stats: &SenderStats, elapsed: Duration) -> String {
    let sent_bytes: u64 = stats.peers.iter().map(|p| p.sent_bytes).sum();
    let rate = if elapsed.as_secs() > 0 {
        (sent_bytes * 8) / elapsed.as_secs()
    } else {
        0
    };
    let rtt = stats
        .peers
        .iter()
        .map(|p| p.rtt)
        .max()
        .unwrap_or(Duration::ZERO);

    format!(
        "flow {:#010x} | peers {} | sent {} ({}) | retx {} | rtt {}",
        stats.flow_id,
        stats.peers.len(),
        stats.total_sent(),
        format_bandwidth(rate),
        stats.total_retransmitted(),
        format_rtt(rtt),
    )
}

/// One-line per-flow receiver summary
pub fn flow_line(flow: &FlowStats) -> String {
    format!(
        "flow {:#010x} | recv {} | recovered {} | lost {} | reordered {} | dup {} | resets {}",
        flow.flow_id,
        flow.received,
        flow.recovered,
        flow.lost,
        flow.reordered,
        flow.duplicates,
        flow.flow_resets,
    )
}

/// Print every flow of a receiver snapshot
pub fn display_receiver_stats(stats: &ReceiverStats) {
    if stats.flows.is_empty() {
        println!("waiting for flows...");
        return;
    }
    for flow in &stats.flows {
        println!("{}", flow_line(flow));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(999), "999 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MiB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GiB");
    }

    #[test]
    fn test_format_bandwidth() {
        assert_eq!(format_bandwidth(999), "999 bps");
        assert_eq!(format_bandwidth(2_500), "2.5 kbps");
        assert_eq!(format_bandwidth(8_000_000), "8.0 Mbps");
        assert_eq!(format_bandwidth(1_500_000_000), "1.5 Gbps");
        // Values past the table's top stay in the largest unit.
        assert_eq!(format_bandwidth(2_000_000_000_000), "2000.0 Gbps");
    }

    #[test]
    fn test_format_rtt() {
        assert_eq!(format_rtt(Duration::from_micros(500)), "500µs");
        assert_eq!(format_rtt(Duration::from_millis(50)), "50.00ms");
        assert_eq!(format_rtt(Duration::from_secs(2)), "2.00s");
    }

    #[test]
    fn test_flow_line_contents() {
        let line = flow_line(&FlowStats {
            flow_id: 0xABCD,
            received: 999,
            recovered: 1,
            ..Default::default()
        });
        assert!(line.contains("recv 999"));
        assert!(line.contains("recovered 1"));
    }
}
