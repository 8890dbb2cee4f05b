//! Report display and formatting

use crate::sim::SimReport;
use std::time::Duration;

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format bandwidth in human-readable form
pub fn format_bandwidth(bps: u64) -> String {
    const KBPS: u64 = 1000;
    const MBPS: u64 = KBPS * 1000;
    const GBPS: u64 = MBPS * 1000;

    if bps >= GBPS {
        format!("{:.2} Gbps", bps as f64 / GBPS as f64)
    } else if bps >= MBPS {
        format!("{:.2} Mbps", bps as f64 / MBPS as f64)
    } else if bps >= KBPS {
        format!("{:.2} Kbps", bps as f64 / KBPS as f64)
    } else {
        format!("{} bps", bps)
    }
}

/// Format an RTT or other short interval
pub fn format_rtt(rtt: Duration) -> String {
    let micros = rtt.as_micros();
    if micros >= 1_000_000 {
        format!("{:.2}s", micros as f64 / 1_000_000.0)
    } else if micros >= 1_000 {
        format!("{:.2}ms", micros as f64 / 1_000.0)
    } else {
        format!("{}µs", micros)
    }
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 * 100.0 / total as f64
    }
}

/// Print a transfer report
pub fn display_report(report: &SimReport) {
    println!("\n┌─────────────────────────────────────────────────────────────┐");
    println!("│ TRANSFER                                                    │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!(
        "│ {} in {} ({})",
        format_bytes(report.transfer_size),
        format_rtt(report.elapsed),
        format_bandwidth(report.goodput_bps())
    );
    println!(
        "│ Retransmitted: {} ({:.2}%)",
        format_bytes(report.retransmitted_bytes),
        percent(report.retransmitted_bytes, report.transfer_size)
    );
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│ LOSS RECOVERY (sender)                                      │");
    println!("├─────────────────────────────────────────────────────────────┤");
    let sender = &report.sender;
    println!(
        "│ Packets:  {} sent / {} acked / {} lost ({} spurious)",
        sender.packets_sent, sender.packets_acked, sender.packets_lost, sender.spurious_losses
    );
    println!("│ PTOs:     {}", sender.pto_count);
    println!(
        "│ RTT:      {} smoothed / {} min",
        format_rtt(report.smoothed_rtt),
        format_rtt(report.min_rtt)
    );
    println!("│ cwnd:     {}", format_bytes(report.congestion_window));
    if let Some(state) = report.ecn_state {
        println!("│ ECN:      {:?}", state);
    }
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│ FLOW CONTROL (receiver)                                     │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│ Stream window:     {}", format_bytes(report.stream_window));
    println!("│ Connection window: {}", format_bytes(report.connection_window));
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│ LINK                                                        │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!(
        "│ Forward:  {} datagrams, {} dropped ({:.2}%)",
        report.forward.datagrams_sent,
        report.forward.datagrams_dropped,
        percent(report.forward.datagrams_dropped, report.forward.datagrams_sent)
    );
    println!(
        "│ Backward: {} datagrams, {} dropped ({:.2}%)",
        report.backward.datagrams_sent,
        report.backward.datagrams_dropped,
        percent(report.backward.datagrams_dropped, report.backward.datagrams_sent)
    );
    println!("└─────────────────────────────────────────────────────────────┘");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(2 * 1024 * 1024), "2.00 MB");
    }

    #[test]
    fn test_format_bandwidth() {
        assert_eq!(format_bandwidth(500), "500 bps");
        assert_eq!(format_bandwidth(10_000), "10.00 Kbps");
        assert_eq!(format_bandwidth(10_000_000), "10.00 Mbps");
    }

    #[test]
    fn test_format_rtt() {
        assert_eq!(format_rtt(Duration::from_micros(500)), "500µs");
        assert_eq!(format_rtt(Duration::from_millis(50)), "50.00ms");
        assert_eq!(format_rtt(Duration::from_secs(2)), "2.00s");
    }

    #[test]
    fn test_percent() {
        assert_eq!(percent(1, 0), 0.0);
        assert_eq!(percent(25, 100), 25.0);
    }
}
