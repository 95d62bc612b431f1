//! Human-readable formatting for transfer statistics

use std::time::Duration;

/// Format bytes as human-readable string
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

/// Format a rate given in KB/s (1 KB = 1024 bytes)
pub fn format_rate_kbps(kbps: f64) -> String {
    const MB: f64 = 1024.0;
    const GB: f64 = MB * 1024.0;

    if kbps >= GB {
        format!("{:.2} GB/s", kbps / GB)
    } else if kbps >= MB {
        format!("{:.2} MB/s", kbps / MB)
    } else {
        format!("{:.2} KB/s", kbps)
    }
}

/// Format duration for display
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let secs = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(32768), "32.00 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
    }

    #[test]
    fn test_format_rate_kbps() {
        assert_eq!(format_rate_kbps(0.0), "0.00 KB/s");
        assert_eq!(format_rate_kbps(512.0), "512.00 KB/s");
        assert_eq!(format_rate_kbps(2048.0), "2.00 MB/s");
        assert_eq!(format_rate_kbps(1024.0 * 1024.0 * 3.0), "3.00 GB/s");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(format_duration(Duration::from_secs(100)), "1m 40s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
    }
}
