//! Throughput metering for both send and receive progress.

use std::time::{Duration, Instant};

use crate::config::PROGRESS_INTERVAL;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    /// `round(chunks / total_chunks * 100)`.
    pub percent: u8,
    pub bytes: u64,
    pub total_bytes: u64,
    pub chunks: u32,
    pub total_chunks: u32,
    pub bytes_per_sec: f64,
}

impl Progress {
    pub fn speed(&self) -> String {
        format_speed(self.bytes_per_sec)
    }
}

/// Counts chunks and bytes for one transfer; yields a progress sample at most
/// once per [`PROGRESS_INTERVAL`], with speed measured over the window since
/// the previous sample.
#[derive(Debug, Clone)]
pub struct ThroughputMeter {
    total_chunks: u32,
    total_bytes: u64,
    chunks: u32,
    bytes: u64,
    started: Instant,
    last_sample: Instant,
    bytes_at_last_sample: u64,
}

impl ThroughputMeter {
    pub fn new(total_chunks: u32, total_bytes: u64, now: Instant) -> Self {
        Self {
            total_chunks,
            total_bytes,
            chunks: 0,
            bytes: 0,
            started: now,
            last_sample: now,
            bytes_at_last_sample: 0,
        }
    }

    /// Record one chunk of `bytes` plaintext bytes.
    pub fn record(&mut self, bytes: u64, now: Instant) -> Option<Progress> {
        self.chunks += 1;
        self.bytes += bytes;
        let window = now.saturating_duration_since(self.last_sample);
        if window < PROGRESS_INTERVAL {
            return None;
        }
        let speed = rate(self.bytes - self.bytes_at_last_sample, window);
        self.last_sample = now;
        self.bytes_at_last_sample = self.bytes;
        Some(self.snapshot(self.percent(), speed))
    }

    /// Final 100 % update carrying the whole-transfer average.
    pub fn finish(&self, now: Instant) -> Progress {
        let elapsed = now.saturating_duration_since(self.started);
        self.snapshot(100, rate(self.bytes, elapsed))
    }

    pub fn chunks(&self) -> u32 {
        self.chunks
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    fn percent(&self) -> u8 {
        if self.total_chunks == 0 {
            return 100;
        }
        (self.chunks as f64 / self.total_chunks as f64 * 100.0).round() as u8
    }

    fn snapshot(&self, percent: u8, bytes_per_sec: f64) -> Progress {
        Progress {
            percent,
            bytes: self.bytes,
            total_bytes: self.total_bytes,
            chunks: self.chunks,
            total_chunks: self.total_chunks,
            bytes_per_sec,
        }
    }
}

fn rate(bytes: u64, over: Duration) -> f64 {
    let secs = over.as_secs_f64();
    if secs <= 0.0 {
        0.0
    } else {
        bytes as f64 / secs
    }
}

/// Human-readable speed: `B/s` below 1 KiB/s, `KB/s` below 1 MiB/s, else `MB/s`.
pub fn format_speed(bytes_per_sec: f64) -> String {
    const KIB: f64 = 1024.0;
    const MIB: f64 = 1024.0 * 1024.0;
    if bytes_per_sec < KIB {
        format!("{bytes_per_sec:.0} B/s")
    } else if bytes_per_sec < MIB {
        format!("{:.1} KB/s", bytes_per_sec / KIB)
    } else {
        format!("{:.2} MB/s", bytes_per_sec / MIB)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_no_more_than_every_interval() {
        let t0 = Instant::now();
        let mut m = ThroughputMeter::new(10, 1000, t0);
        assert!(m.record(100, t0 + Duration::from_millis(50)).is_none());
        let p = m.record(100, t0 + Duration::from_millis(100)).unwrap();
        assert_eq!(p.percent, 20);
        assert_eq!(p.bytes, 200);
        assert!(m.record(100, t0 + Duration::from_millis(150)).is_none());
    }

    #[test]
    fn speed_is_sliding_not_cumulative() {
        let t0 = Instant::now();
        let mut m = ThroughputMeter::new(100, 100_000, t0);
        // Fast first second: 10_000 bytes.
        let first = m.record(10_000, t0 + Duration::from_secs(1)).unwrap();
        assert!((first.bytes_per_sec - 10_000.0).abs() < 1e-6);
        // Slow second second: 1_000 bytes. Cumulative would be 5_500 B/s.
        let second = m.record(1_000, t0 + Duration::from_secs(2)).unwrap();
        assert!((second.bytes_per_sec - 1_000.0).abs() < 1e-6);
    }

    #[test]
    fn finish_reports_whole_transfer_average() {
        let t0 = Instant::now();
        let mut m = ThroughputMeter::new(2, 4000, t0);
        m.record(3000, t0 + Duration::from_secs(1));
        m.record(1000, t0 + Duration::from_secs(2));
        let done = m.finish(t0 + Duration::from_secs(4));
        assert_eq!(done.percent, 100);
        assert_eq!(done.bytes, 4000);
        assert!((done.bytes_per_sec - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn percent_rounds() {
        let t0 = Instant::now();
        let mut m = ThroughputMeter::new(3, 3, t0);
        let p = m.record(1, t0 + Duration::from_secs(1)).unwrap();
        assert_eq!(p.percent, 33);
        let p = m.record(1, t0 + Duration::from_secs(2)).unwrap();
        assert_eq!(p.percent, 67);
    }

    #[test]
    fn speed_formatting() {
        assert_eq!(format_speed(0.0), "0 B/s");
        assert_eq!(format_speed(512.0), "512 B/s");
        assert_eq!(format_speed(1536.0), "1.5 KB/s");
        assert_eq!(format_speed(3.0 * 1024.0 * 1024.0), "3.00 MB/s");
    }
}
