//! Occupancy counters and moving averages for the receive buffer.
//!
//! The three instantaneous counters live behind their own small lock so that
//! observability threads can read them without taking the session's receive
//! lock. The moving averages are refreshed from the ACK path and are only
//! touched under the main lock.

use std::sync::Mutex;

use crate::time::MonoTime;

/// Coefficient of the per-packet payload-size EMA: `avg += (x - avg) / 100`.
const PAYLOAD_EMA_DIV: f64 = 100.0;

/// Minimum spacing between two moving-average refreshes.
const MAVG_GRANULARITY_US: u64 = 100_000;

/// Smoothing window of the moving averages.
const MAVG_WINDOW_US: u64 = 1_000_000;

#[derive(Debug, Default)]
struct Counts {
    bytes: i64,
    pkts: i64,
    avg_payload: f64,
}

/// Instantaneous reading of the occupancy counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Packets currently held.
    pub pkts: usize,
    /// Payload bytes currently held.
    pub bytes: usize,
    /// Smoothed payload size of inserted packets, rounded.
    pub avg_payload: usize,
}

/// Byte/packet counters behind a dedicated lock.
#[derive(Debug, Default)]
pub(crate) struct ByteCounter {
    inner: Mutex<Counts>,
}

impl ByteCounter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Accounts one inserted packet and feeds the payload EMA.
    pub(crate) fn add(&self, pkts: i64, bytes: i64) {
        let mut c = self.inner.lock().expect("byte counter lock");
        c.pkts += pkts;
        c.bytes += bytes;
        if bytes > 0 {
            if c.avg_payload == 0.0 {
                c.avg_payload = bytes as f64;
            } else {
                c.avg_payload += (bytes as f64 - c.avg_payload) / PAYLOAD_EMA_DIV;
            }
        }
    }

    /// Accounts released packets.
    pub(crate) fn sub(&self, pkts: i64, bytes: i64) {
        let mut c = self.inner.lock().expect("byte counter lock");
        c.pkts -= pkts;
        c.bytes -= bytes;
        debug_assert!(c.pkts >= 0 && c.bytes >= 0);
    }

    pub(crate) fn snapshot(&self) -> CounterSnapshot {
        let c = self.inner.lock().expect("byte counter lock");
        CounterSnapshot {
            pkts: c.pkts.max(0) as usize,
            bytes: c.bytes.max(0) as usize,
            avg_payload: c.avg_payload.round() as usize,
        }
    }
}

/// Rate-limited moving average of buffer occupancy, refreshed by the ACK path.
#[derive(Debug, Default)]
pub(crate) struct MAvg {
    pkts: f64,
    bytes: f64,
    timespan_ms: f64,
    last: Option<MonoTime>,
}

impl MAvg {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Whether enough time passed since the previous refresh.
    pub(crate) fn is_time_to_update(&self, now: MonoTime) -> bool {
        match self.last {
            None => true,
            Some(last) => now.as_u64().saturating_sub(last.as_u64()) >= MAVG_GRANULARITY_US,
        }
    }

    /// Folds one occupancy reading in, weighted by the elapsed share of the
    /// smoothing window.
    pub(crate) fn update(&mut self, now: MonoTime, pkts: usize, bytes: usize, timespan_ms: u64) {
        let weight = match self.last {
            None => 1.0,
            Some(last) => {
                let elapsed = now.as_u64().saturating_sub(last.as_u64());
                (elapsed as f64 / MAVG_WINDOW_US as f64).min(1.0)
            }
        };
        self.pkts += (pkts as f64 - self.pkts) * weight;
        self.bytes += (bytes as f64 - self.bytes) * weight;
        self.timespan_ms += (timespan_ms as f64 - self.timespan_ms) * weight;
        self.last = Some(now);
    }

    pub(crate) fn pkts(&self) -> usize {
        self.pkts.round() as usize
    }

    pub(crate) fn bytes(&self) -> usize {
        self.bytes.round() as usize
    }

    pub(crate) fn timespan_ms(&self) -> u64 {
        self.timespan_ms.round() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_seeds_with_first_payload() {
        let c = ByteCounter::new();
        c.add(1, 100);
        assert_eq!(c.snapshot().avg_payload, 100);
    }

    #[test]
    fn ema_moves_one_hundredth_per_packet() {
        let c = ByteCounter::new();
        c.add(1, 100);
        c.add(1, 200);
        // 100 + (200 - 100) / 100 = 101
        assert_eq!(c.snapshot().avg_payload, 101);
        let snap = c.snapshot();
        assert_eq!(snap.pkts, 2);
        assert_eq!(snap.bytes, 300);
    }

    #[test]
    fn sub_releases_counted_packets() {
        let c = ByteCounter::new();
        c.add(1, 100);
        c.add(1, 50);
        c.sub(1, 100);
        let snap = c.snapshot();
        assert_eq!(snap.pkts, 1);
        assert_eq!(snap.bytes, 50);
    }

    #[test]
    fn zero_length_payload_skips_ema() {
        let c = ByteCounter::new();
        c.add(1, 0);
        assert_eq!(c.snapshot().avg_payload, 0);
        c.add(1, 80);
        assert_eq!(c.snapshot().avg_payload, 80);
    }

    #[test]
    fn mavg_rate_limits_updates() {
        let mut m = MAvg::new();
        assert!(m.is_time_to_update(MonoTime::new(0)));
        m.update(MonoTime::new(0), 10, 1_000, 20);
        assert!(!m.is_time_to_update(MonoTime::new(MAVG_GRANULARITY_US / 2)));
        assert!(m.is_time_to_update(MonoTime::new(MAVG_GRANULARITY_US)));
    }

    #[test]
    fn mavg_converges_toward_readings() {
        let mut m = MAvg::new();
        m.update(MonoTime::new(0), 10, 1_000, 20);
        assert_eq!(m.pkts(), 10);
        assert_eq!(m.bytes(), 1_000);
        assert_eq!(m.timespan_ms(), 20);

        // A full window later the average lands on the new reading.
        m.update(MonoTime::new(MAVG_WINDOW_US), 0, 0, 0);
        assert_eq!(m.pkts(), 0);
        assert_eq!(m.bytes(), 0);

        // A partial window moves it proportionally.
        m.update(MonoTime::new(MAVG_WINDOW_US + MAVG_WINDOW_US / 2), 100, 0, 0);
        assert_eq!(m.pkts(), 50);
    }
}
