//! Time-stamp-based packet delivery clock.
//!
//! Every data packet carries a 32-bit sender timestamp in microseconds. The
//! receiver reconstructs a local play time for each packet — the moment the
//! consumer is allowed to see it — as
//!
//! ```text
//! play_time(ts) = time_base(ts) + ts + delay + drift
//! ```
//!
//! where `time_base` anchors the sender clock to the local monotonic clock,
//! `delay` is the negotiated latency budget and `drift` compensates the slow
//! divergence of the two clocks. The 32-bit field wraps roughly every 71.6
//! minutes; a small state machine arms a wrap-check period during the last
//! 30 seconds before the wrap and commits `base += 2^32 µs` once timestamps
//! restart from low values.

use crate::time::{Duration, Micros, MonoTime};
use crate::trace::debug;

/// Span of the 32-bit timestamp field, in microseconds.
const TS_WRAP_SPAN: u64 = 1 << 32;

/// Width of the wrap-check window on either side of the wrap point.
const TS_WRAP_WINDOW: u32 = 30_000_000;

/// Samples folded into one drift average.
const DRIFT_SPAN: u32 = 1_000;

/// Averaged drift beyond this magnitude is folded into the time base.
const OVERDRIFT_US: i64 = 5_000;

/// Clock interface the receive buffer consumes.
///
/// Kept narrow so tests can substitute a double returning deterministic play
/// times; [`Tsbpd`] is the production implementation.
pub trait TsbpdClock {
    /// Whether delivery is time-gated at all.
    fn enabled(&self) -> bool;

    /// Arms the clock: local anchor for sender timestamp zero, whether the
    /// sender clock is already inside the wrap-check window, and the latency
    /// budget.
    fn set_mode(&mut self, base: MonoTime, wrap: bool, delay: Duration<Micros>);

    /// Adopts base, delay and drift negotiated by a socket group.
    fn apply_group_time(&mut self, base: MonoTime, wrap: bool, delay: Duration<Micros>, drift: i64);

    /// Adopts base and drift from a socket group, keeping the local delay.
    fn apply_group_drift(&mut self, base: MonoTime, wrap: bool, drift: i64);

    /// Feeds one drift sample from an ACK exchange; returns true when the
    /// time base was adjusted.
    fn add_drift_sample(&mut self, ts: u32, arrival: MonoTime, rtt_us: i64) -> bool;

    /// Advances the wrap-check state machine with a consumed packet timestamp.
    fn update_time_base(&mut self, ts: u32);

    /// Local play time of a packet carrying timestamp `ts`.
    fn pkt_play_time(&self, ts: u32) -> MonoTime;

    /// Wrap-adjusted local anchor for timestamp `ts`.
    fn time_base(&self, ts: u32) -> MonoTime;

    /// Current drift compensation in microseconds.
    fn drift(&self) -> i64;
}

/// Production TSBPD clock.
#[derive(Debug)]
pub struct Tsbpd {
    enabled: bool,
    base: MonoTime,
    wrap_check: bool,
    delay: Duration<Micros>,
    drift: i64,
    drift_sum: i64,
    drift_count: u32,
}

impl Tsbpd {
    #[must_use]
    pub fn new() -> Self {
        Self {
            enabled: false,
            base: MonoTime::new(0),
            wrap_check: false,
            delay: Duration::from_micros(0),
            drift: 0,
            drift_sum: 0,
            drift_count: 0,
        }
    }
}

impl Default for Tsbpd {
    fn default() -> Self {
        Self::new()
    }
}

impl TsbpdClock for Tsbpd {
    fn enabled(&self) -> bool {
        self.enabled
    }

    fn set_mode(&mut self, base: MonoTime, wrap: bool, delay: Duration<Micros>) {
        self.enabled = true;
        self.base = base;
        self.wrap_check = wrap;
        self.delay = delay;
    }

    fn apply_group_time(&mut self, base: MonoTime, wrap: bool, delay: Duration<Micros>, drift: i64) {
        self.enabled = true;
        self.base = base;
        self.wrap_check = wrap;
        self.delay = delay;
        self.drift = drift;
    }

    fn apply_group_drift(&mut self, base: MonoTime, wrap: bool, drift: i64) {
        self.base = base;
        self.wrap_check = wrap;
        self.drift = drift;
    }

    fn add_drift_sample(&mut self, ts: u32, arrival: MonoTime, rtt_us: i64) -> bool {
        if !self.enabled {
            return false;
        }

        let send_time = self.time_base(ts).as_u64() as i64 + i64::from(ts);
        let sample = arrival.as_u64() as i64 - send_time - rtt_us / 2;
        self.drift_sum += sample;
        self.drift_count += 1;

        if self.drift_count < DRIFT_SPAN {
            return false;
        }

        self.drift = self.drift_sum / i64::from(self.drift_count);
        self.drift_sum = 0;
        self.drift_count = 0;

        if self.drift.abs() > OVERDRIFT_US {
            // Large averaged drift moves the base itself; the residual
            // compensation restarts from zero.
            self.base = self.base.offset(self.drift);
            debug!(drift_us = self.drift, "tsbpd base shifted by accumulated drift");
            self.drift = 0;
            return true;
        }
        false
    }

    fn update_time_base(&mut self, ts: u32) {
        if self.wrap_check {
            // Past the wrap point the sender clock restarts near zero; once
            // that is observed, commit one full span to the base.
            if ts < TS_WRAP_WINDOW {
                self.base = self.base.offset(TS_WRAP_SPAN as i64);
                self.wrap_check = false;
                debug!(base = %self.base, "tsbpd timestamp wrap committed");
            }
        } else if ts > u32::MAX - TS_WRAP_WINDOW {
            self.wrap_check = true;
        }
    }

    fn pkt_play_time(&self, ts: u32) -> MonoTime {
        (self.time_base(ts) + Duration::from_micros(u64::from(ts)) + self.delay)
            .offset(self.drift)
    }

    fn time_base(&self, ts: u32) -> MonoTime {
        if self.wrap_check && ts < TS_WRAP_WINDOW {
            self.base.offset(TS_WRAP_SPAN as i64)
        } else {
            self.base
        }
    }

    fn drift(&self) -> i64 {
        self.drift
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_by_default() {
        let clock = Tsbpd::new();
        assert!(!clock.enabled());
        assert_eq!(clock.drift(), 0);
    }

    #[test]
    fn play_time_is_base_plus_ts_plus_delay() {
        let mut clock = Tsbpd::new();
        clock.set_mode(MonoTime::new(1_000_000), false, Duration::from_millis(120));
        assert!(clock.enabled());
        assert_eq!(
            clock.pkt_play_time(500).as_u64(),
            1_000_000 + 500 + 120_000
        );
    }

    #[test]
    fn wrap_commits_one_span() {
        let mut clock = Tsbpd::new();
        clock.set_mode(MonoTime::new(0), false, Duration::from_micros(0));

        // A timestamp in the last 30 s before the wrap arms the check.
        clock.update_time_base(u32::MAX - 1_000);
        // Timestamps just past the wrap are anchored one span later even
        // before the wrap is committed.
        assert_eq!(clock.time_base(10).as_u64(), TS_WRAP_SPAN);
        assert_eq!(clock.time_base(u32::MAX - 500).as_u64(), 0);

        // Consuming a post-wrap packet commits the span.
        clock.update_time_base(10);
        assert_eq!(clock.time_base(u32::MAX / 2).as_u64(), TS_WRAP_SPAN);
    }

    #[test]
    fn small_drift_average_does_not_move_base() {
        let mut clock = Tsbpd::new();
        clock.set_mode(MonoTime::new(0), false, Duration::from_micros(0));

        // Arrival consistently 100 µs after the reconstructed send time.
        let mut adjusted = false;
        for _ in 0..DRIFT_SPAN {
            adjusted |= clock.add_drift_sample(0, MonoTime::new(100), 0);
        }
        assert!(!adjusted);
        assert_eq!(clock.drift(), 100);
        assert_eq!(clock.pkt_play_time(0).as_u64(), 100);
    }

    #[test]
    fn overdrift_folds_into_base() {
        let mut clock = Tsbpd::new();
        clock.set_mode(MonoTime::new(0), false, Duration::from_micros(0));

        let mut adjusted = false;
        for _ in 0..DRIFT_SPAN {
            adjusted |= clock.add_drift_sample(0, MonoTime::new(50_000), 0);
        }
        assert!(adjusted);
        assert_eq!(clock.drift(), 0);
        assert_eq!(clock.time_base(0).as_u64(), 50_000);
    }

    #[test]
    fn rtt_halves_out_of_the_sample() {
        let mut clock = Tsbpd::new();
        clock.set_mode(MonoTime::new(0), false, Duration::from_micros(0));

        for _ in 0..DRIFT_SPAN {
            clock.add_drift_sample(0, MonoTime::new(200), 200);
        }
        assert_eq!(clock.drift(), 100);
    }
}
