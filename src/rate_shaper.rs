//! Rate shaper: paces the sender's emission to a configured bit rate via a
//! `start_packet`/`end_packet_and_sleep` pair. Carries no shared state — it
//! is only ever driven by the sender's single emission path.

use std::time::{Duration, Instant};

/// Paces packet emission to a target bit rate. When the configured rate is
/// `0`, shaping is disabled and callers should not consult this type at
/// all; `start_packet`/`end_packet_and_sleep` still behave correctly (as
/// a no-op sleep) if called regardless.
pub struct RateShaper {
    rate_bps: u64,
    period: Duration,
    start: Option<Instant>,
}

impl RateShaper {
    pub fn new() -> RateShaper {
        RateShaper { rate_bps: 0, period: Duration::ZERO, start: None }
    }

    /// Sets the target emission rate, in bits per second. `0` disables
    /// shaping.
    pub fn set_rate(&mut self, bps: u64) {
        self.rate_bps = bps;
    }

    /// `true` if a nonzero rate is configured and shaping should be
    /// consulted for this emission path.
    pub fn is_enabled(&self) -> bool {
        self.rate_bps > 0
    }

    /// Records the start time of a packet of `size_bytes` and computes the
    /// period (`size * 8 / rate`) that `end_packet_and_sleep` will pace
    /// against.
    pub fn start_packet(&mut self, size_bytes: usize) {
        if !self.is_enabled() {
            self.start = None;
            return;
        }
        let bits = size_bytes as f64 * 8.0;
        self.period = Duration::from_secs_f64(bits / self.rate_bps as f64);
        self.start = Some(Instant::now());
    }

    /// Sleeps for the remainder of the computed period, clamped at zero.
    /// No-op if shaping is disabled.
    pub fn end_packet_and_sleep(&mut self) {
        let Some(start) = self.start else { return };
        let elapsed = start.elapsed();
        if elapsed < self.period {
            std::thread::sleep(self.period - elapsed);
        }
    }
}

impl Default for RateShaper {
    fn default() -> Self {
        RateShaper::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_shaper_never_sleeps() {
        let mut shaper = RateShaper::new();
        shaper.start_packet(1_000_000);
        let start = Instant::now();
        shaper.end_packet_and_sleep();
        assert!(start.elapsed() < Duration::from_millis(5));
    }

    #[test]
    fn enabled_shaper_paces_to_period() {
        let mut shaper = RateShaper::new();
        shaper.set_rate(8_000_000); // 8 Mb/s -> 1 byte/us
        shaper.start_packet(1000); // period = 8000 bits / 8_000_000 bps = 1ms
        let start = Instant::now();
        shaper.end_packet_and_sleep();
        assert!(start.elapsed() >= Duration::from_micros(900));
    }

    #[test]
    fn period_already_elapsed_does_not_block() {
        let mut shaper = RateShaper::new();
        shaper.set_rate(1); // tiny rate -> long period
        shaper.start_packet(1);
        std::thread::sleep(Duration::from_millis(1));
        // Manually shrink the recorded period so elapsed already exceeds it.
        shaper.period = Duration::from_nanos(1);
        let start = Instant::now();
        shaper.end_packet_and_sleep();
        assert!(start.elapsed() < Duration::from_millis(5));
    }
}
