// src/link/meter.rs
//
// Packet-rate meter for the live link. Counts telemetry packets and, once
// per reporting window, synthesizes a LinkRate event alongside the primary
// stream. Owned exclusively by the read loop; no cross-thread state.

use std::time::{Duration, Instant};

use crate::link::GatewayEvent;

/// How often a rate event is produced.
pub const RATE_REPORT_INTERVAL: Duration = Duration::from_millis(300);

/// Sliding-window packet counter.
pub struct LinkMeter {
    packet_count: u64,
    window_start: Instant,
    interval: Duration,
}

impl LinkMeter {
    pub fn new() -> Self {
        Self::anchored(Instant::now(), RATE_REPORT_INTERVAL)
    }

    /// Meter with a custom reporting window.
    pub fn with_interval(interval: Duration) -> Self {
        Self::anchored(Instant::now(), interval)
    }

    fn anchored(start: Instant, interval: Duration) -> Self {
        LinkMeter {
            packet_count: 0,
            window_start: start,
            interval,
        }
    }

    /// Record one telemetry packet. Returns a `LinkRate` event when the
    /// reporting window has elapsed, resetting the window.
    pub fn observe(&mut self) -> Option<GatewayEvent> {
        self.observe_at(Instant::now())
    }

    fn observe_at(&mut self, now: Instant) -> Option<GatewayEvent> {
        self.packet_count += 1;

        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.interval {
            return None;
        }

        let secs = elapsed.as_secs_f64();
        let rate = if secs > 0.0 {
            self.packet_count as f64 / secs
        } else {
            0.0
        };

        self.packet_count = 0;
        self.window_start = now;

        Some(GatewayEvent::LinkRate { packets_per_second: rate })
    }
}

impl Default for LinkMeter {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_no_event_before_window_elapses() {
        let t0 = Instant::now();
        let mut meter = LinkMeter::anchored(t0, Duration::from_millis(300));
        for i in 1..=29u64 {
            assert!(meter.observe_at(t0 + Duration::from_millis(i * 10)).is_none());
        }
    }

    #[test]
    fn test_rate_for_uniform_stream() {
        // 30 packets over 0.3 s is 100 packets/sec.
        let t0 = Instant::now();
        let mut meter = LinkMeter::anchored(t0, Duration::from_millis(300));
        let mut rate = None;
        for i in 1..=30u64 {
            if let Some(GatewayEvent::LinkRate { packets_per_second }) =
                meter.observe_at(t0 + Duration::from_millis(i * 10))
            {
                rate = Some(packets_per_second);
            }
        }
        assert_relative_eq!(rate.expect("window should have closed"), 100.0, max_relative = 1e-9);
    }

    #[test]
    fn test_window_resets_after_report() {
        let t0 = Instant::now();
        let mut meter = LinkMeter::anchored(t0, Duration::from_millis(300));

        assert!(meter.observe_at(t0 + Duration::from_millis(300)).is_some());

        // Fresh window: nothing until another 300 ms of observations.
        assert!(meter.observe_at(t0 + Duration::from_millis(400)).is_none());
        let event = meter.observe_at(t0 + Duration::from_millis(600));
        match event {
            Some(GatewayEvent::LinkRate { packets_per_second }) => {
                // 2 packets over the 0.3 s since the last report.
                assert_relative_eq!(packets_per_second, 2.0 / 0.3, max_relative = 1e-9);
            }
            other => panic!("expected rate event, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_interval_guard() {
        let t0 = Instant::now();
        let mut meter = LinkMeter::anchored(t0, Duration::ZERO);
        match meter.observe_at(t0) {
            Some(GatewayEvent::LinkRate { packets_per_second }) => {
                assert_eq!(packets_per_second, 0.0)
            }
            other => panic!("expected rate event, got {:?}", other),
        }
    }
}
