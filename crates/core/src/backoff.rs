use std::time::Duration;

/// Jittered exponential backoff for reconnection attempts.
///
/// `next_delay` is pure: the same attempt number always produces the same
/// delay, which keeps reconnect timing reproducible in tests while still
/// de-synchronizing a fleet of clients (the jitter seed folds in the
/// attempt number).
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    min: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(min_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            min: Duration::from_millis(min_backoff_ms),
            max: Duration::from_millis(max_backoff_ms.max(min_backoff_ms)),
        }
    }

    /// Delay before reconnect attempt `attempt` (0-based): doubles from the
    /// minimum, capped at the maximum, then scaled by a jitter factor in
    /// `[0.5, 1.5)` and clamped back into `[min, max]`.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let mut base = self.min;
        for _ in 0..attempt {
            if base >= self.max {
                break;
            }
            base = base.saturating_mul(2);
        }
        let base = base.min(self.max);

        let jitter = 0.5 + Self::unit_jitter(attempt);
        base.mul_f64(jitter).clamp(self.min, self.max)
    }

    // Deterministic stand-in for a uniform draw in [0, 1): one multiplicative
    // LCG step over the attempt number.
    fn unit_jitter(attempt: u32) -> f64 {
        let hash = (attempt as u64)
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        ((hash >> 33) % 1_000) as f64 / 1_000.0
    }
}
