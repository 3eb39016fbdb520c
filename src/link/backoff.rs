use std::time::Duration;

/// Reconnect delay state for the link. With the default multiplier of 1.0
/// every retry waits the base delay; larger multipliers grow the wait per
/// consecutive failure up to `max_delay`.
#[derive(Clone, Debug)]
pub struct ReconnectBackoff {
    pub attempts: u32,
    pub base_delay: Duration,
    pub current_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl ReconnectBackoff {
    pub fn new(base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        ReconnectBackoff {
            attempts: 0,
            base_delay,
            current_delay: base_delay.min(max_delay),
            multiplier: if multiplier.is_finite() { multiplier.max(1.0) } else { 1.0 },
            max_delay,
        }
    }

    /// Record a failed or dropped session and return how long to wait before
    /// the next attempt.
    pub fn record_failed_attempt(&mut self) -> Duration {
        let delay = self.current_delay;
        self.attempts += 1;
        self.current_delay = Duration::from_secs_f64(
            (self.current_delay.as_secs_f64() * self.multiplier).min(self.max_delay.as_secs_f64()),
        );

        log::info!(
            "Reconnect attempt {} in {:.1}s",
            self.attempts,
            delay.as_secs_f64()
        );
        delay
    }

    /// Telemetry flowed again; start over from the base delay.
    pub fn record_success(&mut self) {
        if self.attempts > 0 {
            log::info!("Link recovered after {} attempt(s)", self.attempts);
        }
        self.attempts = 0;
        self.current_delay = self.base_delay.min(self.max_delay);
    }
}
