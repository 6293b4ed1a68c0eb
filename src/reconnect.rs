use std::time::Duration;

/// Exponential backoff between reconnect attempts.
///
/// Attempt `n` (starting at zero) waits `initial_delay * factor^n`, capped at `max_delay`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: u32,
    /// `None` retries forever.
    pub max_retries: Option<usize>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            factor: 2,
            max_retries: None,
        }
    }
}

impl ReconnectPolicy {
    /// Never retries: a failed connect is reported right away.
    pub fn disabled() -> Self {
        Self {
            max_retries: Some(0),
            ..Self::default()
        }
    }

    /// Clamps zero delays to one millisecond, swaps inverted bounds and keeps the factor at
    /// least one.
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use rustdis_client::reconnect::ReconnectPolicy;
    ///
    /// let policy = ReconnectPolicy {
    ///     initial_delay: Duration::from_secs(2),
    ///     max_delay: Duration::ZERO,
    ///     factor: 0,
    ///     max_retries: None,
    /// }
    /// .normalized();
    ///
    /// assert_eq!(policy.initial_delay, Duration::from_millis(1));
    /// assert_eq!(policy.max_delay, Duration::from_secs(2));
    /// assert_eq!(policy.factor, 1);
    /// ```
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.initial_delay = self.initial_delay.max(Duration::from_millis(1));
        self.max_delay = self.max_delay.max(Duration::from_millis(1));
        if self.initial_delay > self.max_delay {
            std::mem::swap(&mut self.initial_delay, &mut self.max_delay);
        }
        self.factor = self.factor.max(1);
        self
    }

    pub fn delay(&self, attempt: usize) -> Duration {
        let exponent = u32::try_from(attempt).unwrap_or(u32::MAX);

        self.factor
            .checked_pow(exponent)
            .and_then(|multiplier| self.initial_delay.checked_mul(multiplier))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Whether another attempt may follow `attempt` failed ones.
    pub fn should_retry(&self, attempt: usize) -> bool {
        self.max_retries.map_or(true, |max| attempt < max)
    }
}
