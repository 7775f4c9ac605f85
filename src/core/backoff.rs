use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::{Rng, SeedableRng, rngs::SmallRng};

use super::types::{ConnectivityError, ConnectivityResult};

/// Source of monotonic time for strategies that need to measure elapsed periods.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

/// Wall clock backed by [`Instant::now`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Abstract reconnect strategy of one client instance.
///
/// Connect timeouts grow per *timeout*, backoffs grow per *failure*; both are owned by the
/// instance and reset together.
pub trait ReconnectTimeoutStrategy: Send + Sync + 'static {
    fn can_reconnect(&self) -> bool;
    fn reset(&mut self);
    fn next_timeout(&mut self) -> Duration;
    fn next_backoff(&mut self) -> Duration;
}

/// Doubling strategy with a retry cap and reset-after-sustained-uptime.
///
/// - `next_timeout` doubles the current timeout (capped at `max_timeout`) and counts one try.
/// - `next_backoff` returns the current backoff and doubles it for the next call.
/// - When more than `2 * (max_timeout + max_backoff)` passed since the last timeout increase,
///   the strategy forgets previous attempts before computing the next timeout.
#[derive(Clone)]
pub struct DuplicationReconnectTimeoutStrategy {
    min_timeout: Duration,
    max_timeout: Duration,
    min_backoff: Duration,
    max_backoff: Duration,
    max_tries: u32,
    current_timeout: Duration,
    next_backoff: Duration,
    current_tries: u32,
    last_timeout_increase: Option<Instant>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for DuplicationReconnectTimeoutStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuplicationReconnectTimeoutStrategy")
            .field("min_timeout", &self.min_timeout)
            .field("max_timeout", &self.max_timeout)
            .field("min_backoff", &self.min_backoff)
            .field("max_backoff", &self.max_backoff)
            .field("max_tries", &self.max_tries)
            .field("current_timeout", &self.current_timeout)
            .field("next_backoff", &self.next_backoff)
            .field("current_tries", &self.current_tries)
            .finish()
    }
}

impl DuplicationReconnectTimeoutStrategy {
    pub fn new(
        min_timeout: Duration,
        max_timeout: Duration,
        min_backoff: Duration,
        max_backoff: Duration,
        max_tries: u32,
    ) -> ConnectivityResult<Self> {
        Self::with_clock(
            min_timeout,
            max_timeout,
            min_backoff,
            max_backoff,
            max_tries,
            Arc::new(SystemClock),
        )
    }

    pub fn with_clock(
        min_timeout: Duration,
        max_timeout: Duration,
        min_backoff: Duration,
        max_backoff: Duration,
        max_tries: u32,
        clock: Arc<dyn Clock>,
    ) -> ConnectivityResult<Self> {
        if min_timeout > max_timeout {
            return Err(ConnectivityError::ConfigurationInvalid(format!(
                "minTimeout {min_timeout:?} must not exceed maxTimeout {max_timeout:?}"
            )));
        }
        if min_backoff > max_backoff {
            return Err(ConnectivityError::ConfigurationInvalid(format!(
                "minBackoff {min_backoff:?} must not exceed maxBackoff {max_backoff:?}"
            )));
        }
        if max_tries == 0 {
            return Err(ConnectivityError::ConfigurationInvalid(
                "maxTries must be positive".to_string(),
            ));
        }
        Ok(Self {
            min_timeout,
            max_timeout,
            min_backoff,
            max_backoff,
            max_tries,
            current_timeout: min_timeout,
            next_backoff: min_backoff,
            current_tries: 0,
            last_timeout_increase: None,
            clock,
        })
    }

    pub fn current_timeout(&self) -> Duration {
        self.current_timeout
    }

    pub fn current_tries(&self) -> u32 {
        self.current_tries
    }

    fn recovery_period(&self) -> Duration {
        (self.max_timeout + self.max_backoff) * 2
    }
}

impl ReconnectTimeoutStrategy for DuplicationReconnectTimeoutStrategy {
    fn can_reconnect(&self) -> bool {
        self.current_tries < self.max_tries
    }

    fn reset(&mut self) {
        self.current_timeout = self.min_timeout;
        self.next_backoff = self.min_backoff;
        self.current_tries = 0;
    }

    fn next_timeout(&mut self) -> Duration {
        let now = self.clock.now();
        if let Some(last) = self.last_timeout_increase
            && now.saturating_duration_since(last) > self.recovery_period()
        {
            self.reset();
        }
        self.last_timeout_increase = Some(now);
        self.current_timeout = self.max_timeout.min(self.current_timeout * 2);
        self.current_tries = self.current_tries.saturating_add(1);
        self.current_timeout
    }

    fn next_backoff(&mut self) -> Duration {
        let backoff = self.next_backoff;
        self.next_backoff = self.max_backoff.min(self.next_backoff * 2);
        backoff
    }
}

/// Apply uniform jitter in `[0.5, 1.0]` to a delay.
pub fn jitter_delay(base: Duration) -> Duration {
    if base.is_zero() {
        return base;
    }

    let mut rng = SmallRng::from_entropy();
    let jitter: f64 = rng.gen_range(0.5..=1.0);
    let nanos = (base.as_nanos() as f64 * jitter) as u128;
    Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
}
