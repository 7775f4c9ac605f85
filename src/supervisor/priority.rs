//! Replay priority of a connection, looked up periodically from an external source.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::core::ConnectivityResult;

pub type PriorityFuture = Pin<Box<dyn Future<Output = ConnectivityResult<i32>> + Send + 'static>>;

pub trait PriorityProvider: Send + Sync + 'static {
    fn priority_for(&self, connection_id: &str, correlation_id: &str) -> PriorityFuture;
}

/// `base` shifted by up to 5% either way, so supervisors started together do not ask at once.
pub fn fuzzy_interval(base: Duration) -> Duration {
    let factor: f64 = SmallRng::from_entropy().gen_range(0.95..=1.05);
    base.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fuzz_stays_within_five_percent() {
        let base = Duration::from_secs(100);
        for _ in 0..200 {
            let interval = fuzzy_interval(base);
            assert!(interval >= Duration::from_millis(94_990));
            assert!(interval <= Duration::from_millis(105_010));
        }
    }
}
