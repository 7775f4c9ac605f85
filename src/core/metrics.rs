//! Per-client message counters.

use std::collections::{BTreeMap, HashMap};
use std::sync::{
    Arc, PoisonError, RwLock,
    atomic::{AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

#[derive(Debug, Default)]
struct Counters {
    success: AtomicU64,
    failure: AtomicU64,
}

impl Counters {
    fn slot(&self, outcome: Outcome) -> &AtomicU64 {
        match outcome {
            Outcome::Success => &self.success,
            Outcome::Failure => &self.failure,
        }
    }
}

/// Success and failure totals of one address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressMetric {
    pub success: u64,
    pub failure: u64,
}

/// Point-in-time view of a client's counters, keyed by direction and address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub inbound: BTreeMap<String, AddressMetric>,
    pub outbound: BTreeMap<String, AddressMetric>,
}

impl ConnectionMetrics {
    pub fn is_empty(&self) -> bool {
        self.inbound.is_empty() && self.outbound.is_empty()
    }

    /// Sum two snapshots address by address.
    pub fn merge(mut self, other: ConnectionMetrics) -> Self {
        for (address, metric) in other.inbound {
            let entry = self.inbound.entry(address).or_default();
            entry.success += metric.success;
            entry.failure += metric.failure;
        }
        for (address, metric) in other.outbound {
            let entry = self.outbound.entry(address).or_default();
            entry.success += metric.success;
            entry.failure += metric.failure;
        }
        self
    }

    pub fn total(&self, direction: Direction) -> AddressMetric {
        let map = match direction {
            Direction::Inbound => &self.inbound,
            Direction::Outbound => &self.outbound,
        };
        map.values().fold(AddressMetric::default(), |acc, m| AddressMetric {
            success: acc.success + m.success,
            failure: acc.failure + m.failure,
        })
    }
}

/// Shared, append-only counter registry; drivers record, the client snapshots.
#[derive(Debug, Default, Clone)]
pub struct ConnectionMetricsRegistry {
    counters: Arc<RwLock<HashMap<(Direction, String), Arc<Counters>>>>,
}

impl ConnectionMetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, direction: Direction, address: &str, outcome: Outcome) {
        let key = (direction, address.to_string());
        let existing = self
            .counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned();
        let counters = match existing {
            Some(counters) => counters,
            None => self
                .counters
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(key)
                .or_default()
                .clone(),
        };
        counters.slot(outcome).fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConnectionMetrics {
        let mut metrics = ConnectionMetrics::default();
        let counters = self.counters.read().unwrap_or_else(PoisonError::into_inner);
        for ((direction, address), c) in counters.iter() {
            let metric = AddressMetric {
                success: c.success.load(Ordering::Relaxed),
                failure: c.failure.load(Ordering::Relaxed),
            };
            match direction {
                Direction::Inbound => metrics.inbound.insert(address.clone(), metric),
                Direction::Outbound => metrics.outbound.insert(address.clone(), metric),
            };
        }
        metrics
    }

    pub fn reset(&self) {
        self.counters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
