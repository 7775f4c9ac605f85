//! Service configuration.
//!
//! Every section deserializes with defaults so a partial JSON document only overrides the keys
//! it names. Durations are given in milliseconds.

use std::time::Duration;

use serde::Deserialize;

use crate::core::{
    ConnectivityError, ConnectivityResult, DefaultStatusResolver,
    DuplicationReconnectTimeoutStrategy,
};

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Timeouts and retry bounds of one client instance.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ClientConfig {
    #[serde(with = "duration_ms")]
    pub connecting_min_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub connecting_max_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub disconnecting_max_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub disconnect_announcement_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub testing_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub min_backoff: Duration,
    #[serde(with = "duration_ms")]
    pub max_backoff: Duration,
    pub max_tries: u32,
    #[serde(with = "duration_ms")]
    pub socket_probe_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connecting_min_timeout: Duration::from_secs(60),
            connecting_max_timeout: Duration::from_secs(60 * 60),
            disconnecting_max_timeout: Duration::from_secs(10),
            disconnect_announcement_timeout: Duration::from_secs(3),
            testing_timeout: Duration::from_secs(10),
            min_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60 * 60),
            max_tries: 50,
            socket_probe_timeout: Duration::from_secs(2),
        }
    }
}

impl ClientConfig {
    pub fn reconnect_strategy(&self) -> ConnectivityResult<DuplicationReconnectTimeoutStrategy> {
        DuplicationReconnectTimeoutStrategy::new(
            self.connecting_min_timeout,
            self.connecting_max_timeout,
            self.min_backoff,
            self.max_backoff,
            self.max_tries,
        )
    }

    /// Maximum time spent in DISCONNECTING, including the closed-announcement delay when one is sent.
    pub fn disconnecting_timeout(&self, with_announcement: bool) -> Duration {
        if with_announcement {
            self.disconnecting_max_timeout + self.disconnect_announcement_timeout
        } else {
            self.disconnecting_max_timeout
        }
    }
}

/// Timers and fan-out bounds of the connection supervisor.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SupervisorConfig {
    #[serde(with = "duration_ms")]
    pub client_actor_ask_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub check_logging_active_interval: Duration,
    #[serde(with = "duration_ms")]
    pub logging_enabled_duration: Duration,
    #[serde(with = "duration_ms")]
    pub priority_update_interval: Duration,
    #[serde(with = "duration_ms")]
    pub default_query_timeout: Duration,
    pub query_timeout_factor: f64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            client_actor_ask_timeout: Duration::from_secs(60),
            check_logging_active_interval: Duration::from_secs(5 * 60),
            logging_enabled_duration: Duration::from_secs(24 * 60 * 60),
            priority_update_interval: Duration::from_secs(24 * 60 * 60),
            default_query_timeout: Duration::from_millis(500),
            query_timeout_factor: 0.75,
        }
    }
}

impl SupervisorConfig {
    /// Aggregation deadline for a query whose caller stated `header_timeout`.
    pub fn query_timeout(&self, header_timeout: Option<Duration>) -> Duration {
        match header_timeout {
            Some(timeout) => timeout.mul_f64(self.query_timeout_factor.clamp(0.0, 1.0)),
            None => self.default_query_timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct MonitoringConfig {
    pub success_log_capacity: usize,
    pub failure_log_capacity: usize,
    /// Failure texts containing one of these are resolved to MISCONFIGURED.
    pub user_indicated_errors: Vec<String>,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            success_log_capacity: 10,
            failure_log_capacity: 10,
            user_indicated_errors: Vec::new(),
        }
    }
}

impl MonitoringConfig {
    pub fn status_resolver(&self) -> DefaultStatusResolver {
        DefaultStatusResolver::new(self.user_indicated_errors.iter().cloned())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ConnectivityConfig {
    pub client: ClientConfig,
    pub supervisor: SupervisorConfig,
    pub monitoring: MonitoringConfig,
}

impl ConnectivityConfig {
    pub fn from_json(json: &str) -> ConnectivityResult<Self> {
        let config: Self = sonic_rs::from_str(json)
            .map_err(|err| ConnectivityError::ConfigurationInvalid(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConnectivityResult<()> {
        self.client.reconnect_strategy()?;
        if !(0.0..=1.0).contains(&self.supervisor.query_timeout_factor) {
            return Err(ConnectivityError::ConfigurationInvalid(format!(
                "query-timeout-factor {} must be within [0, 1]",
                self.supervisor.query_timeout_factor
            )));
        }
        Ok(())
    }
}
