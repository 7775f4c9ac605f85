use super::types::{ConnectivityError, ConnectivityStatus};

/// Failure reported to a client instance, either by the driver or by the instance itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionFailure {
    pub error: ConnectivityError,
    pub description: String,
    /// Failure caused by the connection configuration rather than the broker.
    pub user_related: bool,
}

impl ConnectionFailure {
    pub fn new(error: ConnectivityError, description: impl Into<String>) -> Self {
        let user_related = error.is_user_related();
        Self {
            error,
            description: description.into(),
            user_related,
        }
    }

    pub fn user_related(error: ConnectivityError, description: impl Into<String>) -> Self {
        Self {
            error,
            description: description.into(),
            user_related: true,
        }
    }

    pub fn internal(description: impl Into<String>) -> Self {
        let description = description.into();
        Self {
            error: ConnectivityError::Actor(description.clone()),
            description,
            user_related: false,
        }
    }
}

/// Maps a connection failure to the status operators see.
///
/// Shared by every instance of a connection, so implementations must be stateless or
/// internally synchronized.
pub trait ConnectivityStatusResolver: Send + Sync + 'static {
    fn resolve(&self, failure: &ConnectionFailure) -> ConnectivityStatus;
}

/// Resolves user-related failures and failures whose text matches a configured pattern to
/// `Misconfigured`, everything else to `Failed`.
#[derive(Clone, Debug, Default)]
pub struct DefaultStatusResolver {
    user_indicated_errors: Vec<String>,
}

impl DefaultStatusResolver {
    pub fn new(user_indicated_errors: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            user_indicated_errors: user_indicated_errors
                .into_iter()
                .map(|p| p.into().to_ascii_lowercase())
                .collect(),
        }
    }

    fn matches_user_indicated(&self, failure: &ConnectionFailure) -> bool {
        if self.user_indicated_errors.is_empty() {
            return false;
        }
        let haystack = format!("{} {}", failure.error, failure.description).to_ascii_lowercase();
        self.user_indicated_errors
            .iter()
            .any(|pattern| haystack.contains(pattern))
    }
}

impl ConnectivityStatusResolver for DefaultStatusResolver {
    fn resolve(&self, failure: &ConnectionFailure) -> ConnectivityStatus {
        if failure.user_related || self.matches_user_indicated(failure) {
            ConnectivityStatus::Misconfigured
        } else {
            ConnectivityStatus::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_related_failures_are_misconfigured() {
        let resolver = DefaultStatusResolver::default();
        let failure = ConnectionFailure::user_related(
            ConnectivityError::driver("connect", "tunnel closed"),
            "ssh tunnel closed",
        );
        assert_eq!(resolver.resolve(&failure), ConnectivityStatus::Misconfigured);

        let failure = ConnectionFailure::new(
            ConnectivityError::driver("connect", "connection refused"),
            "connection refused",
        );
        assert_eq!(resolver.resolve(&failure), ConnectivityStatus::Failed);
    }

    #[test]
    fn configured_patterns_are_misconfigured() {
        let resolver = DefaultStatusResolver::new(["Not Authorized"]);
        let failure = ConnectionFailure::new(
            ConnectivityError::driver("connect", "broker said: not authorized"),
            "CONNACK rejected",
        );
        assert_eq!(resolver.resolve(&failure), ConnectivityStatus::Misconfigured);
    }
}
