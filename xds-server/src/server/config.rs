//! Configuration for the discovery server.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::error::{Error, Result};

/// Configuration for the discovery server.
///
/// Durations serialize as integer milliseconds.
///
/// # Example
///
/// ```
/// use xds_server::ServerConfig;
/// use std::time::Duration;
///
/// let config = ServerConfig::default()
///     .with_debounce(Duration::from_millis(50), Duration::from_secs(5)).unwrap()
///     .with_flow_control(true, Duration::from_secs(10))
///     .with_push_throttle(16).unwrap();
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Quiet period after the last config change before a push starts.
    ///
    /// Default: 100 milliseconds.
    #[serde(with = "millis")]
    pub debounce_after: Duration,

    /// Upper bound on how long a burst of changes can delay a push,
    /// measured from the first change in the window.
    ///
    /// Default: 10 seconds.
    #[serde(with = "millis")]
    pub debounce_max: Duration,

    /// Whether incremental (endpoint only) pushes are debounced too.
    ///
    /// Default: true.
    pub enable_eds_debounce: bool,

    /// Whether pushes wait for the proxy to acknowledge the previous
    /// response of the same type.
    ///
    /// Default: false.
    pub enable_flow_control: bool,

    /// How long a push may stay blocked on an unacknowledged response.
    ///
    /// Default: 15 seconds.
    #[serde(with = "millis")]
    pub flow_control_timeout: Duration,

    /// Deadline for writing one response to a stream.
    ///
    /// Default: 20 seconds.
    #[serde(with = "millis")]
    pub send_timeout: Duration,

    /// Maximum number of connections being pushed concurrently.
    ///
    /// Default: 100.
    pub push_throttle: usize,

    /// Requests buffered between a connection's receive task and its event
    /// loop.
    ///
    /// Default: 1.
    pub request_buffer: usize,

    /// Whether the proxy's namespace and service account must match an
    /// authenticated identity.
    ///
    /// Default: false.
    pub identity_check: bool,

    /// The cluster this control plane runs in.
    ///
    /// Default: `"Kubernetes"`.
    pub cluster_id: String,

    /// Namespace whose EnvoyFilters and policies apply mesh wide.
    ///
    /// Default: `"mesh-system"`.
    pub root_namespace: String,

    /// SPIFFE trust domain of workload identities.
    ///
    /// Default: `"cluster.local"`.
    pub trust_domain: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            debounce_after: Duration::from_millis(100),
            debounce_max: Duration::from_secs(10),
            enable_eds_debounce: true,
            enable_flow_control: false,
            flow_control_timeout: Duration::from_secs(15),
            send_timeout: Duration::from_secs(20),
            push_throttle: 100,
            request_buffer: 1,
            identity_check: false,
            cluster_id: "Kubernetes".to_string(),
            root_namespace: "mesh-system".to_string(),
            trust_domain: "cluster.local".to_string(),
        }
    }
}

impl ServerConfig {
    /// Parse a configuration from JSON, filling unset keys with defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Validation(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the builder methods enforce.
    pub fn validate(&self) -> Result<()> {
        if self.debounce_after.is_zero() {
            return Err(Error::Validation(
                "debounce_after must be greater than zero".into(),
            ));
        }
        if self.debounce_max < self.debounce_after {
            let (after, max) = (self.debounce_after, self.debounce_max);
            return Err(Error::Validation(format!(
                "debounce_max ({max:?}) must be >= debounce_after ({after:?})"
            )));
        }
        if self.push_throttle == 0 {
            return Err(Error::Validation("push_throttle must be at least 1".into()));
        }
        if self.push_throttle > Semaphore::MAX_PERMITS {
            return Err(Error::Validation(format!(
                "push_throttle must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if self.enable_flow_control && self.flow_control_timeout.is_zero() {
            return Err(Error::Validation(
                "flow_control_timeout must be greater than zero".into(),
            ));
        }
        if self.request_buffer == 0 {
            return Err(Error::Validation("request_buffer must be at least 1".into()));
        }
        if self.send_timeout.is_zero() {
            return Err(Error::Validation(
                "send_timeout must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Set the debounce window.
    ///
    /// # Errors
    ///
    /// Returns an error if `after` is zero or `max` is shorter than `after`.
    pub fn with_debounce(mut self, after: Duration, max: Duration) -> Result<Self> {
        self.debounce_after = after;
        self.debounce_max = max;
        self.validate()?;
        Ok(self)
    }

    /// Set whether incremental pushes are debounced.
    pub fn with_eds_debounce(mut self, enabled: bool) -> Self {
        self.enable_eds_debounce = enabled;
        self
    }

    /// Enable or disable flow control with the given timeout.
    pub fn with_flow_control(mut self, enabled: bool, timeout: Duration) -> Self {
        self.enable_flow_control = enabled;
        self.flow_control_timeout = timeout;
        self
    }

    /// Set the per-response send deadline.
    ///
    /// # Errors
    ///
    /// Returns an error if `timeout` is zero.
    pub fn with_send_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.send_timeout = timeout;
        self.validate()?;
        Ok(self)
    }

    /// Set how many connections may be pushed at once.
    ///
    /// # Errors
    ///
    /// Returns an error if `limit` is zero.
    pub fn with_push_throttle(mut self, limit: usize) -> Result<Self> {
        self.push_throttle = limit;
        self.validate()?;
        Ok(self)
    }

    /// Require proxies to match their authenticated identity.
    pub fn with_identity_check(mut self, enabled: bool) -> Self {
        self.identity_check = enabled;
        self
    }

    /// Set the local cluster ID.
    pub fn with_cluster_id(mut self, cluster_id: impl Into<String>) -> Self {
        self.cluster_id = cluster_id.into();
        self
    }

    /// Set the mesh root namespace.
    pub fn with_root_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.root_namespace = namespace.into();
        self
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(
        duration: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
