//! Public, transport-agnostic RPC configuration.
//!
//! This type intentionally contains no transport-specific concepts.
//! Transport layers are responsible for interpreting this config into
//! concrete connection settings.

use std::time::Duration;

/// Transport configuration and connection parameters.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    // ---
    /// Transport connection URI.
    ///
    /// For broker-based transports this specifies the broker address
    /// (e.g. "amqp://localhost:5672/%2f"). `None` selects the in-memory
    /// transport.
    pub transport_uri: Option<String>,

    /// Unique identifier for this transport instance, used for logging and
    /// consumer tags.
    pub transport_id: String,

    /// Deadline for each `call` that does not supply its own.
    ///
    /// Every call is deadline-bound so that the correlation table never
    /// retains an entry indefinitely.
    ///
    /// Default: 30 seconds
    pub request_timeout: Duration,
}

impl RpcConfig {
    /// Create a new `RpcConfig` with the given broker URI.
    pub fn with_broker(transport_uri: impl Into<String>, transport_id: impl Into<String>) -> Self {
        Self {
            transport_uri: Some(transport_uri.into()),
            transport_id: transport_id.into(),
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Create a memory transport config (no broker).
    pub fn memory(transport_id: impl Into<String>) -> Self {
        Self {
            transport_uri: None,
            transport_id: transport_id.into(),
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Set the default per-call deadline.
    ///
    /// # Example
    ///
    /// ```
    /// use direct_rpc::RpcConfig;
    /// use std::time::Duration;
    ///
    /// let config = RpcConfig::with_broker("amqp://localhost:5672/%2f", "client")
    ///     .with_request_timeout(Duration::from_secs(10));
    /// ```
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}
