//! Error types for the machine LB controller
//!
//! Every failure maps onto one of two handling strategies through
//! [`Error::kind`]: retry the trigger with backoff, or halt until the
//! configuration changes.

use std::time::Duration;

use thiserror::Error;

/// How the dispatcher should treat a failed reconciliation pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// Transient failure of an external call; re-queue with backoff
    Retryable,
    /// Configuration problem that retrying cannot fix
    Fatal,
}

/// Main error type for controller operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The machine record source could not produce a snapshot
    #[error("machine source unavailable: {0}")]
    SourceUnavailable(String),

    /// The load balancer provider API failed or throttled the call
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// The provider throttled the call and asked the caller to back off
    #[error("provider throttled request, retry after {}s: {message}", retry_after.as_secs())]
    Throttled {
        /// Provider explanation
        message: String,
        /// Minimum wait the provider asked for
        retry_after: Duration,
    },

    /// The provider rejected instances and gave no per-instance result
    #[error("provider rejected instances [{}]: {message}", instances.join(", "))]
    InvalidInstance {
        /// Instance identifiers the provider refused
        instances: Vec<String>,
        /// Provider explanation
        message: String,
    },

    /// An external call exceeded its deadline and was cancelled
    #[error("{operation} timed out after {}s", timeout.as_secs())]
    Timeout {
        /// The call that timed out (e.g. "list_members")
        operation: String,
        /// Deadline that was exceeded
        timeout: Duration,
    },

    /// Controller configuration is unusable
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create a source-unavailable error with the given message
    pub fn source_unavailable(msg: impl Into<String>) -> Self {
        Self::SourceUnavailable(msg.into())
    }

    /// Create a provider-unavailable error with the given message
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::ProviderUnavailable(msg.into())
    }

    /// Create a throttling error carrying the provider's retry hint
    pub fn throttled(msg: impl Into<String>, retry_after: Duration) -> Self {
        Self::Throttled {
            message: msg.into(),
            retry_after,
        }
    }

    /// Create an invalid-instance error for a whole batch
    pub fn invalid_instance(instances: Vec<String>, msg: impl Into<String>) -> Self {
        Self::InvalidInstance {
            instances,
            message: msg.into(),
        }
    }

    /// Create a timeout error for the named operation
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// Create a configuration error with the given message
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Classify the error for the retry dispatcher
    ///
    /// A batch-level `InvalidInstance` carries no per-instance result, so the
    /// whole batch is retried like any other provider failure.
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::Configuration(_) => FailureKind::Fatal,
            Error::Kube(_)
            | Error::SourceUnavailable(_)
            | Error::ProviderUnavailable(_)
            | Error::Throttled { .. }
            | Error::InvalidInstance { .. }
            | Error::Timeout { .. } => FailureKind::Retryable,
        }
    }

    /// Wait the failing service asked for, if it gave one
    pub fn retry_hint(&self) -> Option<Duration> {
        match self {
            Error::Throttled { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Whether the trigger that produced this error should be re-queued
    pub fn is_retryable(&self) -> bool {
        self.kind() == FailureKind::Retryable
    }
}
