//! Controller configuration
//!
//! The load balancer pool is never discovered: it must be named explicitly.
//! [`ControllerConfig::validate`] turns unusable settings into a fatal
//! [`Error::Configuration`].

use std::time::Duration;

use crate::retry::RetryConfig;
use crate::{Error, DEFAULT_CONTROL_PLANE_ROLE, DEFAULT_MACHINE_NAMESPACE, DEFAULT_ROLE_LABEL};

/// Default interval between full resync passes
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Default deadline for a single external call
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time a control-plane machine may lack an instance id before it is reported
pub const DEFAULT_MISSING_INSTANCE_GRACE: Duration = Duration::from_secs(600);

/// Settings for one reconciliation scope
#[derive(Clone, Debug, PartialEq)]
pub struct ControllerConfig {
    /// Load balancer pool that fronts the control plane
    pub pool_id: String,
    /// Namespace the machines live in (the scope key)
    pub namespace: String,
    /// Label carrying the machine role
    pub role_label: String,
    /// Role label value marking control-plane machines
    pub control_plane_role: String,
    /// Interval between full resync passes
    pub resync_interval: Duration,
    /// Deadline for each external call made during a pass
    pub call_timeout: Duration,
    /// How long a control-plane machine may go without an instance id
    pub missing_instance_grace: Duration,
    /// Backoff for failed passes
    pub retry: RetryConfig,
}

impl ControllerConfig {
    /// Create a config for the given pool with default settings
    pub fn new(pool_id: impl Into<String>) -> Self {
        Self {
            pool_id: pool_id.into(),
            namespace: DEFAULT_MACHINE_NAMESPACE.to_string(),
            role_label: DEFAULT_ROLE_LABEL.to_string(),
            control_plane_role: DEFAULT_CONTROL_PLANE_ROLE.to_string(),
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            missing_instance_grace: DEFAULT_MISSING_INSTANCE_GRACE,
            retry: RetryConfig::infinite(),
        }
    }

    /// Set the machine namespace
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the role label key and control-plane value
    pub fn control_plane(mut self, label: impl Into<String>, role: impl Into<String>) -> Self {
        self.role_label = label.into();
        self.control_plane_role = role.into();
        self
    }

    /// Set the per-call deadline
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Set the resync interval
    pub fn resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    /// Check the config can drive reconciliation
    pub fn validate(&self) -> Result<(), Error> {
        if self.pool_id.trim().is_empty() {
            return Err(Error::configuration("no load balancer pool id configured"));
        }
        if self.namespace.is_empty() {
            return Err(Error::configuration("machine namespace must not be empty"));
        }
        if self.role_label.is_empty() {
            return Err(Error::configuration("role label must not be empty"));
        }
        if self.control_plane_role.is_empty() {
            return Err(Error::configuration(
                "control-plane role value must not be empty",
            ));
        }
        if self.call_timeout.is_zero() {
            return Err(Error::configuration("call timeout must be greater than zero"));
        }
        if self.resync_interval.is_zero() {
            return Err(Error::configuration(
                "resync interval must be greater than zero",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;

    #[test]
    fn test_defaults_are_valid() {
        let config = ControllerConfig::new("api-int");
        assert!(config.validate().is_ok());
        assert_eq!(config.namespace, DEFAULT_MACHINE_NAMESPACE);
        assert_eq!(config.role_label, DEFAULT_ROLE_LABEL);
        assert_eq!(config.control_plane_role, "master");
        assert_eq!(config.resync_interval, Duration::from_secs(60));
    }

    /// Story: a controller started without a pool cannot guess one
    #[test]
    fn story_missing_pool_is_fatal() {
        for pool in ["", "   "] {
            let err = ControllerConfig::new(pool).validate().unwrap_err();
            assert_eq!(err.kind(), FailureKind::Fatal);
            assert!(err.to_string().contains("pool id"));
        }
    }

    #[test]
    fn test_empty_control_plane_role_is_fatal() {
        let config = ControllerConfig::new("api-int").control_plane(DEFAULT_ROLE_LABEL, "");
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), FailureKind::Fatal);
    }

    #[test]
    fn test_zero_durations_are_rejected() {
        let config = ControllerConfig::new("api-int").call_timeout(Duration::ZERO);
        assert!(config.validate().is_err());

        let config = ControllerConfig::new("api-int").resync_interval(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder_setters() {
        let config = ControllerConfig::new("api-int")
            .namespace("default")
            .control_plane("node-role.example.com/kind", "control-plane")
            .call_timeout(Duration::from_secs(5));

        assert_eq!(config.namespace, "default");
        assert_eq!(config.role_label, "node-role.example.com/kind");
        assert_eq!(config.control_plane_role, "control-plane");
        assert_eq!(config.call_timeout, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }
}
