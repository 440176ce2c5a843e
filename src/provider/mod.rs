//! Load balancer membership clients
//!
//! The [`MembershipClient`] trait is the boundary to the cloud API. Adapters
//! for a real provider implement it; [`InMemoryPool`] is the reference
//! implementation used for dry runs and tests.
//!
//! # Contract
//!
//! Overlapping reconciliation passes may issue the same call twice, so every
//! implementation must make mutations idempotent:
//! - registering an instance that is already registered succeeds
//! - deregistering an instance that is not registered succeeds

mod memory;

pub use memory::{InMemoryPool, PoolCall, PoolOperation};

use std::collections::BTreeMap;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::membership::InstanceSet;
use crate::Error;

/// Per-instance result of a register call
///
/// Providers that can report partial batch results put refused ids in
/// `rejected` and still register the rest.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegisterOutcome {
    /// Instance ids now registered with the pool
    pub registered: InstanceSet,
    /// Instance ids the provider refused, with its reason
    pub rejected: BTreeMap<String, String>,
}

impl RegisterOutcome {
    /// Outcome where every requested instance was registered
    pub fn all(instances: &InstanceSet) -> Self {
        Self {
            registered: instances.clone(),
            rejected: BTreeMap::new(),
        }
    }

    /// True when nothing was rejected
    pub fn is_complete(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// Trait abstracting load balancer pool membership operations
///
/// This trait allows mocking the cloud API in tests while production code
/// talks to the provider.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MembershipClient: Send + Sync {
    /// List the instance ids currently registered with the pool
    ///
    /// # Errors
    ///
    /// [`Error::ProviderUnavailable`] when the provider cannot be reached.
    async fn list_members(&self, pool_id: &str) -> Result<InstanceSet, Error>;

    /// Register instances with the pool
    ///
    /// # Errors
    ///
    /// [`Error::ProviderUnavailable`] on provider failure, or
    /// [`Error::InvalidInstance`] when the provider refuses instances and
    /// cannot report per-instance results. Per-instance refusals go in
    /// [`RegisterOutcome::rejected`] instead.
    async fn register_instances(
        &self,
        pool_id: &str,
        instances: &InstanceSet,
    ) -> Result<RegisterOutcome, Error>;

    /// Deregister instances from the pool
    ///
    /// Instances that are not registered are skipped without error.
    ///
    /// # Errors
    ///
    /// [`Error::ProviderUnavailable`] on provider failure.
    async fn deregister_instances(&self, pool_id: &str, instances: &InstanceSet)
        -> Result<(), Error>;
}
