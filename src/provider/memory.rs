//! In-memory load balancer pool
//!
//! Follows the [`MembershipClient`] contract exactly: mutations are idempotent
//! and register calls return per-instance results. Every call is recorded so
//! callers can inspect ordering, and failures can be injected per operation.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use super::{MembershipClient, RegisterOutcome};
use crate::membership::InstanceSet;
use crate::Error;

/// Operations accepted by the pool
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolOperation {
    /// `list_members`
    List,
    /// `register_instances`
    Register,
    /// `deregister_instances`
    Deregister,
}

/// A call made against the pool, in arrival order
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PoolCall {
    /// Membership was listed
    List,
    /// Instances were submitted for registration
    Register(InstanceSet),
    /// Instances were submitted for deregistration
    Deregister(InstanceSet),
}

#[derive(Default)]
struct PoolState {
    members: BTreeMap<String, InstanceSet>,
    invalid: BTreeMap<String, String>,
    calls: Vec<PoolCall>,
    failures: VecDeque<(PoolOperation, Error)>,
}

impl PoolState {
    /// Pop the first queued failure for `op`, if any
    fn take_failure(&mut self, op: PoolOperation) -> Option<Error> {
        let idx = self.failures.iter().position(|(o, _)| *o == op)?;
        self.failures.remove(idx).map(|(_, e)| e)
    }

    fn pool_mut(&mut self, pool_id: &str) -> Result<&mut InstanceSet, Error> {
        self.members
            .get_mut(pool_id)
            .ok_or_else(|| Error::provider(format!("load balancer {} not found", pool_id)))
    }
}

/// Load balancer pools held in memory
#[derive(Clone, Default)]
pub struct InMemoryPool {
    state: Arc<Mutex<PoolState>>,
}

impl InMemoryPool {
    /// Create an empty pool with the given id
    pub fn new(pool_id: impl Into<String>) -> Self {
        Self::with_members(pool_id, std::iter::empty::<String>())
    }

    /// Create a pool pre-populated with members
    pub fn with_members<I, S>(pool_id: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let pool = Self::default();
        pool.state.lock().members.insert(
            pool_id.into(),
            members.into_iter().map(Into::into).collect(),
        );
        pool
    }

    /// Refuse registration of an instance with the given reason
    pub fn reject_instance(&self, instance_id: impl Into<String>, reason: impl Into<String>) {
        self.state
            .lock()
            .invalid
            .insert(instance_id.into(), reason.into());
    }

    /// Make the next call of `op` fail with `error`
    pub fn fail_next(&self, op: PoolOperation, error: Error) {
        self.state.lock().failures.push_back((op, error));
    }

    /// Current members of a pool (empty for unknown pools)
    pub fn members(&self, pool_id: &str) -> InstanceSet {
        self.state
            .lock()
            .members
            .get(pool_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Add or remove members behind the controller's back
    pub fn set_members<I, S>(&self, pool_id: &str, members: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state.lock().members.insert(
            pool_id.to_string(),
            members.into_iter().map(Into::into).collect(),
        );
    }

    /// Every call made so far, in order
    pub fn calls(&self) -> Vec<PoolCall> {
        self.state.lock().calls.clone()
    }

    /// Calls that would have changed the pool
    pub fn mutations(&self) -> Vec<PoolCall> {
        self.calls()
            .into_iter()
            .filter(|c| !matches!(c, PoolCall::List))
            .collect()
    }

    /// Forget recorded calls
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }
}

#[async_trait]
impl MembershipClient for InMemoryPool {
    async fn list_members(&self, pool_id: &str) -> Result<InstanceSet, Error> {
        let mut state = self.state.lock();
        state.calls.push(PoolCall::List);
        if let Some(err) = state.take_failure(PoolOperation::List) {
            return Err(err);
        }
        state.pool_mut(pool_id).map(|members| members.clone())
    }

    async fn register_instances(
        &self,
        pool_id: &str,
        instances: &InstanceSet,
    ) -> Result<RegisterOutcome, Error> {
        let mut state = self.state.lock();
        state.calls.push(PoolCall::Register(instances.clone()));
        if let Some(err) = state.take_failure(PoolOperation::Register) {
            return Err(err);
        }

        let rejected: BTreeMap<String, String> = instances
            .iter()
            .filter_map(|id| state.invalid.get(id).map(|r| (id.clone(), r.clone())))
            .collect();
        let registered: BTreeSet<String> = instances
            .iter()
            .filter(|id| !rejected.contains_key(*id))
            .cloned()
            .collect();

        state.pool_mut(pool_id)?.extend(registered.iter().cloned());
        info!(pool = %pool_id, registered = registered.len(), rejected = rejected.len(), "registered instances");

        Ok(RegisterOutcome {
            registered,
            rejected,
        })
    }

    async fn deregister_instances(
        &self,
        pool_id: &str,
        instances: &InstanceSet,
    ) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.calls.push(PoolCall::Deregister(instances.clone()));
        if let Some(err) = state.take_failure(PoolOperation::Deregister) {
            return Err(err);
        }

        let pool = state.pool_mut(pool_id)?;
        pool.retain(|id| !instances.contains(id));
        info!(pool = %pool_id, deregistered = instances.len(), "deregistered instances");
        Ok(())
    }
}
