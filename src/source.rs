//! Machine record sources
//!
//! A source returns a complete snapshot of decoded [`MachineRecord`]s for a
//! scope key. Provider payloads are decoded here so the reconciler never
//! sees raw objects.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, ListParams};
use kube::Client;
use parking_lot::RwLock;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::{Machine, MachineRecord};
use crate::{Error, DEFAULT_ROLE_LABEL};

/// Trait abstracting where machine snapshots come from
///
/// This trait allows mocking the machine store in tests while using the
/// Kubernetes API in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MachineSource: Send + Sync {
    /// List every machine in the scope
    ///
    /// # Arguments
    ///
    /// * `scope` - Grouping key for the cluster's machines (the namespace)
    ///
    /// # Errors
    ///
    /// [`Error::SourceUnavailable`] on transport or auth failures.
    async fn list_machines(&self, scope: &str) -> Result<Vec<MachineRecord>, Error>;
}

/// Machine source backed by machine-api `Machine` objects
pub struct KubeMachineSource {
    client: Client,
    role_label: String,
}

impl KubeMachineSource {
    /// Create a source reading the role from the default role label
    pub fn new(client: Client) -> Self {
        Self::with_role_label(client, DEFAULT_ROLE_LABEL)
    }

    /// Create a source reading the role from a custom label
    pub fn with_role_label(client: Client, role_label: impl Into<String>) -> Self {
        Self {
            client,
            role_label: role_label.into(),
        }
    }
}

#[async_trait]
impl MachineSource for KubeMachineSource {
    async fn list_machines(&self, scope: &str) -> Result<Vec<MachineRecord>, Error> {
        let api: Api<Machine> = Api::namespaced(self.client.clone(), scope);
        let machines = api
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::source_unavailable(format!("failed to list machines: {}", e)))?;

        debug!(namespace = %scope, count = machines.items.len(), "listed machines");

        Ok(machines
            .items
            .iter()
            .map(|m| m.to_record(&self.role_label))
            .collect())
    }
}

/// Machine source holding records in memory
///
/// The snapshot can be replaced at any time, which makes it useful for
/// driving the reconciler through a sequence of cluster states.
#[derive(Clone, Default)]
pub struct StaticMachineSource {
    records: Arc<RwLock<Vec<MachineRecord>>>,
}

impl StaticMachineSource {
    /// Create a source serving the given records
    pub fn new(records: Vec<MachineRecord>) -> Self {
        Self {
            records: Arc::new(RwLock::new(records)),
        }
    }

    /// Replace the served snapshot
    pub fn set(&self, records: Vec<MachineRecord>) {
        *self.records.write() = records;
    }
}

#[async_trait]
impl MachineSource for StaticMachineSource {
    async fn list_machines(&self, scope: &str) -> Result<Vec<MachineRecord>, Error> {
        Ok(self
            .records
            .read()
            .iter()
            .filter(|r| r.namespace == scope)
            .cloned()
            .collect())
    }
}
