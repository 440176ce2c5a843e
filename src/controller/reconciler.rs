//! Reconciler core
//!
//! One pass observes the cluster and the pool, computes the diff, and applies
//! it: fetch machines, build desired membership, fetch observed membership,
//! diff, register, deregister. Each pass starts from fresh snapshots and
//! carries nothing into the next one except which data-integrity warnings were
//! already logged, so passes may overlap and events may be lost or reordered
//! without breaking convergence.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::ResourceExt;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::classify::RoleClassifier;
use crate::config::ControllerConfig;
use crate::crd::Machine;
use crate::error::FailureKind;
use crate::membership::{self, DesiredMembership, InstanceSet};
use crate::provider::MembershipClient;
use crate::source::MachineSource;
use crate::Error;

/// What caused a reconciliation pass
///
/// Only used for logging: every pass recomputes the whole pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Trigger {
    /// A machine was added, updated or deleted
    MachineChanged {
        /// Machine namespace
        namespace: String,
        /// Machine name
        name: String,
    },
    /// Periodic resync or retry
    Resync,
}

impl Trigger {
    /// Trigger for a change to the given machine
    pub fn changed(machine: &Machine) -> Self {
        Self::MachineChanged {
            namespace: machine.namespace().unwrap_or_default(),
            name: machine.name_any(),
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MachineChanged { namespace, name } => write!(f, "machine {}/{}", namespace, name),
            Self::Resync => write!(f, "resync"),
        }
    }
}

/// Step of a pass that made an external call
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum PassStep {
    /// Listing machines from the source
    FetchMachines,
    /// Listing pool members
    FetchMembers,
    /// Registering instances
    Register,
    /// Deregistering instances
    Deregister,
}

impl std::fmt::Display for PassStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FetchMachines => write!(f, "fetch machines"),
            Self::FetchMembers => write!(f, "fetch members"),
            Self::Register => write!(f, "register"),
            Self::Deregister => write!(f, "deregister"),
        }
    }
}

/// What a pass saw and changed
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassReport {
    /// Instances that should be in the pool
    pub desired: InstanceSet,
    /// Instances the pool held at the start of the pass
    pub observed: InstanceSet,
    /// Instances confirmed registered by this pass
    pub registered: InstanceSet,
    /// Instances confirmed deregistered by this pass
    pub deregistered: InstanceSet,
    /// Instances the provider refused to register, with its reason
    pub rejected: BTreeMap<String, String>,
}

impl PassReport {
    /// True when the pass made no mutation call
    pub fn is_noop(&self) -> bool {
        self.registered.is_empty() && self.deregistered.is_empty() && self.rejected.is_empty()
    }
}

/// A pass that stopped at a failed external call
///
/// `completed` holds whatever the pass confirmed before the failure; a
/// registration that succeeded before a failed deregistration stays in place.
#[derive(Debug, Error)]
#[error("{step} failed: {error}")]
pub struct PassError {
    /// Step that failed
    pub step: PassStep,
    /// Underlying failure
    #[source]
    pub error: Error,
    /// Progress made before the failure
    pub completed: PassReport,
    /// Shortest sensible wait before the next pass; `None` when retrying
    /// cannot help
    pub retry_after: Option<Duration>,
}

impl PassError {
    /// Wrap a failed step
    ///
    /// Retryable failures suggest the provider's own hint when it gave one,
    /// otherwise `default_delay`.
    pub fn new(step: PassStep, error: Error, completed: PassReport, default_delay: Duration) -> Self {
        let retry_after = match error.kind() {
            FailureKind::Fatal => None,
            FailureKind::Retryable => Some(error.retry_hint().unwrap_or(default_delay)),
        };
        Self {
            step,
            error,
            completed,
            retry_after,
        }
    }

    /// How the dispatcher should treat this failure
    pub fn kind(&self) -> FailureKind {
        self.error.kind()
    }

    /// Suggested wait before retrying, if the failure is retryable
    pub fn suggested_retry(&self) -> Option<Duration> {
        self.retry_after
    }
}

/// Reconciles one load balancer pool against one machine scope
///
/// Collaborators are injected; the reconciler holds no client state of its own.
pub struct Reconciler {
    source: Arc<dyn MachineSource>,
    client: Arc<dyn MembershipClient>,
    classifier: RoleClassifier,
    config: ControllerConfig,
    warned_duplicates: Mutex<BTreeSet<String>>,
    warned_overdue: Mutex<BTreeSet<String>>,
}

impl Reconciler {
    /// Create a reconciler
    ///
    /// # Errors
    ///
    /// A fatal [`Error::Configuration`] when `config` cannot drive a pass.
    pub fn new(
        source: Arc<dyn MachineSource>,
        client: Arc<dyn MembershipClient>,
        config: ControllerConfig,
    ) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            source,
            client,
            classifier: RoleClassifier::new(config.control_plane_role.clone()),
            config,
            warned_duplicates: Mutex::default(),
            warned_overdue: Mutex::default(),
        })
    }

    /// Configuration this reconciler runs with
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Run one reconciliation pass
    ///
    /// Registers before deregistering so a control-plane swap never leaves
    /// the pool short. Any failed external call ends the pass; nothing that
    /// was confirmed is rolled back, the next pass picks up the rest.
    #[instrument(skip_all, fields(pool = %self.config.pool_id, namespace = %self.config.namespace, trigger = %trigger))]
    pub async fn reconcile(&self, trigger: &Trigger) -> Result<PassReport, PassError> {
        let pool = self.config.pool_id.as_str();
        let mut report = PassReport::default();

        let snapshot = self
            .bounded("list_machines", self.source.list_machines(&self.config.namespace))
            .await
            .map_err(|e| self.fail(PassStep::FetchMachines, e, &report))?;

        let desired = membership::desired(&self.classifier, &snapshot);
        self.report_integrity(&desired);
        report.desired = desired.instances;

        let observed = self
            .bounded("list_members", self.client.list_members(pool))
            .await
            .map_err(|e| self.fail(PassStep::FetchMembers, e, &report))?;
        report.observed = observed;

        let diff = membership::diff(&report.desired, &report.observed);
        if diff.is_empty() {
            debug!(members = report.observed.len(), "pool already converged");
            return Ok(report);
        }

        if !diff.to_register.is_empty() {
            info!(instances = ?diff.to_register, "registering instances");
            let outcome = self
                .bounded(
                    "register_instances",
                    self.client.register_instances(pool, &diff.to_register),
                )
                .await
                .map_err(|e| self.fail(PassStep::Register, e, &report))?;

            for (instance_id, reason) in &outcome.rejected {
                warn!(instance_id = %instance_id, reason = %reason, "provider rejected instance");
            }
            report.registered = outcome.registered;
            report.rejected = outcome.rejected;
        }

        if !diff.to_deregister.is_empty() {
            info!(instances = ?diff.to_deregister, "deregistering instances");
            self.bounded(
                "deregister_instances",
                self.client.deregister_instances(pool, &diff.to_deregister),
            )
            .await
            .map_err(|e| self.fail(PassStep::Deregister, e, &report))?;
            report.deregistered = diff.to_deregister;
        }

        info!(
            registered = report.registered.len(),
            deregistered = report.deregistered.len(),
            rejected = report.rejected.len(),
            "reconciled pool membership"
        );
        Ok(report)
    }

    /// Await an external call, failing it once the call deadline passes
    ///
    /// The call future is dropped on timeout, so nothing stays in flight
    /// after the pass returns.
    async fn bounded<T, F>(&self, operation: &str, call: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        match tokio::time::timeout(self.config.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(operation, self.config.call_timeout)),
        }
    }

    fn fail(&self, step: PassStep, error: Error, report: &PassReport) -> PassError {
        warn!(step = %step, error = %error, "reconciliation pass failed");
        PassError::new(step, error, report.clone(), self.config.retry.initial_delay)
    }

    /// Log data-integrity warnings; they never block the pass
    ///
    /// Each condition is logged at warn the first pass it shows up and at
    /// debug on later passes while it persists.
    fn report_integrity(&self, desired: &DesiredMembership) {
        let fresh = newly_seen(
            &mut self.warned_duplicates.lock(),
            desired.duplicates.iter().map(|d| d.instance_id.clone()).collect(),
        );
        for dup in &desired.duplicates {
            if fresh.contains(&dup.instance_id) {
                warn!(
                    instance_id = %dup.instance_id,
                    machines = ?dup.machines,
                    "instance id claimed by more than one machine"
                );
            } else {
                debug!(instance_id = %dup.instance_id, "instance id still claimed by more than one machine");
            }
        }

        let grace = chrono::Duration::from_std(self.config.missing_instance_grace)
            .unwrap_or(chrono::TimeDelta::MAX);
        let overdue = desired.overdue(Utc::now(), grace);
        let fresh = newly_seen(
            &mut self.warned_overdue.lock(),
            overdue.iter().map(|m| m.machine.clone()).collect(),
        );
        for machine in overdue {
            if fresh.contains(&machine.machine) {
                warn!(
                    machine = %machine.machine,
                    grace_secs = self.config.missing_instance_grace.as_secs(),
                    "control-plane machine still has no instance id"
                );
            } else {
                debug!(machine = %machine.machine, "control-plane machine still has no instance id");
            }
        }
    }
}

/// Replace `seen` with `current`, returning the keys that were not in `seen`
///
/// Keys that drop out of `current` are forgotten, so a condition that clears
/// and comes back is reported again.
fn newly_seen(seen: &mut BTreeSet<String>, current: BTreeSet<String>) -> BTreeSet<String> {
    let fresh = current.difference(seen).cloned().collect();
    *seen = current;
    fresh
}
