//! Machine LB Controller - keeps a load balancer pool in sync with control-plane machines
//!
//! The controller watches `Machine` objects, works out which of them are running
//! control-plane instances, and registers or deregisters those instances with a
//! single load balancer backend pool until the pool matches the cluster.
//!
//! # Architecture
//!
//! Every trigger (a machine change or a resync tick) runs one full pass:
//! - Fetch a fresh snapshot of machines from the [`source::MachineSource`]
//! - Build the desired membership with the [`classify::RoleClassifier`]
//! - Fetch the observed membership from the [`provider::MembershipClient`]
//! - Register what is missing, then deregister what is stale
//!
//! Nothing is carried between passes, so missed, duplicated or reordered events
//! only cost an extra pass.
//!
//! # Modules
//!
//! - [`crd`] - Machine resource types and the decoded [`crd::MachineRecord`]
//! - [`classify`] - Role classification and eligibility
//! - [`membership`] - Desired-state builder and membership diff
//! - [`source`] - Machine record sources (Kubernetes, static)
//! - [`provider`] - Load balancer membership clients
//! - [`controller`] - Reconciler core and trigger dispatcher
//! - [`config`] - Controller configuration
//! - [`retry`] - Backoff policy for retryable failures
//! - [`telemetry`] - Logging setup
//! - [`error`] - Error types for the controller

#![deny(missing_docs)]

pub mod classify;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod membership;
pub mod provider;
pub mod retry;
pub mod source;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Label carrying the machine role on machine-api `Machine` objects
pub const DEFAULT_ROLE_LABEL: &str = "machine.openshift.io/cluster-api-machine-type";

/// Role label value that marks a control-plane machine
pub const DEFAULT_CONTROL_PLANE_ROLE: &str = "master";

/// Namespace the machine-api operator keeps `Machine` objects in
pub const DEFAULT_MACHINE_NAMESPACE: &str = "openshift-machine-api";
