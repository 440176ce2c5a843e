//! Pool membership controller
//!
//! [`Reconciler`] runs single observe-diff-act passes; [`Dispatcher`] decides
//! when to run them.

mod dispatch;
mod reconciler;

pub use dispatch::{machine_triggers, next_step, Dispatcher, Next};
pub use reconciler::{PassError, PassReport, PassStep, Reconciler, Trigger};
