pub mod backend;
pub mod clock;
pub mod events;
pub mod installplan;
pub mod kube_backend;
pub mod package;
pub mod rbac;

#[cfg(test)]
pub mod mock;

pub use installplan::{error_policy, reconcile, Context, ReconcileError};
