pub mod branch;
pub mod dispatch;
pub mod persist;
pub mod prerequisites;
pub mod reconcile;
pub mod sync;
pub mod targets;
pub mod transition;

pub use reconcile::{error_policy, reconcile, Context, ReconcileError};

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap/expect for brevity
#[path = "installplan_test.rs"]
mod tests;
