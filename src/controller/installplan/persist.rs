//! Optimistic-concurrency helpers for InstallPlan status writes
//!
//! A status write re-reads the latest object, applies only what this reconcile
//! changed, and patches the status pinned to the fresh resourceVersion. A 409
//! Conflict restarts the cycle, up to a bounded number of attempts.

use crate::crd::installplan::InstallPlanStatus;
use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

const CONFLICT_BACKOFF: Duration = Duration::from_millis(50);

pub fn is_conflict(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(e) if e.code == 409)
}

pub fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(e) if e.code == 404)
}

/// Run `operation` until it succeeds or fails with something other than a conflict
///
/// # Arguments
/// * `attempts` - Maximum number of tries, at least one is always made
/// * `operation_name` - Name for logging
/// * `operation` - Read-modify-write cycle to retry
pub async fn retry_on_conflict<F, Fut, T>(
    attempts: u32,
    operation_name: &str,
    mut operation: F,
) -> Result<T, kube::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, kube::Error>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match operation().await {
            Err(e) if is_conflict(&e) && attempt < attempts => {
                debug!(
                    operation = %operation_name,
                    attempt = attempt,
                    "Conflict, retrying with fresh resourceVersion"
                );
                tokio::time::sleep(CONFLICT_BACKOFF * attempt).await;
            }
            Err(e) => {
                if is_conflict(&e) {
                    warn!(
                        operation = %operation_name,
                        attempts = attempts,
                        "Giving up after repeated conflicts"
                    );
                }
                return Err(e);
            }
            Ok(value) => return Ok(value),
        }
    }
}

/// Apply the difference between `observed` and `desired` onto `current`
///
/// `observed` is the status this reconcile started from, `desired` the status
/// it computed and `current` the latest status on the server. Branches this
/// reconcile did not touch keep whatever `current` holds.
pub fn apply_delta(
    current: &InstallPlanStatus,
    observed: &InstallPlanStatus,
    desired: &InstallPlanStatus,
) -> InstallPlanStatus {
    let mut merged = current.clone();

    if observed.target_namespace != desired.target_namespace {
        merged.target_namespace = desired.target_namespace.clone();
    }
    if observed.release_name != desired.release_name {
        merged.release_name = desired.release_name.clone();
    }
    if observed.enabled != desired.enabled {
        merged.enabled = desired.enabled;
    }
    if observed.installation_status != desired.installation_status {
        merged.installation_status = desired.installation_status.clone();
    }

    let clusters: BTreeSet<&String> = observed
        .cluster_scheduling_statuses
        .keys()
        .chain(desired.cluster_scheduling_statuses.keys())
        .collect();

    for cluster in clusters {
        let before = observed.cluster_scheduling_statuses.get(cluster);
        let after = desired.cluster_scheduling_statuses.get(cluster);
        if before == after {
            continue;
        }
        match after {
            Some(branch) => {
                merged
                    .cluster_scheduling_statuses
                    .insert(cluster.clone(), branch.clone());
            }
            None => {
                merged.cluster_scheduling_statuses.remove(cluster);
            }
        }
    }

    merged
}
