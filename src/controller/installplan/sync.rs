use crate::controller::backend::{ReleaseRecord, ReleaseStatus};
use crate::crd::extension::{ClusterExtensionStatus, ExtensionStatus};
use crate::crd::installplan::{InstallPlan, InstallPlanStatus, InstallationState, InstallationStatus};
use k8s_openapi::api::batch::v1::Job;

use super::dispatch::{job_action, ExecutionAction};

const DEFAULT_COMPLETIONS: i32 = 1;
const DEFAULT_BACKOFF_LIMIT: i32 = 6;

/// Where an execution job stands
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Active,
    Completed,
    Failed { message: String },
}

/// What a reconcile saw in the target for one branch
#[derive(Clone, Debug, Default)]
pub struct Observation {
    pub job: Option<Job>,
    pub release: Option<ReleaseRecord>,
}

/// Classify a job from its counters and terminal conditions
///
/// Completed once `succeeded >= completions`, failed once
/// `failed > backoffLimit`. A `Complete` or `Failed` condition set by the job
/// controller (for example on deadline) is honored as well.
pub fn job_outcome(job: &Job) -> JobOutcome {
    let spec = job.spec.as_ref();
    let completions = spec.and_then(|s| s.completions).unwrap_or(DEFAULT_COMPLETIONS);
    let backoff_limit = spec.and_then(|s| s.backoff_limit).unwrap_or(DEFAULT_BACKOFF_LIMIT);

    let status = job.status.as_ref();
    let succeeded = status.and_then(|s| s.succeeded).unwrap_or(0);
    let failed = status.and_then(|s| s.failed).unwrap_or(0);
    let conditions = status.and_then(|s| s.conditions.as_deref()).unwrap_or_default();

    let condition = |type_: &str| {
        conditions
            .iter()
            .find(|c| c.type_ == type_ && c.status == "True")
    };

    if succeeded >= completions || condition("Complete").is_some() {
        return JobOutcome::Completed;
    }

    let failed_condition = condition("Failed");
    if failed > backoff_limit || failed_condition.is_some() {
        let message = failed_condition
            .and_then(|c| c.message.clone().or_else(|| c.reason.clone()))
            .unwrap_or_else(|| {
                format!(
                    "execution job {} failed",
                    job.metadata.name.as_deref().unwrap_or_default()
                )
            });
        return JobOutcome::Failed { message };
    }

    JobOutcome::Active
}

/// State implied by a job outcome for the action it ran
pub fn state_for_job(
    action: ExecutionAction,
    outcome: &JobOutcome,
    release_present: bool,
) -> InstallationState {
    use ExecutionAction::*;
    use InstallationState::*;

    match (action, outcome) {
        (Install, JobOutcome::Active) => Installing,
        (Install, JobOutcome::Completed) => Installed,
        (Install, JobOutcome::Failed { .. }) => InstallFailed,
        (Upgrade, JobOutcome::Active) => Upgrading,
        (Upgrade, JobOutcome::Completed) => Upgraded,
        (Upgrade, JobOutcome::Failed { .. }) => UpgradeFailed,
        (Uninstall, JobOutcome::Active) => Uninstalling,
        (Uninstall, JobOutcome::Completed) if release_present => UninstallFailed,
        (Uninstall, JobOutcome::Completed) => Uninstalled,
        (Uninstall, JobOutcome::Failed { .. }) => UninstallFailed,
    }
}

/// State implied by the release record
///
/// Revision 1 means install, anything later means upgrade.
pub fn state_for_release(release: &ReleaseRecord) -> Option<InstallationState> {
    use InstallationState::*;

    let upgraded = release.revision > 1;
    let state = match release.status {
        ReleaseStatus::Deployed if upgraded => Upgraded,
        ReleaseStatus::Deployed => Installed,
        ReleaseStatus::Failed if upgraded => UpgradeFailed,
        ReleaseStatus::Failed => InstallFailed,
        ReleaseStatus::PendingInstall => Installing,
        ReleaseStatus::PendingUpgrade | ReleaseStatus::PendingRollback => Upgrading,
        ReleaseStatus::Uninstalling => Uninstalling,
        ReleaseStatus::Uninstalled => Uninstalled,
        ReleaseStatus::Superseded | ReleaseStatus::Unknown => return None,
    };
    Some(state)
}

fn release_message(release: &ReleaseRecord) -> String {
    match release.status {
        ReleaseStatus::Failed => format!(
            "release {} revision {} failed",
            release.name, release.revision
        ),
        _ => String::new(),
    }
}

/// Merge the job outcome and the release record into a branch state
///
/// The release record wins once it was written at or after the job started,
/// or when it is terminal-uninstalled. Before that, the job decides. Without
/// either, a branch waiting on a vanished job is resolved: uninstall counts as
/// done, install and upgrade as failed.
///
/// # Returns
/// The observed state and its message, or `None` when nothing was learned
pub fn synchronize(
    branch: &InstallationStatus,
    observation: &Observation,
) -> Option<(InstallationState, String)> {
    let release = observation.release.as_ref();

    let from_job = observation.job.as_ref().and_then(|job| {
        let action = job_action(job)?;
        let outcome = job_outcome(job);
        let state = state_for_job(action, &outcome, release.is_some());
        let message = match (&outcome, state) {
            (JobOutcome::Failed { message }, _) => message.clone(),
            (_, InstallationState::UninstallFailed) => {
                "release still present after uninstall job completed".to_string()
            }
            _ => String::new(),
        };
        let started = job.metadata.creation_timestamp.as_ref().map(|t| t.0);
        Some((state, message, started))
    });

    let from_release = release.and_then(|r| state_for_release(r).map(|s| (s, release_message(r))));

    match (from_job, release, from_release) {
        (Some((state, message, started)), Some(record), Some(released)) => {
            let reflects_job = match (record.created, started) {
                (Some(created), Some(started)) => created >= started,
                _ => false,
            };
            if reflects_job || record.status == ReleaseStatus::Uninstalled {
                Some(released)
            } else {
                Some((state, message))
            }
        }
        (Some((state, message, _)), _, _) => Some((state, message)),
        (None, _, Some(released)) => Some(released),
        (None, None, _) if !branch.job_name.is_empty() => match branch.state {
            InstallationState::Uninstalling => Some((InstallationState::Uninstalled, String::new())),
            InstallationState::Installing => Some((
                InstallationState::InstallFailed,
                format!("execution job {} not found", branch.job_name),
            )),
            InstallationState::Upgrading => Some((
                InstallationState::UpgradeFailed,
                format!("execution job {} not found", branch.job_name),
            )),
            _ => None,
        },
        _ => None,
    }
}

/// Extension aggregate for `plan`
///
/// Empty once the host branch is uninstalled.
pub fn extension_status(plan: &InstallPlan, status: &InstallPlanStatus) -> ExtensionStatus {
    let Some(host) = status.installation_status.as_ref() else {
        return ExtensionStatus::default();
    };
    if host.state == InstallationState::Uninstalled {
        return ExtensionStatus::default();
    }

    ExtensionStatus {
        state: host.state,
        enabled: plan.spec.enabled,
        conditions: host.conditions.clone(),
        planned_install_version: plan.spec.extension.version.clone(),
        installed_version: if host.state == InstallationState::Deployed {
            host.version.clone()
        } else {
            String::new()
        },
        cluster_scheduling_statuses: status
            .cluster_scheduling_statuses
            .iter()
            .map(|(cluster, branch)| {
                (
                    cluster.clone(),
                    ClusterExtensionStatus {
                        state: branch.state,
                        conditions: branch.conditions.clone(),
                    },
                )
            })
            .collect(),
    }
}
