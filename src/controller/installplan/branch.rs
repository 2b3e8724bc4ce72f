//! One rollout branch: the host or a single member cluster
//!
//! A branch is advanced against its own target and never looks at other
//! branches. Every function here takes the branch status by value and returns
//! the updated copy, so the plan-level reconciler can run branches
//! concurrently and merge the results.

use crate::controller::backend::{BackendError, ReleaseStatus, Target, TargetBackend};
use crate::controller::events::{actions, reasons};
use crate::controller::package::Package;
use crate::crd::installplan::{InstallationState, InstallationStatus};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::EventType;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::dispatch::{ExecutionAction, ExecutionRequest};
use super::prerequisites::{service_account_name, PrerequisiteRequest};
use super::reconcile::Context;
use super::sync::{synchronize, Observation};
use super::transition::{
    condition_for, failure_state_for, is_execution_deadline_exceeded, prepared_condition,
    set_condition, update_state, REASON_EXECUTION_DEADLINE_EXCEEDED,
};

/// Package shared by every branch of one reconcile, loaded on first use
pub type PackageCell = OnceCell<Result<Package, String>>;

/// Plan-wide inputs of a branch
pub struct PlanInputs<'a> {
    pub plan: &'a str,
    pub extension: &'a str,
    pub version: &'a str,
    pub release: &'a str,
    pub namespace: &'a str,
    pub object_ref: &'a ObjectReference,
    pub package: &'a PackageCell,
}

/// Values for one target
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DesiredValues {
    pub values: String,
    pub hash: String,
    /// Why the values could not be built; the attempt fails without dispatch
    pub invalid: Option<String>,
}

/// Result of driving one branch
pub struct BranchOutcome {
    pub target: Target,
    pub status: InstallationStatus,
    /// Set when the target was reachable; used for garbage collection
    pub backend: Option<Arc<dyn TargetBackend>>,
    /// Transient failure that should requeue the plan
    pub error: Option<BackendError>,
}

impl BranchOutcome {
    fn new(target: Target, status: InstallationStatus) -> Self {
        Self {
            target,
            status,
            backend: None,
            error: None,
        }
    }
}

/// Branch bound to a reachable target for the rest of one reconcile
struct Driver<'a> {
    ctx: &'a Context,
    inputs: &'a PlanInputs<'a>,
    target: &'a Target,
    backend: Arc<dyn TargetBackend>,
}

impl Driver<'_> {
    fn namespace<'s>(&'s self, status: &'s InstallationStatus) -> &'s str {
        if status.target_namespace.is_empty() {
            self.inputs.namespace
        } else {
            &status.target_namespace
        }
    }

    fn release<'s>(&'s self, status: &'s InstallationStatus) -> &'s str {
        if status.release_name.is_empty() {
            self.inputs.release
        } else {
            &status.release_name
        }
    }

    async fn transition(
        &self,
        status: &mut InstallationStatus,
        state: InstallationState,
        message: &str,
    ) -> bool {
        commit(self.ctx, self.inputs, self.target, status, state, message).await
    }

    /// Fold the job and release record into the branch
    async fn observe(&self, status: &mut InstallationStatus) -> Result<(), BackendError> {
        let namespace = self.namespace(status).to_string();
        let job = if status.job_name.is_empty() {
            None
        } else {
            self.backend.get_job(&namespace, &status.job_name).await?
        };
        let release = self
            .backend
            .get_release(&namespace, self.release(status))
            .await?;

        let observation = Observation { job, release };
        if let Some((state, message)) = synchronize(status, &observation) {
            self.transition(status, state, &message).await;
        }
        Ok(())
    }

    /// Fail a branch whose execution outlived the watchdog deadline
    async fn enforce_deadline(&self, status: &mut InstallationStatus) {
        let Some(deadline) = self.ctx.config.execution_deadline else {
            return;
        };
        if !is_execution_deadline_exceeded(status, deadline, self.ctx.clock.now()) {
            return;
        }

        let failed = failure_state_for(status.state);
        let message = format!(
            "execution {} did not finish within {}s",
            status.job_name,
            deadline.as_secs()
        );
        warn!(
            plan = %self.inputs.plan,
            target = %self.target,
            job = %status.job_name,
            "Execution deadline exceeded"
        );
        if self.transition(status, failed, &message).await {
            let now = self.ctx.clock.now();
            if let Some(mut condition) = condition_for(failed, &message, now) {
                condition.reason = REASON_EXECUTION_DEADLINE_EXCEEDED.to_string();
                set_condition(&mut status.conditions, condition);
            }
            self.ctx
                .events
                .publish(
                    self.inputs.object_ref,
                    EventType::Warning,
                    reasons::EXECUTION_DEADLINE_EXCEEDED,
                    actions::SYNC,
                    Some(format!("{}: {}", self.target, message)),
                )
                .await;
        }
    }

    /// Provision and launch an install or upgrade
    async fn start(&self, status: &mut InstallationStatus, desired: &DesiredValues) -> Result<(), BackendError> {
        let namespace = self.namespace(status).to_string();
        let release = self.release(status).to_string();
        let existing = self.backend.get_release(&namespace, &release).await?;
        let upgrade = existing.is_some_and(|r| r.status != ReleaseStatus::Uninstalled)
            || matches!(
                status.state,
                InstallationState::Deployed | InstallationState::UpgradeFailed
            );
        let action = ExecutionAction::for_upgrade(upgrade);
        let failed = if upgrade {
            InstallationState::UpgradeFailed
        } else {
            InstallationState::InstallFailed
        };

        // The attempt is bound to these inputs whether it succeeds or not
        status.config_hash = desired.hash.clone();
        status.version = self.inputs.version.to_string();
        status.release_name = release.clone();
        status.target_namespace = namespace.clone();
        status.job_name.clear();

        if status.state != InstallationState::Deployed {
            self.transition(status, InstallationState::Preparing, "").await;
        }

        let package = match self.load_package().await {
            Ok(package) => package,
            Err(message) => {
                self.transition(status, failed, &message).await;
                return Ok(());
            }
        };

        let prerequisites = PrerequisiteRequest {
            extension: self.inputs.extension.to_string(),
            release: release.clone(),
            namespace: namespace.clone(),
            permissions: package.permissions.clone(),
        };
        if let Err(e) = self.backend.ensure_prerequisites(&prerequisites).await {
            let message = format!("prerequisites: {}", e);
            self.transition(status, failed, &message).await;
            return Ok(());
        }
        set_condition(&mut status.conditions, prepared_condition(self.ctx.clock.now()));

        let request = ExecutionRequest {
            plan: self.inputs.plan.to_string(),
            extension: self.inputs.extension.to_string(),
            version: self.inputs.version.to_string(),
            release: release.clone(),
            namespace,
            action,
            values: desired.values.clone(),
            values_hash: desired.hash.clone(),
            chart: package.chart.clone(),
            ca_bundle: package.ca_bundle.clone(),
            service_account: service_account_name(&release),
        };
        self.launch(status, &request, failed).await;
        Ok(())
    }

    /// Launch an uninstall of the release
    async fn start_uninstall(&self, status: &mut InstallationStatus) {
        let release = self.release(status).to_string();
        let request = ExecutionRequest {
            plan: self.inputs.plan.to_string(),
            extension: self.inputs.extension.to_string(),
            version: status.version.clone(),
            release: release.clone(),
            namespace: self.namespace(status).to_string(),
            action: ExecutionAction::Uninstall,
            values: String::new(),
            values_hash: String::new(),
            chart: Vec::new(),
            ca_bundle: None,
            service_account: service_account_name(&release),
        };
        self.launch(status, &request, InstallationState::UninstallFailed)
            .await;
    }

    async fn launch(
        &self,
        status: &mut InstallationStatus,
        request: &ExecutionRequest,
        failed: InstallationState,
    ) {
        match self.backend.dispatch(request).await {
            Ok(job_name) => {
                info!(
                    plan = %self.inputs.plan,
                    target = %self.target,
                    action = %request.action,
                    job = %job_name,
                    "Dispatched execution job"
                );
                if let Some(metrics) = &self.ctx.metrics {
                    metrics.record_dispatch(request.action.as_str());
                }
                status.job_name = job_name;
                let running = match request.action {
                    ExecutionAction::Install => InstallationState::Installing,
                    ExecutionAction::Upgrade => InstallationState::Upgrading,
                    ExecutionAction::Uninstall => InstallationState::Uninstalling,
                };
                self.transition(status, running, "").await;
            }
            Err(e) => {
                let message = format!("dispatch {}: {}", request.action, e);
                self.transition(status, failed, &message).await;
            }
        }
    }

    async fn load_package(&self) -> Result<&Package, String> {
        load_package(self.ctx, self.inputs).await
    }
}

/// Package of the plan's extension version, loaded at most once per reconcile
pub async fn load_package<'a>(ctx: &Context, inputs: &PlanInputs<'a>) -> Result<&'a Package, String> {
    inputs
        .package
        .get_or_init(|| async move {
            ctx.packages
                .load(inputs.extension, inputs.version)
                .await
                .map_err(|e| e.to_string())
        })
        .await
        .as_ref()
        .map_err(Clone::clone)
}

/// Commit a transition, then log, count and publish it
async fn commit(
    ctx: &Context,
    inputs: &PlanInputs<'_>,
    target: &Target,
    status: &mut InstallationStatus,
    state: InstallationState,
    message: &str,
) -> bool {
    let previous = status.state;
    if !update_state(status, state, message, ctx.clock.now()) {
        return false;
    }

    info!(
        plan = %inputs.plan,
        target = %target,
        from = %previous,
        to = %status.state,
        "State transition"
    );

    if let Some(metrics) = &ctx.metrics {
        let kind = if target.is_host() { "host" } else { "member" };
        metrics.record_transition(kind, status.state.as_str());
    }

    if let Some((type_, reason, action)) = event_for(state) {
        let note = if message.is_empty() {
            format!("{}: {}", target, state)
        } else {
            format!("{}: {}", target, message)
        };
        ctx.events
            .publish(inputs.object_ref, type_, reason, action, Some(note))
            .await;
    }
    true
}

/// Event published when a branch enters `state`
fn event_for(state: InstallationState) -> Option<(EventType, &'static str, &'static str)> {
    use InstallationState::*;

    let event = match state {
        Installing => (EventType::Normal, reasons::INSTALL_STARTED, actions::INSTALL),
        Upgrading => (EventType::Normal, reasons::UPGRADE_STARTED, actions::UPGRADE),
        Uninstalling => (EventType::Normal, reasons::UNINSTALL_STARTED, actions::UNINSTALL),
        Installed => (EventType::Normal, reasons::DEPLOYED, actions::INSTALL),
        Upgraded => (EventType::Normal, reasons::DEPLOYED, actions::UPGRADE),
        Uninstalled => (EventType::Normal, reasons::UNINSTALLED, actions::UNINSTALL),
        InstallFailed => (EventType::Warning, reasons::INSTALL_FAILED, actions::INSTALL),
        UpgradeFailed => (EventType::Warning, reasons::UPGRADE_FAILED, actions::UPGRADE),
        UninstallFailed => (EventType::Warning, reasons::UNINSTALL_FAILED, actions::UNINSTALL),
        Initial | Preparing | Deployed => return None,
    };
    Some(event)
}

/// Failure recorded when an attempt cannot start from `state`
fn attempt_failure(state: InstallationState) -> InstallationState {
    match state {
        InstallationState::Deployed | InstallationState::UpgradeFailed => {
            InstallationState::UpgradeFailed
        }
        _ => InstallationState::InstallFailed,
    }
}

/// Whether a settled branch must run again for `desired`
pub fn needs_attempt(status: &InstallationStatus, version: &str, desired: &DesiredValues) -> bool {
    use InstallationState::*;

    match status.state {
        Initial | Uninstalled | UninstallFailed => true,
        Preparing => status.job_name.is_empty(),
        Deployed | InstallFailed | UpgradeFailed => {
            status.config_hash != desired.hash || status.version != version
        }
        Installing | Upgrading | Uninstalling | Installed | Upgraded => false,
    }
}

/// Drive a branch towards the desired version and values
///
/// Waits on a running job, otherwise starts an install or upgrade when the
/// branch is new or its inputs changed. A target that cannot be reached
/// fails the attempt it was needed for and leaves a waiting branch alone.
pub async fn advance(
    ctx: &Context,
    inputs: &PlanInputs<'_>,
    target: Target,
    mut status: InstallationStatus,
    desired: &DesiredValues,
) -> BranchOutcome {
    if let Some(reason) = &desired.invalid {
        let mut outcome = BranchOutcome::new(target, status);
        if needs_attempt(&outcome.status, inputs.version, desired) {
            let failed = attempt_failure(outcome.status.state);
            outcome.status.config_hash = desired.hash.clone();
            outcome.status.version = inputs.version.to_string();
            commit(ctx, inputs, &outcome.target, &mut outcome.status, failed, reason).await;
        }
        return outcome;
    }

    let backend = match ctx.connector.connect(&target).await {
        Ok(backend) => backend,
        Err(e) => {
            let mut outcome = BranchOutcome::new(target, status);
            if needs_attempt(&outcome.status, inputs.version, desired) {
                let failed = attempt_failure(outcome.status.state);
                outcome.status.config_hash = desired.hash.clone();
                outcome.status.version = inputs.version.to_string();
                let message = format!("connect: {}", e);
                commit(ctx, inputs, &outcome.target, &mut outcome.status, failed, &message).await;
            } else {
                warn!(plan = %inputs.plan, target = %outcome.target, error = %e, "Target unreachable");
            }
            return outcome;
        }
    };

    let driver = Driver {
        ctx,
        inputs,
        target: &target,
        backend: backend.clone(),
    };

    let result = async {
        if status.state.is_in_progress() && !status.job_name.is_empty() {
            driver.observe(&mut status).await?;
            driver.enforce_deadline(&mut status).await;
        }

        if needs_attempt(&status, inputs.version, desired) {
            driver.start(&mut status, desired).await?;
        } else {
            debug!(
                plan = %inputs.plan,
                target = %target,
                state = %status.state,
                "Branch up to date"
            );
        }
        Ok::<_, BackendError>(())
    }
    .await;

    BranchOutcome {
        target: target.clone(),
        status,
        backend: Some(backend),
        error: result.err(),
    }
}

/// Drive a branch towards `Uninstalled`
///
/// A running install or upgrade is awaited first. A branch without a release
/// record is uninstalled immediately. `UninstallFailed` is left for an
/// operator to resolve.
pub async fn uninstall(
    ctx: &Context,
    inputs: &PlanInputs<'_>,
    target: Target,
    mut status: InstallationStatus,
) -> BranchOutcome {
    use InstallationState::*;

    if matches!(status.state, Uninstalled | UninstallFailed) {
        return BranchOutcome::new(target, status);
    }

    let backend = match ctx.connector.connect(&target).await {
        Ok(backend) => backend,
        Err(e) => {
            let mut outcome = BranchOutcome::new(target, status);
            if !outcome.status.state.is_in_progress() {
                let message = format!("connect: {}", e);
                commit(ctx, inputs, &outcome.target, &mut outcome.status, UninstallFailed, &message)
                    .await;
            } else {
                warn!(plan = %inputs.plan, target = %outcome.target, error = %e, "Target unreachable");
            }
            return outcome;
        }
    };

    let driver = Driver {
        ctx,
        inputs,
        target: &target,
        backend: backend.clone(),
    };

    let result = async {
        if status.state.is_in_progress() && !status.job_name.is_empty() {
            driver.observe(&mut status).await?;
            driver.enforce_deadline(&mut status).await;
        }

        match status.state {
            Preparing if !status.job_name.is_empty() => {}
            Installing | Upgrading | Uninstalling => {
                debug!(plan = %inputs.plan, target = %target, state = %status.state, "Waiting for execution");
            }
            Uninstalled | UninstallFailed => {}
            _ if driver.namespace(&status).is_empty() => {
                driver
                    .transition(&mut status, Uninstalled, "nothing was installed")
                    .await;
            }
            _ => {
                let namespace = driver.namespace(&status).to_string();
                let release = driver.release(&status).to_string();
                match backend.get_release(&namespace, &release).await? {
                    None => {
                        driver
                            .transition(&mut status, Uninstalled, "no release installed")
                            .await;
                    }
                    Some(record) if record.status == ReleaseStatus::Uninstalled => {
                        driver
                            .transition(&mut status, Uninstalled, "release already uninstalled")
                            .await;
                    }
                    Some(_) => driver.start_uninstall(&mut status).await,
                }
            }
        }
        Ok::<_, BackendError>(())
    }
    .await;

    BranchOutcome {
        target: target.clone(),
        status,
        backend: Some(backend),
        error: result.err(),
    }
}

/// Drop the release records of a branch without running uninstall
///
/// Used when deletion is forced; failures are logged and ignored.
pub async fn force_remove(ctx: &Context, inputs: &PlanInputs<'_>, target: Target, status: &InstallationStatus) {
    let namespace = if status.target_namespace.is_empty() {
        inputs.namespace
    } else {
        &status.target_namespace
    };
    let release = if status.release_name.is_empty() {
        inputs.release
    } else {
        &status.release_name
    };

    let result: Result<(), BackendError> = async {
        let backend = ctx.connector.connect(&target).await?;
        backend.delete_release(namespace, release).await
    }
    .await;

    if let Err(e) = result {
        warn!(plan = %inputs.plan, target = %target, error = %e, "Force delete could not remove release");
    }
}
