use crate::config::ControllerConfig;
use crate::controller::backend::{
    BackendError, ClusterConnector, PlanStore, Target, TargetBackend,
};
use crate::controller::clock::{Clock, SystemClock};
use crate::controller::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use crate::controller::kube_backend::{KubeConnector, KubePlanStore};
use crate::controller::package::{KubePackageLoader, PackageError, PackageLoader};
use crate::crd::cluster::Cluster;
use crate::crd::installplan::{InstallPlan, InstallPlanStatus, InstallationState, InstallationStatus};
use crate::server::{LeaderState, SharedMetrics};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::branch::{
    advance, force_remove, load_package, uninstall, BranchOutcome, DesiredValues, PackageCell,
    PlanInputs,
};
use super::sync::extension_status;
use super::targets::{resolve_targets, TargetSet};
use super::transition::{compute_config_hash, merge_values, normalize_values};

/// Requeue while an execution job is running
const IN_PROGRESS_REQUEUE: Duration = Duration::from_secs(30);
/// Requeue for replicas that are not the leader
const NOT_LEADER_REQUEUE: Duration = Duration::from_secs(5);
/// Requeue after a failed reconcile
pub const ERROR_REQUEUE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("InstallPlan missing name")]
    MissingName,

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}

pub struct Context {
    pub store: Arc<dyn PlanStore>,
    pub connector: Arc<dyn ClusterConnector>,
    pub packages: Arc<dyn PackageLoader>,
    pub events: Arc<dyn EventPublisher>,
    pub clock: Arc<dyn Clock>,
    pub config: ControllerConfig,
    /// When Some, reconciliation is skipped unless this replica is the leader
    pub leader_state: Option<LeaderState>,
    pub metrics: Option<SharedMetrics>,
}

impl Context {
    /// Context backed by the Kubernetes API (single instance mode)
    pub fn new(
        client: kube::Client,
        config: ControllerConfig,
        metrics: Option<SharedMetrics>,
    ) -> Result<Self, PackageError> {
        Ok(Context {
            store: Arc::new(KubePlanStore::new(client.clone(), config.status_retries)),
            connector: Arc::new(KubeConnector::new(client.clone(), config.executor.clone())),
            packages: Arc::new(KubePackageLoader::new(client.clone())?),
            events: Arc::new(KubeEventPublisher::new(client)),
            clock: Arc::new(SystemClock),
            config,
            leader_state: None,
            metrics,
        })
    }

    /// Context that only reconciles while `leader_state` says so
    pub fn new_with_leader(
        client: kube::Client,
        config: ControllerConfig,
        leader_state: LeaderState,
        metrics: Option<SharedMetrics>,
    ) -> Result<Self, PackageError> {
        Ok(Context {
            leader_state: Some(leader_state),
            ..Self::new(client, config, metrics)?
        })
    }

    pub fn should_reconcile(&self) -> bool {
        match &self.leader_state {
            None => true,
            Some(state) => state.is_leader(),
        }
    }

    #[cfg(test)]
    pub fn new_mock(
        store: Arc<dyn PlanStore>,
        connector: Arc<dyn ClusterConnector>,
        packages: Arc<dyn PackageLoader>,
        events: Arc<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
        config: ControllerConfig,
    ) -> Self {
        Context {
            store,
            connector,
            packages,
            events,
            clock,
            config,
            leader_state: None,
            metrics: None,
        }
    }
}

/// Status bookkeeping for one reconcile of one plan
///
/// `observed` is the status as last read or written, `status` the working
/// copy. Checkpoints send only the difference, so concurrent writers to other
/// branches are not overwritten.
pub struct PlanScope<'a> {
    ctx: &'a Context,
    name: &'a str,
    observed: InstallPlanStatus,
    pub status: InstallPlanStatus,
}

impl<'a> PlanScope<'a> {
    pub fn new(ctx: &'a Context, plan: &InstallPlan, name: &'a str) -> Self {
        let observed = plan.status.clone().unwrap_or_default();
        Self {
            ctx,
            name,
            status: observed.clone(),
            observed,
        }
    }

    /// Status this reconcile started from or last persisted
    pub fn observed(&self) -> &InstallPlanStatus {
        &self.observed
    }

    /// Persist pending changes
    ///
    /// # Returns
    /// true if anything was written
    pub async fn checkpoint(&mut self) -> Result<bool, ReconcileError> {
        if self.status == self.observed {
            return Ok(false);
        }
        let stored = self
            .ctx
            .store
            .update_status(self.name, &self.observed, &self.status)
            .await?;
        self.observed = stored.clone();
        self.status = stored;
        Ok(true)
    }
}

/// Default install namespace of an extension
pub fn default_namespace(extension: &str) -> String {
    format!("extension-{}", extension)
}

/// Values and hash for one member cluster
fn member_values(plan: &InstallPlan, cluster: &str) -> DesiredValues {
    let overlay = plan
        .spec
        .cluster_scheduling
        .as_ref()
        .and_then(|s| s.overrides.get(cluster))
        .map(String::as_str)
        .unwrap_or_default();

    if let Some(invalid) = invalid_config(plan) {
        return invalid;
    }
    match merge_values(&plan.spec.config, overlay) {
        Ok(values) => DesiredValues {
            hash: compute_config_hash(&values),
            values,
            invalid: None,
        },
        Err(e) => DesiredValues {
            hash: compute_config_hash(&format!("{}\n---\n{}", plan.spec.config, overlay)),
            values: String::new(),
            invalid: Some(format!("override for cluster {}: {}", cluster, e)),
        },
    }
}

fn host_values(plan: &InstallPlan) -> DesiredValues {
    invalid_config(plan).unwrap_or_else(|| DesiredValues {
        values: plan.spec.config.clone(),
        hash: compute_config_hash(&plan.spec.config),
        invalid: None,
    })
}

/// Rejected values when `spec.config` is not a YAML document
fn invalid_config(plan: &InstallPlan) -> Option<DesiredValues> {
    normalize_values(&plan.spec.config)
        .err()
        .map(|e| DesiredValues {
            hash: compute_config_hash(&plan.spec.config),
            values: String::new(),
            invalid: Some(format!("config: {}", e)),
        })
}

/// Registered member clusters; the host registration is never a member
async fn member_clusters(ctx: &Context) -> Result<Vec<Cluster>, ReconcileError> {
    Ok(ctx
        .connector
        .list_clusters()
        .await?
        .into_iter()
        .filter(|c| !c.is_host())
        .collect())
}

/// Cluster is unregistered or being deregistered
fn is_gone(clusters: &[Cluster], name: &str) -> bool {
    !clusters
        .iter()
        .any(|c| c.name_any() == name && !c.is_deleting())
}

fn in_state(branch: Option<&InstallationStatus>, state: InstallationState) -> bool {
    branch.is_some_and(|b| b.state == state)
}

/// Reconcile an InstallPlan
///
/// Adds the finalizer, drives the host branch and every member branch one
/// step, persists what changed and projects the result onto the Extension.
/// Deleted plans are uninstalled everywhere before the finalizer is released.
///
/// # Returns
/// * `Ok(Action)` - Requeue sooner while a job is running
/// * `Err(ReconcileError)` - Transient failure, retried by `error_policy`
pub async fn reconcile(plan: Arc<InstallPlan>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    if !ctx.should_reconcile() {
        debug!(plan = %plan.name_any(), "Skipping reconciliation - not leader");
        if let Some(metrics) = &ctx.metrics {
            metrics.record_reconciliation_skipped();
        }
        return Ok(Action::requeue(NOT_LEADER_REQUEUE));
    }

    let start_time = Instant::now();
    let name = plan.meta().name.clone().ok_or(ReconcileError::MissingName)?;

    let result = if plan.meta().deletion_timestamp.is_some() {
        reconcile_deletion(&plan, &name, &ctx).await
    } else {
        reconcile_apply(&plan, &name, &ctx).await
    };

    if let Some(metrics) = &ctx.metrics {
        let duration_secs = start_time.elapsed().as_secs_f64();
        match &result {
            Ok(_) => metrics.record_reconciliation_success(duration_secs),
            Err(_) => metrics.record_reconciliation_error(duration_secs),
        }
    }
    result
}

/// Requeue failed reconciles after a fixed delay
pub fn error_policy(plan: Arc<InstallPlan>, error: &ReconcileError, _ctx: Arc<Context>) -> Action {
    warn!(plan = %plan.name_any(), error = %error, "Reconcile error (will retry)");
    Action::requeue(ERROR_REQUEUE)
}

/// What happens to one member branch this reconcile
enum MemberWork {
    Advance(InstallationStatus),
    Uninstall(InstallationStatus),
    Hold,
    Drop,
}

fn plan_members(
    status: &InstallPlanStatus,
    targets: &TargetSet,
    clusters: &[Cluster],
) -> BTreeMap<String, MemberWork> {
    let names: BTreeSet<&String> = targets
        .schedulable
        .iter()
        .chain(status.cluster_scheduling_statuses.keys())
        .collect();

    names
        .into_iter()
        .map(|name| {
            let existing = status.cluster_scheduling_statuses.get(name).cloned();
            let work = if targets.schedulable.contains(name) {
                MemberWork::Advance(existing.unwrap_or_default())
            } else if targets.held.contains(name) {
                MemberWork::Hold
            } else if is_gone(clusters, name) {
                MemberWork::Drop
            } else {
                MemberWork::Uninstall(existing.unwrap_or_default())
            };
            (name.clone(), work)
        })
        .collect()
}

async fn reconcile_apply(
    plan: &InstallPlan,
    name: &str,
    ctx: &Context,
) -> Result<Action, ReconcileError> {
    if !plan.has_finalizer() {
        ctx.store.add_finalizer(name).await?;
        info!(plan = %name, "Added finalizer");
    }

    info!(
        plan = %name,
        extension = %plan.spec.extension.name,
        version = %plan.spec.extension.version,
        "Reconciling InstallPlan"
    );

    let mut scope = PlanScope::new(ctx, plan, name);
    let object_ref = plan.object_ref(&());
    let package = PackageCell::new();

    if scope.status.release_name.is_empty() {
        scope.status.release_name = name.to_string();
    }
    let release = scope.status.release_name.clone();

    if scope.status.target_namespace.is_empty() {
        let probe = PlanInputs {
            plan: name,
            extension: &plan.spec.extension.name,
            version: &plan.spec.extension.version,
            release: &release,
            namespace: "",
            object_ref: &object_ref,
            package: &package,
        };
        if let Ok(loaded) = load_package(ctx, &probe).await {
            scope.status.target_namespace = loaded
                .namespace
                .clone()
                .filter(|ns| !ns.is_empty())
                .unwrap_or_else(|| default_namespace(&plan.spec.extension.name));
        }
    }
    let namespace = scope.status.target_namespace.clone();

    let inputs = PlanInputs {
        plan: name,
        extension: &plan.spec.extension.name,
        version: &plan.spec.extension.version,
        release: &release,
        namespace: &namespace,
        object_ref: &object_ref,
        package: &package,
    };

    let scheduling = plan.spec.cluster_scheduling.as_ref();
    let clusters = if scheduling.is_some() || !scope.status.cluster_scheduling_statuses.is_empty() {
        member_clusters(ctx).await?
    } else {
        Vec::new()
    };
    let targets = scheduling
        .map(|s| resolve_targets(&s.placement, &clusters))
        .unwrap_or_default();

    let host_desired = host_values(plan);
    let member_desired: BTreeMap<String, DesiredValues> = targets
        .schedulable
        .iter()
        .map(|cluster| (cluster.clone(), member_values(plan, cluster)))
        .collect();

    let host_status = scope.status.installation_status.clone().unwrap_or_default();
    let mut work: Vec<BoxFuture<'_, BranchOutcome>> = vec![advance(
        ctx,
        &inputs,
        Target::Host,
        host_status,
        &host_desired,
    )
    .boxed()];

    let mut removing = BTreeSet::new();
    for (cluster, member) in plan_members(&scope.status, &targets, &clusters) {
        let target = Target::Member(cluster.clone());
        match member {
            MemberWork::Advance(status) => {
                let Some(desired) = member_desired.get(&cluster) else {
                    continue;
                };
                work.push(advance(ctx, &inputs, target, status, desired).boxed());
            }
            MemberWork::Uninstall(status) => {
                info!(plan = %name, cluster = %cluster, "Cluster no longer selected, uninstalling");
                removing.insert(cluster);
                work.push(uninstall(ctx, &inputs, target, status).boxed());
            }
            MemberWork::Hold => {
                debug!(plan = %name, cluster = %cluster, "Cluster not schedulable, holding branch");
            }
            MemberWork::Drop => {
                info!(plan = %name, cluster = %cluster, "Cluster gone, dropping branch");
                scope.status.cluster_scheduling_statuses.remove(&cluster);
            }
        }
    }

    let outcomes = join_all(work).await;
    let (collect, errors) = merge_outcomes(&mut scope.status, outcomes, &removing);

    let host_deployed = in_state(
        scope.status.installation_status.as_ref(),
        InstallationState::Deployed,
    );
    let became_deployed = host_deployed
        && !in_state(
            scope.observed().installation_status.as_ref(),
            InstallationState::Deployed,
        );
    if host_deployed && (scope.status.enabled != Some(plan.spec.enabled) || became_deployed) {
        match ctx
            .store
            .sync_extended_apis(&plan.spec.extension.name, plan.spec.enabled)
            .await
        {
            Ok(()) => scope.status.enabled = Some(plan.spec.enabled),
            Err(e) => {
                warn!(plan = %name, error = %e, "Failed to sync extended APIs");
            }
        }
    }

    finish(ctx, plan, &mut scope, collect).await?;

    if let Some(e) = errors.into_iter().next() {
        return Err(e.into());
    }

    Ok(requeue_for(ctx, &scope.status))
}

/// Branch whose finished jobs should be collected after the next write
struct Collectable {
    backend: Arc<dyn TargetBackend>,
    namespace: String,
    keep_job: String,
}

/// Fold branch outcomes into the working status
///
/// Members in `removing` are deleted once uninstalled.
fn merge_outcomes(
    status: &mut InstallPlanStatus,
    outcomes: Vec<BranchOutcome>,
    removing: &BTreeSet<String>,
) -> (Vec<Collectable>, Vec<BackendError>) {
    let mut collect = Vec::new();
    let mut errors = Vec::new();

    for outcome in outcomes {
        let before = match &outcome.target {
            Target::Host => status.installation_status.as_ref(),
            Target::Member(cluster) => status.cluster_scheduling_statuses.get(cluster),
        };
        let changed = before != Some(&outcome.status);

        if let (true, Some(backend)) = (changed, outcome.backend) {
            if !outcome.status.target_namespace.is_empty() {
                collect.push(Collectable {
                    backend,
                    namespace: outcome.status.target_namespace.clone(),
                    keep_job: outcome.status.job_name.clone(),
                });
            }
        }
        if let Some(e) = outcome.error {
            warn!(target = %outcome.target, error = %e, "Branch reconcile failed");
            errors.push(e);
        }

        match outcome.target {
            Target::Host => status.installation_status = Some(outcome.status),
            Target::Member(cluster) => {
                if removing.contains(&cluster)
                    && outcome.status.state == InstallationState::Uninstalled
                {
                    info!(cluster = %cluster, "Member branch uninstalled, removing");
                    status.cluster_scheduling_statuses.remove(&cluster);
                } else {
                    status
                        .cluster_scheduling_statuses
                        .insert(cluster, outcome.status);
                }
            }
        }
    }
    (collect, errors)
}

/// Persist, collect garbage and publish the Extension projection
///
/// Garbage is collected only after a status write. The projection is sent
/// every time; the store skips it when the Extension is already current.
async fn finish(
    ctx: &Context,
    plan: &InstallPlan,
    scope: &mut PlanScope<'_>,
    collect: Vec<Collectable>,
) -> Result<(), ReconcileError> {
    let written = scope.checkpoint().await?;

    let extension = &plan.spec.extension.name;
    if written {
        for item in collect {
            match item
                .backend
                .collect_garbage(&item.namespace, extension, &item.keep_job)
                .await
            {
                Ok(0) => {}
                Ok(deleted) => debug!(extension = %extension, deleted, "Collected finished execution jobs"),
                Err(e) => warn!(extension = %extension, error = %e, "Garbage collection failed"),
            }
        }
    }

    let projection = extension_status(plan, &scope.status);
    if let Err(e) = ctx.store.publish_extension_status(extension, &projection).await {
        warn!(extension = %extension, error = %e, "Failed to publish Extension status");
    }
    Ok(())
}

fn requeue_for(ctx: &Context, status: &InstallPlanStatus) -> Action {
    let in_progress = status
        .installation_status
        .iter()
        .chain(status.cluster_scheduling_statuses.values())
        .any(|b| b.state.is_in_progress());
    if in_progress {
        Action::requeue(IN_PROGRESS_REQUEUE)
    } else {
        Action::requeue(ctx.config.resync_interval)
    }
}

async fn reconcile_deletion(
    plan: &InstallPlan,
    name: &str,
    ctx: &Context,
) -> Result<Action, ReconcileError> {
    if !plan.has_finalizer() {
        return Ok(Action::await_change());
    }

    let mut scope = PlanScope::new(ctx, plan, name);
    let object_ref = plan.object_ref(&());
    let package = PackageCell::new();
    let release = scope.status.release_name.clone();
    let namespace = scope.status.target_namespace.clone();
    let inputs = PlanInputs {
        plan: name,
        extension: &plan.spec.extension.name,
        version: &plan.spec.extension.version,
        release: &release,
        namespace: &namespace,
        object_ref: &object_ref,
        package: &package,
    };

    if plan.is_force_delete() {
        warn!(plan = %name, "Force delete requested, skipping uninstall");
        let mut removals: Vec<BoxFuture<'_, ()>> = Vec::new();
        if let Some(host) = &scope.status.installation_status {
            removals.push(force_remove(ctx, &inputs, Target::Host, host).boxed());
        }
        for (cluster, branch) in &scope.status.cluster_scheduling_statuses {
            removals.push(force_remove(ctx, &inputs, Target::Member(cluster.clone()), branch).boxed());
        }
        join_all(removals).await;

        ctx.store.remove_finalizer(name).await?;
        ctx.events
            .publish(
                &object_ref,
                EventType::Warning,
                reasons::FORCE_DELETED,
                actions::UNINSTALL,
                Some("finalizer removed without uninstalling".to_string()),
            )
            .await;
        return Ok(Action::await_change());
    }

    if release.is_empty() {
        info!(plan = %name, "Nothing was installed, releasing finalizer");
        ctx.store.remove_finalizer(name).await?;
        return Ok(Action::await_change());
    }

    info!(plan = %name, "Uninstalling InstallPlan");

    let clusters = if scope.status.cluster_scheduling_statuses.is_empty() {
        Vec::new()
    } else {
        member_clusters(ctx).await?
    };

    let mut work: Vec<BoxFuture<'_, BranchOutcome>> = Vec::new();
    if let Some(host) = scope.status.installation_status.clone() {
        work.push(uninstall(ctx, &inputs, Target::Host, host).boxed());
    }
    let mut removing = BTreeSet::new();
    let members: Vec<(String, InstallationStatus)> = scope
        .status
        .cluster_scheduling_statuses
        .iter()
        .map(|(c, s)| (c.clone(), s.clone()))
        .collect();
    for (cluster, branch) in members {
        if is_gone(&clusters, &cluster) {
            info!(plan = %name, cluster = %cluster, "Cluster gone, dropping branch");
            scope.status.cluster_scheduling_statuses.remove(&cluster);
            continue;
        }
        removing.insert(cluster.clone());
        work.push(uninstall(ctx, &inputs, Target::Member(cluster), branch).boxed());
    }

    let outcomes = join_all(work).await;
    let (collect, errors) = merge_outcomes(&mut scope.status, outcomes, &removing);

    finish(ctx, plan, &mut scope, collect).await?;

    if let Some(e) = errors.into_iter().next() {
        return Err(e.into());
    }

    let host_done = scope.status.installation_status.is_none()
        || in_state(
            scope.status.installation_status.as_ref(),
            InstallationState::Uninstalled,
        );
    if host_done && scope.status.cluster_scheduling_statuses.is_empty() {
        ctx.store.remove_finalizer(name).await?;
        info!(plan = %name, "Uninstall complete, finalizer removed");
        return Ok(Action::await_change());
    }

    Ok(requeue_for(ctx, &scope.status))
}
