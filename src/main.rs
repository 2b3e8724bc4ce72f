use futures::future::{join_all, ready};
use futures::{Future, StreamExt};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::controller::{self, Action};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{watcher, Controller, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use kubext::config::ControllerConfig;
use kubext::controller::installplan::dispatch::INSTALLPLAN_LABEL;
use kubext::controller::{error_policy, reconcile, Context, ReconcileError};
use kubext::crd::cluster::Cluster;
use kubext::crd::installplan::InstallPlan;
use kubext::server::{
    create_metrics, run_health_server, run_leader_election, shutdown_channel, wait_for_signal,
    LeaderConfig, LeaderState, ReadinessState, SharedMetrics, ShutdownSignal,
};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// `/healthz`, `/readyz` and `/metrics`
const PROBE_PORT: u16 = 8080;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Helm storage Secrets carry this label
const HELM_OWNER_SELECTOR: &str = "owner=helm";

type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Plan a helm release Secret belongs to; the release name is the plan name
fn plan_for_release(secret: Secret) -> Option<ObjectRef<InstallPlan>> {
    secret.labels().get("name").map(|name| ObjectRef::new(name))
}

/// Plan that dispatched an execution Job
fn plan_for_job(job: Job) -> Option<ObjectRef<InstallPlan>> {
    job.labels()
        .get(INSTALLPLAN_LABEL)
        .map(|name| ObjectRef::new(name))
}

fn log_reconcile_result(
    result: Result<(ObjectRef<InstallPlan>, Action), controller::Error<ReconcileError, watcher::Error>>,
) -> futures::future::Ready<()> {
    match result {
        Ok((plan, _)) => info!(plan = %plan.name, "Reconciled"),
        // Reconcile errors are logged in error_policy
        Err(controller::Error::ReconcilerFailed(_, _)) => {}
        Err(e) => warn!(error = %e, "Controller error"),
    }
    ready(())
}

/// Makes a `Send` stream `Sync`, as `reconcile_all_on` requires; it is only
/// ever polled through `&mut`, so the mutex is never contended
struct SyncStream<S>(std::sync::Mutex<Pin<Box<S>>>);

impl<S: futures::Stream> futures::Stream for SyncStream<S> {
    type Item = S::Item;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        let inner = self.get_mut().0.get_mut().unwrap_or_else(|e| e.into_inner());
        inner.as_mut().poll_next(cx)
    }
}

/// InstallPlan controller
///
/// Re-enqueued by its own changes, by execution Jobs and helm release Secrets
/// of the host cluster, and for every plan on any Cluster change.
fn installplan_controller(client: Client, ctx: Arc<Context>) -> ControllerFuture {
    let concurrency = ctx.config.concurrency;
    let plans = Api::<InstallPlan>::all(client.clone());
    let jobs = Api::<Job>::all(client.clone());
    let secrets = Api::<Secret>::all(client.clone());
    let clusters = Api::<Cluster>::all(client);

    let cluster_changes = watcher(clusters, watcher::Config::default())
        .applied_objects()
        .filter_map(|cluster| ready(cluster.ok().map(|_| ())));

    Box::pin(
        Controller::new(plans, watcher::Config::default())
            .with_config(controller::Config::default().concurrency(concurrency))
            .watches(
                jobs,
                watcher::Config::default().labels(INSTALLPLAN_LABEL),
                plan_for_job,
            )
            .watches(
                secrets,
                watcher::Config::default().labels(HELM_OWNER_SELECTOR),
                plan_for_release,
            )
            .reconcile_all_on(SyncStream(std::sync::Mutex::new(Box::pin(cluster_changes))))
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result),
    )
}

/// Every controller this process runs
fn build_controllers(client: Client, ctx: Arc<Context>) -> Vec<ControllerFuture> {
    info!("- InstallPlan controller");
    vec![installplan_controller(client, ctx)]
}

/// Probe and metrics server; failures are logged, never fatal
fn spawn_probe_server(readiness: ReadinessState, metrics: SharedMetrics) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = run_health_server(PROBE_PORT, readiness, metrics).await {
            warn!(port = PROBE_PORT, error = %e, "Probe server stopped");
        }
    })
}

/// Start competing for the Lease, or take leadership outright when disabled
fn spawn_leader_election(
    client: Client,
    config: &ControllerConfig,
    state: LeaderState,
    shutdown: ShutdownSignal,
) -> Option<JoinHandle<()>> {
    if !config.leader_election {
        info!("Leader election off, this replica reconciles every plan");
        state.set_leader(true);
        return None;
    }

    let lease = LeaderConfig::from_env(&config.namespace);
    info!(
        holder = %lease.holder_id,
        lease = %format!("{}/{}", lease.lease_namespace, lease.lease_name),
        "Leader election on"
    );
    Some(tokio::spawn(run_leader_election(client, lease, state, shutdown)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("Crypto provider already installed");
    }

    let config = ControllerConfig::from_env()?;
    info!(
        executor_image = %config.executor.image,
        concurrency = config.concurrency,
        resync_seconds = config.resync_interval.as_secs(),
        watchdog_seconds = ?config.execution_deadline.map(|d| d.as_secs()),
        "Starting kubext extension controller"
    );

    let metrics = create_metrics()?;
    let readiness = ReadinessState::new();
    let leadership = LeaderState::new();
    let (stop, stopping) = shutdown_channel();

    let client = Client::try_default().await.map_err(|e| {
        error!(error = %e, "No Kubernetes client configuration found");
        e
    })?;

    let probes = spawn_probe_server(readiness.clone(), metrics.clone());
    let election = spawn_leader_election(client.clone(), &config, leadership.clone(), stopping);

    let ctx = if config.leader_election {
        Context::new_with_leader(client.clone(), config, leadership, Some(metrics))?
    } else {
        Context::new(client.clone(), config, Some(metrics))?
    };
    let controllers = build_controllers(client, Arc::new(ctx));

    // Standby replicas report ready too; they skip reconciliation until elected
    readiness.set_ready();

    tokio::select! {
        _ = join_all(controllers) => warn!("Controller streams ended"),
        signal = wait_for_signal() => {
            match signal {
                Ok(name) => info!(signal = name, "Draining"),
                Err(e) => error!(error = %e, "Signal handler failed, shutting down"),
            }
        }
    }

    readiness.set_not_ready();
    stop.shutdown();
    if let Some(election) = election {
        // Let the election loop release leadership
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, election).await;
    }
    probes.abort();

    info!("kubext controller stopped");
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
