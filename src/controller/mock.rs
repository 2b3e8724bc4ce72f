//! In-memory backends for reconciler tests
//!
//! `FakeTarget` stands in for one cluster: dispatch records the request and
//! stores a job that tests then complete or fail. `FakeStore` holds the plan
//! status the way the API server would, including injected write conflicts.
#![allow(clippy::expect_used, clippy::unwrap_used)]

use crate::config::ControllerConfig;
use crate::controller::backend::{
    BackendError, ClusterConnector, PlanStore, ReleaseRecord, ReleaseStatus, Target, TargetBackend,
};
use crate::controller::clock::{Clock, MockClock};
use crate::controller::installplan::dispatch::{build_job, ExecutionRequest};
use crate::controller::installplan::persist::{apply_delta, retry_on_conflict};
use crate::controller::installplan::prerequisites::PrerequisiteRequest;
use crate::crd::cluster::{Cluster, ClusterCondition, ClusterSpec, ClusterStatus};
use crate::crd::extension::ExtensionStatus;
use crate::crd::installplan::InstallPlanStatus;
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobCondition};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct TargetState {
    jobs: BTreeMap<String, Job>,
    releases: BTreeMap<String, ReleaseRecord>,
    dispatched: Vec<ExecutionRequest>,
    provisioned: Vec<PrerequisiteRequest>,
    deleted_releases: Vec<String>,
    prerequisite_error: Option<String>,
    collections: u32,
}

pub struct FakeTarget {
    clock: Arc<MockClock>,
    state: Mutex<TargetState>,
}

impl FakeTarget {
    pub fn new(clock: Arc<MockClock>) -> Self {
        Self {
            clock,
            state: Mutex::new(TargetState::default()),
        }
    }

    pub fn dispatched(&self) -> Vec<ExecutionRequest> {
        self.state.lock().unwrap().dispatched.clone()
    }

    pub fn provisioned(&self) -> Vec<PrerequisiteRequest> {
        self.state.lock().unwrap().provisioned.clone()
    }

    pub fn deleted_releases(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted_releases.clone()
    }

    /// Number of garbage collection passes run against this target
    pub fn collections(&self) -> u32 {
        self.state.lock().unwrap().collections
    }

    pub fn fail_prerequisites(&self, message: &str) {
        self.state.lock().unwrap().prerequisite_error = Some(message.to_string());
    }

    /// Mark the job succeeded, as the job controller would
    pub fn complete_job(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        let job = state.jobs.get_mut(name).expect("job exists");
        let status = job.status.get_or_insert_with(Default::default);
        status.succeeded = Some(1);
        status.active = Some(0);
    }

    /// Mark the job failed with `message` on its Failed condition
    pub fn fail_job(&self, name: &str, message: &str) {
        let mut state = self.state.lock().unwrap();
        let job = state.jobs.get_mut(name).expect("job exists");
        let status = job.status.get_or_insert_with(Default::default);
        status.failed = Some(1);
        status.conditions = Some(vec![JobCondition {
            type_: "Failed".into(),
            status: "True".into(),
            reason: Some("BackoffLimitExceeded".into()),
            message: Some(message.to_string()),
            ..Default::default()
        }]);
    }

    /// Write a release record stamped with the current time
    pub fn set_release(&self, name: &str, revision: u32, status: ReleaseStatus) {
        let record = ReleaseRecord {
            name: name.to_string(),
            revision,
            status,
            created: Some(self.clock.now()),
        };
        self.state
            .lock()
            .unwrap()
            .releases
            .insert(name.to_string(), record);
    }

    pub fn remove_release(&self, name: &str) {
        self.state.lock().unwrap().releases.remove(name);
    }
}

#[async_trait]
impl TargetBackend for FakeTarget {
    async fn ensure_prerequisites(&self, request: &PrerequisiteRequest) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = &state.prerequisite_error {
            return Err(BackendError::Other(message.clone()));
        }
        state.provisioned.push(request.clone());
        Ok(())
    }

    async fn dispatch(&self, request: &ExecutionRequest) -> Result<String, BackendError> {
        let mut state = self.state.lock().unwrap();
        let name = format!("{}-{}-{}", request.release, request.action, state.dispatched.len());
        let mut job = build_job(request, &name, &ControllerConfig::default().executor);
        job.metadata.creation_timestamp = Some(Time(self.clock.now()));
        state.jobs.insert(name.clone(), job);
        state.dispatched.push(request.clone());
        Ok(name)
    }

    async fn get_job(&self, _namespace: &str, name: &str) -> Result<Option<Job>, BackendError> {
        Ok(self.state.lock().unwrap().jobs.get(name).cloned())
    }

    async fn get_release(
        &self,
        _namespace: &str,
        release: &str,
    ) -> Result<Option<ReleaseRecord>, BackendError> {
        Ok(self.state.lock().unwrap().releases.get(release).cloned())
    }

    async fn delete_release(&self, _namespace: &str, release: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        state.releases.remove(release);
        state.deleted_releases.push(release.to_string());
        Ok(())
    }

    async fn collect_garbage(
        &self,
        _namespace: &str,
        _extension: &str,
        keep_job: &str,
    ) -> Result<usize, BackendError> {
        let mut state = self.state.lock().unwrap();
        state.collections += 1;
        let before = state.jobs.len();
        state.jobs.retain(|name, job| {
            let finished = job
                .status
                .as_ref()
                .is_some_and(|s| s.succeeded.unwrap_or(0) > 0 || s.failed.unwrap_or(0) > 0);
            name == keep_job || !finished
        });
        Ok(before - state.jobs.len())
    }
}

pub struct FakeConnector {
    clock: Arc<MockClock>,
    clusters: Mutex<Vec<Cluster>>,
    targets: Mutex<BTreeMap<Target, Arc<FakeTarget>>>,
}

impl FakeConnector {
    pub fn new(clock: Arc<MockClock>) -> Self {
        Self {
            clock,
            clusters: Mutex::new(Vec::new()),
            targets: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register a ready member cluster
    pub fn add_cluster(&self, name: &str, labels: &[(&str, &str)]) {
        let mut cluster = Cluster::new(name, ClusterSpec::default());
        cluster.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        cluster.status = Some(ClusterStatus {
            conditions: vec![ClusterCondition {
                type_: "Ready".into(),
                status: "True".into(),
                message: None,
            }],
        });
        self.clusters.lock().unwrap().push(cluster);
    }

    /// Flip the Ready condition of a registered cluster
    pub fn set_ready(&self, name: &str, ready: bool) {
        let mut clusters = self.clusters.lock().unwrap();
        let cluster = clusters
            .iter_mut()
            .find(|c| c.metadata.name.as_deref() == Some(name))
            .expect("cluster registered");
        cluster.status = Some(ClusterStatus {
            conditions: vec![ClusterCondition {
                type_: "Ready".into(),
                status: if ready { "True" } else { "False" }.into(),
                message: None,
            }],
        });
    }

    pub fn remove_cluster(&self, name: &str) {
        self.clusters
            .lock()
            .unwrap()
            .retain(|c| c.metadata.name.as_deref() != Some(name));
    }

    /// Backend of `target`, created on first use
    pub fn target(&self, target: &Target) -> Arc<FakeTarget> {
        self.targets
            .lock()
            .unwrap()
            .entry(target.clone())
            .or_insert_with(|| Arc::new(FakeTarget::new(self.clock.clone())))
            .clone()
    }

    pub fn host(&self) -> Arc<FakeTarget> {
        self.target(&Target::Host)
    }

    pub fn member(&self, name: &str) -> Arc<FakeTarget> {
        self.target(&Target::Member(name.to_string()))
    }
}

#[async_trait]
impl ClusterConnector for FakeConnector {
    async fn list_clusters(&self) -> Result<Vec<Cluster>, BackendError> {
        Ok(self.clusters.lock().unwrap().clone())
    }

    async fn connect(&self, target: &Target) -> Result<Arc<dyn TargetBackend>, BackendError> {
        if let Target::Member(name) = target {
            let known = self
                .clusters
                .lock()
                .unwrap()
                .iter()
                .any(|c| c.metadata.name.as_deref() == Some(name.as_str()));
            if !known {
                return Err(BackendError::Unreachable {
                    cluster: name.clone(),
                    reason: "cluster not registered".into(),
                });
            }
        }
        Ok(self.target(target))
    }
}

#[derive(Default)]
pub struct FakeStore {
    status: Mutex<InstallPlanStatus>,
    finalizer: Mutex<bool>,
    extension: Mutex<Option<ExtensionStatus>>,
    extended_apis: Mutex<Vec<(String, bool)>>,
    pending_conflicts: AtomicU32,
    status_writes: AtomicU32,
    failing_publishes: AtomicU32,
    failing_syncs: AtomicU32,
}

impl FakeStore {
    pub fn status(&self) -> InstallPlanStatus {
        self.status.lock().unwrap().clone()
    }

    pub fn has_finalizer(&self) -> bool {
        *self.finalizer.lock().unwrap()
    }

    pub fn set_finalizer(&self, present: bool) {
        *self.finalizer.lock().unwrap() = present;
    }

    pub fn extension(&self) -> Option<ExtensionStatus> {
        self.extension.lock().unwrap().clone()
    }

    pub fn extended_api_syncs(&self) -> Vec<(String, bool)> {
        self.extended_apis.lock().unwrap().clone()
    }

    /// Fail the next `count` status writes with 409 Conflict
    pub fn inject_conflicts(&self, count: u32) {
        self.pending_conflicts.store(count, Ordering::SeqCst);
    }

    pub fn status_writes(&self) -> u32 {
        self.status_writes.load(Ordering::SeqCst)
    }

    /// Forget the Extension status, as if the Extension was recreated
    pub fn clear_extension(&self) {
        *self.extension.lock().unwrap() = None;
    }

    /// Fail the next `count` Extension status writes
    pub fn fail_extension_publishes(&self, count: u32) {
        self.failing_publishes.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` extended-API syncs
    pub fn fail_extended_api_syncs(&self, count: u32) {
        self.failing_syncs.store(count, Ordering::SeqCst);
    }
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn service_unavailable() -> kube::Error {
    kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".into(),
        message: "the server is currently unable to handle the request".into(),
        reason: "ServiceUnavailable".into(),
        code: 503,
    })
}

fn conflict() -> kube::Error {
    kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".into(),
        message: "the object has been modified".into(),
        reason: "Conflict".into(),
        code: 409,
    })
}

#[async_trait]
impl PlanStore for FakeStore {
    async fn add_finalizer(&self, _plan: &str) -> Result<(), BackendError> {
        self.set_finalizer(true);
        Ok(())
    }

    async fn remove_finalizer(&self, _plan: &str) -> Result<(), BackendError> {
        self.set_finalizer(false);
        Ok(())
    }

    async fn update_status(
        &self,
        _plan: &str,
        observed: &InstallPlanStatus,
        desired: &InstallPlanStatus,
    ) -> Result<InstallPlanStatus, BackendError> {
        let stored = retry_on_conflict(5, "fake_update_status", || async move {
            if take_failure(&self.pending_conflicts) {
                return Err(conflict());
            }
            let mut status = self.status.lock().unwrap();
            *status = apply_delta(&status, observed, desired);
            self.status_writes.fetch_add(1, Ordering::SeqCst);
            Ok(status.clone())
        })
        .await?;
        Ok(stored)
    }

    async fn publish_extension_status(
        &self,
        _extension: &str,
        status: &ExtensionStatus,
    ) -> Result<(), BackendError> {
        if take_failure(&self.failing_publishes) {
            return Err(BackendError::KubeError(service_unavailable()));
        }
        *self.extension.lock().unwrap() = Some(status.clone());
        Ok(())
    }

    async fn sync_extended_apis(&self, extension: &str, enabled: bool) -> Result<(), BackendError> {
        if take_failure(&self.failing_syncs) {
            return Err(BackendError::KubeError(service_unavailable()));
        }
        self.extended_apis
            .lock()
            .unwrap()
            .push((extension.to_string(), enabled));
        Ok(())
    }
}
