//! Seams between the InstallPlan state machine and the clusters it drives
//!
//! The reconciler only talks to these traits. `kube_backend` holds the
//! Kubernetes implementations; tests use in-memory ones.

use crate::controller::installplan::dispatch::ExecutionRequest;
use crate::controller::installplan::prerequisites::PrerequisiteRequest;
use crate::crd::cluster::Cluster;
use crate::crd::extension::ExtensionStatus;
use crate::crd::installplan::InstallPlanStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("invalid kubeconfig: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    #[error("cluster {cluster} is not reachable: {reason}")]
    Unreachable { cluster: String, reason: String },

    #[error("{0}")]
    Other(String),
}

/// Where a branch is installed
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Target {
    Host,
    Member(String),
}

impl Target {
    pub fn is_host(&self) -> bool {
        matches!(self, Target::Host)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Host => f.write_str("host"),
            Target::Member(name) => f.write_str(name),
        }
    }
}

/// Helm storage driver release status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseStatus {
    Deployed,
    Failed,
    PendingInstall,
    PendingUpgrade,
    PendingRollback,
    Uninstalling,
    Uninstalled,
    Superseded,
    Unknown,
}

impl FromStr for ReleaseStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "deployed" => Self::Deployed,
            "failed" => Self::Failed,
            "pending-install" => Self::PendingInstall,
            "pending-upgrade" => Self::PendingUpgrade,
            "pending-rollback" => Self::PendingRollback,
            "uninstalling" => Self::Uninstalling,
            "uninstalled" => Self::Uninstalled,
            "superseded" => Self::Superseded,
            _ => Self::Unknown,
        })
    }
}

/// Latest revision of a release as seen in its storage record
#[derive(Clone, Debug, PartialEq)]
pub struct ReleaseRecord {
    pub name: String,
    pub revision: u32,
    pub status: ReleaseStatus,
    /// When this revision was written
    pub created: Option<DateTime<Utc>>,
}

/// Operations against one target cluster
#[async_trait]
pub trait TargetBackend: Send + Sync {
    /// Make sure namespace, service account and RBAC exist
    async fn ensure_prerequisites(&self, request: &PrerequisiteRequest) -> Result<(), BackendError>;

    /// Launch the execution job and return its name without waiting
    async fn dispatch(&self, request: &ExecutionRequest) -> Result<String, BackendError>;

    /// `None` when the job does not exist
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, BackendError>;

    /// `None` when the release has no storage record
    async fn get_release(
        &self,
        namespace: &str,
        release: &str,
    ) -> Result<Option<ReleaseRecord>, BackendError>;

    /// Drop the release storage records without running uninstall hooks
    async fn delete_release(&self, namespace: &str, release: &str) -> Result<(), BackendError>;

    /// Delete finished execution jobs and their ConfigMaps, except `keep_job`
    ///
    /// # Returns
    /// Number of jobs deleted
    async fn collect_garbage(
        &self,
        namespace: &str,
        extension: &str,
        keep_job: &str,
    ) -> Result<usize, BackendError>;
}

/// Access to the host and registered member clusters
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    async fn list_clusters(&self) -> Result<Vec<Cluster>, BackendError>;

    async fn connect(&self, target: &Target) -> Result<Arc<dyn TargetBackend>, BackendError>;
}

/// Writes to the InstallPlan and the objects derived from it
#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn add_finalizer(&self, plan: &str) -> Result<(), BackendError>;

    async fn remove_finalizer(&self, plan: &str) -> Result<(), BackendError>;

    /// Persist the changes between `observed` and `desired`
    ///
    /// # Returns
    /// The status as stored after the write
    async fn update_status(
        &self,
        plan: &str,
        observed: &InstallPlanStatus,
        desired: &InstallPlanStatus,
    ) -> Result<InstallPlanStatus, BackendError>;

    /// Overwrite the aggregate status of the Extension
    async fn publish_extension_status(
        &self,
        extension: &str,
        status: &ExtensionStatus,
    ) -> Result<(), BackendError>;

    /// Mark the extended-API objects of `extension` available or disabled
    async fn sync_extended_apis(&self, extension: &str, enabled: bool) -> Result<(), BackendError>;
}
