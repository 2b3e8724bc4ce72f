//! Kubernetes implementations of the backend traits
//!
//! `KubePlanStore` writes to the InstallPlan, the Extension aggregate and the
//! extended-API objects in the host cluster. `KubeConnector` hands out a
//! `KubeTargetBackend` per target: the controller's own client for the host,
//! a client built from the cluster's kubeconfig Secret for members.

use crate::controller::backend::{
    BackendError, ClusterConnector, PlanStore, ReleaseRecord, ReleaseStatus, Target, TargetBackend,
};
use crate::controller::installplan::dispatch::{
    build_configmap, build_job, execution_name, ExecutionRequest, ExecutorSettings, EXTENSION_LABEL,
};
use crate::controller::installplan::persist::{apply_delta, is_not_found, retry_on_conflict};
use crate::controller::installplan::prerequisites::{
    baseline_cluster_rules, baseline_rules, build_cluster_role, build_cluster_role_binding,
    build_namespace, build_role, build_role_binding, build_service_account, merge_rules,
    PrerequisiteRequest,
};
use crate::controller::installplan::sync::{job_outcome, JobOutcome};
use crate::crd::cluster::Cluster;
use crate::crd::extension::{Extension, ExtensionStatus};
use crate::crd::installplan::{InstallPlan, InstallPlanStatus, INSTALLPLAN_FINALIZER};
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use kube::api::{
    Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams,
};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config, Resource, ResourceExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Server-side apply field manager
pub const FIELD_MANAGER: &str = "kubext-controller";

/// Key of the kubeconfig in a cluster connection Secret
pub const KUBECONFIG_KEY: &str = "kubeconfig";

const HELM_RELEASE_TYPE: &str = "helm.sh/release.v1";

const EXTENDED_API_GROUP: &str = "extensions.kubext.io";
const EXTENDED_API_VERSION: &str = "v1alpha1";

/// Extended-API kinds and their plurals
const EXTENDED_API_KINDS: &[(&str, &str)] = &[
    ("APIService", "apiservices"),
    ("JSBundle", "jsbundles"),
    ("ReverseProxy", "reverseproxies"),
    ("ExtensionEntry", "extensionentries"),
];

/// Turn `next` into a merge patch that also drops what `previous` had
///
/// JSON merge patch only removes object keys that are explicitly `null`, so
/// every key present in `previous` but missing in `next` is nulled, at any
/// depth. Arrays are replaced wholesale.
pub fn removal_patch(previous: &Value, next: &Value) -> Value {
    match (previous, next) {
        (Value::Object(previous), Value::Object(next)) => {
            let mut patch = next.clone();
            for (key, old) in previous {
                match next.get(key) {
                    None => {
                        patch.insert(key.clone(), Value::Null);
                    }
                    Some(new) => {
                        patch.insert(key.clone(), removal_patch(old, new));
                    }
                }
            }
            Value::Object(patch)
        }
        (_, next) => next.clone(),
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, kube::Error> {
    serde_json::to_value(value).map_err(kube::Error::SerdeError)
}

pub struct KubePlanStore {
    client: Client,
    retries: u32,
}

impl KubePlanStore {
    pub fn new(client: Client, retries: u32) -> Self {
        Self { client, retries }
    }

    fn plans(&self) -> Api<InstallPlan> {
        Api::all(self.client.clone())
    }

    /// Rewrite the finalizer list with the plan's resourceVersion as precondition
    async fn edit_finalizers<F>(&self, plan: &str, edit: F) -> Result<(), BackendError>
    where
        F: Fn(&mut Vec<String>) -> bool + Send + Sync,
    {
        let api = self.plans();
        let edit = &edit;
        let api = &api;
        retry_on_conflict(self.retries, "edit_finalizers", || async move {
            let Some(current) = api.get_opt(plan).await? else {
                return Ok(());
            };
            let mut finalizers = current.finalizers().to_vec();
            if !edit(&mut finalizers) {
                return Ok(());
            }
            let patch = json!({
                "metadata": {
                    "finalizers": finalizers,
                    "resourceVersion": current.resource_version(),
                }
            });
            api.patch(plan, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    fn extended_api(&self, kind: &str, plural: &str) -> Api<DynamicObject> {
        let resource = ApiResource {
            group: EXTENDED_API_GROUP.to_string(),
            version: EXTENDED_API_VERSION.to_string(),
            api_version: format!("{}/{}", EXTENDED_API_GROUP, EXTENDED_API_VERSION),
            kind: kind.to_string(),
            plural: plural.to_string(),
        };
        Api::all_with(self.client.clone(), &resource)
    }
}

#[async_trait]
impl PlanStore for KubePlanStore {
    async fn add_finalizer(&self, plan: &str) -> Result<(), BackendError> {
        self.edit_finalizers(plan, |finalizers| {
            if finalizers.iter().any(|f| f == INSTALLPLAN_FINALIZER) {
                return false;
            }
            finalizers.push(INSTALLPLAN_FINALIZER.to_string());
            true
        })
        .await
    }

    async fn remove_finalizer(&self, plan: &str) -> Result<(), BackendError> {
        self.edit_finalizers(plan, |finalizers| {
            let before = finalizers.len();
            finalizers.retain(|f| f != INSTALLPLAN_FINALIZER);
            finalizers.len() != before
        })
        .await
    }

    async fn update_status(
        &self,
        plan: &str,
        observed: &InstallPlanStatus,
        desired: &InstallPlanStatus,
    ) -> Result<InstallPlanStatus, BackendError> {
        let api = self.plans();
        let api = &api;
        let stored = retry_on_conflict(self.retries, "update_status", || async move {
            let current = api.get_status(plan).await?;
            let server_status = current.status.clone().unwrap_or_default();
            let merged = apply_delta(&server_status, observed, desired);

            let patch = json!({
                "metadata": { "resourceVersion": current.resource_version() },
                "status": removal_patch(&to_value(&server_status)?, &to_value(&merged)?),
            });
            let updated = api
                .patch_status(plan, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            Ok(updated.status.unwrap_or(merged))
        })
        .await?;
        debug!(plan = %plan, "Status updated");
        Ok(stored)
    }

    async fn publish_extension_status(
        &self,
        extension: &str,
        status: &ExtensionStatus,
    ) -> Result<(), BackendError> {
        let api: Api<Extension> = Api::all(self.client.clone());
        let Some(current) = api.get_opt(extension).await? else {
            debug!(extension = %extension, "Extension not found, skipping status");
            return Ok(());
        };
        if current.status.as_ref() == Some(status) {
            return Ok(());
        }

        let previous = to_value(&current.status.unwrap_or_default())?;
        let patch = json!({ "status": removal_patch(&previous, &to_value(status)?) });
        api.patch_status(extension, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn sync_extended_apis(&self, extension: &str, enabled: bool) -> Result<(), BackendError> {
        let state = if enabled { "Available" } else { "Disabled" };
        let selector = format!("{}={}", EXTENSION_LABEL, extension);
        let patch = json!({ "status": { "state": state } });

        for (kind, plural) in EXTENDED_API_KINDS {
            let api = self.extended_api(kind, plural);
            let objects = match api.list(&ListParams::default().labels(&selector)).await {
                Ok(list) => list.items,
                Err(e) if is_not_found(&e) => {
                    debug!(kind = %kind, "Extended API not installed, skipping");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            for object in objects {
                let name = object.name_any();
                match api
                    .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
                {
                    Ok(_) => {}
                    Err(e) if is_not_found(&e) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        info!(extension = %extension, state = %state, "Synchronized extended APIs");
        Ok(())
    }
}

pub struct KubeConnector {
    client: Client,
    executor: ExecutorSettings,
}

impl KubeConnector {
    pub fn new(client: Client, executor: ExecutorSettings) -> Self {
        Self { client, executor }
    }

    /// Client for a member cluster from its connection Secret
    async fn member_client(&self, name: &str) -> Result<Client, BackendError> {
        let unreachable = |reason: String| BackendError::Unreachable {
            cluster: name.to_string(),
            reason,
        };

        let clusters: Api<Cluster> = Api::all(self.client.clone());
        let cluster = clusters
            .get_opt(name)
            .await?
            .ok_or_else(|| unreachable("cluster not registered".to_string()))?;
        let secret_ref = cluster
            .spec
            .connection
            .secret_ref
            .ok_or_else(|| unreachable("no connection secret".to_string()))?;

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &secret_ref.namespace);
        let secret = secrets.get_opt(&secret_ref.name).await?.ok_or_else(|| {
            unreachable(format!(
                "secret {}/{} not found",
                secret_ref.namespace, secret_ref.name
            ))
        })?;
        let raw = secret
            .data
            .and_then(|mut data| data.remove(KUBECONFIG_KEY))
            .ok_or_else(|| unreachable(format!("secret has no {} key", KUBECONFIG_KEY)))?;
        let text = String::from_utf8(raw.0)
            .map_err(|e| unreachable(format!("kubeconfig is not UTF-8: {}", e)))?;

        let kubeconfig = Kubeconfig::from_yaml(&text)?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
        Ok(Client::try_from(config)?)
    }
}

#[async_trait]
impl ClusterConnector for KubeConnector {
    async fn list_clusters(&self) -> Result<Vec<Cluster>, BackendError> {
        let api: Api<Cluster> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn connect(&self, target: &Target) -> Result<Arc<dyn TargetBackend>, BackendError> {
        let client = match target {
            Target::Host => self.client.clone(),
            Target::Member(name) => self.member_client(name).await?,
        };
        Ok(Arc::new(KubeTargetBackend::new(client, self.executor.clone())))
    }
}

pub struct KubeTargetBackend {
    client: Client,
    executor: ExecutorSettings,
}

impl KubeTargetBackend {
    pub fn new(client: Client, executor: ExecutorSettings) -> Self {
        Self { client, executor }
    }

    async fn apply<K>(&self, api: &Api<K>, object: &K) -> Result<(), BackendError>
    where
        K: Resource + Serialize + Clone + std::fmt::Debug + serde::de::DeserializeOwned,
    {
        let name = object.meta().name.clone().unwrap_or_default();
        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(object),
        )
        .await?;
        Ok(())
    }

    fn release_selector(release: &str) -> String {
        format!("owner=helm,name={}", release)
    }
}

/// Release record from the helm storage Secret with the highest revision
pub fn latest_release(release: &str, secrets: &[Secret]) -> Option<ReleaseRecord> {
    secrets
        .iter()
        .filter_map(|secret| {
            let labels = secret.metadata.labels.as_ref()?;
            let revision: u32 = labels.get("version")?.parse().ok()?;
            Some((revision, labels, secret))
        })
        .max_by_key(|(revision, _, _)| *revision)
        .map(|(revision, labels, secret)| ReleaseRecord {
            name: release.to_string(),
            revision,
            status: labels
                .get("status")
                .map(|s| s.parse().unwrap_or(ReleaseStatus::Unknown))
                .unwrap_or(ReleaseStatus::Unknown),
            created: secret.metadata.creation_timestamp.as_ref().map(|t| t.0),
        })
}

#[async_trait]
impl TargetBackend for KubeTargetBackend {
    async fn ensure_prerequisites(&self, request: &PrerequisiteRequest) -> Result<(), BackendError> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        self.apply(&namespaces, &build_namespace(request)).await?;

        let accounts: Api<ServiceAccount> = Api::namespaced(self.client.clone(), &request.namespace);
        self.apply(&accounts, &build_service_account(request)).await?;

        let role_name = request.role_name();
        let roles: Api<Role> = Api::namespaced(self.client.clone(), &request.namespace);
        let existing = roles.get_opt(&role_name).await?;
        let rules = merge_rules(
            existing.as_ref().and_then(|r| r.rules.as_deref()),
            &baseline_rules(),
            &request.permissions.rules,
        );
        self.apply(&roles, &build_role(request, rules)).await?;

        let cluster_roles: Api<ClusterRole> = Api::all(self.client.clone());
        let existing = cluster_roles.get_opt(&role_name).await?;
        let rules = merge_rules(
            existing.as_ref().and_then(|r| r.rules.as_deref()),
            &baseline_cluster_rules(),
            &request.permissions.cluster_rules,
        );
        self.apply(&cluster_roles, &build_cluster_role(request, rules))
            .await?;

        let bindings: Api<RoleBinding> = Api::namespaced(self.client.clone(), &request.namespace);
        self.apply(&bindings, &build_role_binding(request)).await?;

        let cluster_bindings: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        self.apply(&cluster_bindings, &build_cluster_role_binding(request))
            .await?;

        debug!(
            extension = %request.extension,
            namespace = %request.namespace,
            service_account = %request.service_account(),
            "Prerequisites ensured"
        );
        Ok(())
    }

    async fn dispatch(&self, request: &ExecutionRequest) -> Result<String, BackendError> {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let name = execution_name(&request.release, request.action, &suffix[..8]);

        let configmaps: Api<ConfigMap> = Api::namespaced(self.client.clone(), &request.namespace);
        configmaps
            .create(&PostParams::default(), &build_configmap(request, &name))
            .await?;

        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &request.namespace);
        jobs.create(
            &PostParams::default(),
            &build_job(request, &name, &self.executor),
        )
        .await?;

        Ok(name)
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, BackendError> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        Ok(jobs.get_opt(name).await?)
    }

    async fn get_release(
        &self,
        namespace: &str,
        release: &str,
    ) -> Result<Option<ReleaseRecord>, BackendError> {
        // No namespace was resolved, so nothing can have been installed
        if namespace.is_empty() {
            return Ok(None);
        }
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default()
            .labels(&Self::release_selector(release))
            .fields(&format!("type={}", HELM_RELEASE_TYPE));
        let list = match secrets.list(&params).await {
            Ok(list) => list,
            Err(e) if is_not_found(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(latest_release(release, &list.items))
    }

    async fn delete_release(&self, namespace: &str, release: &str) -> Result<(), BackendError> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&Self::release_selector(release));
        match secrets
            .delete_collection(&DeleteParams::default(), &params)
            .await
        {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(e.into()),
        }
        info!(namespace = %namespace, release = %release, "Deleted release records");
        Ok(())
    }

    async fn collect_garbage(
        &self,
        namespace: &str,
        extension: &str,
        keep_job: &str,
    ) -> Result<usize, BackendError> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let configmaps: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let selector = format!("{}={}", EXTENSION_LABEL, extension);

        let mut deleted = 0;
        for job in jobs.list(&ListParams::default().labels(&selector)).await?.items {
            let name = job.name_any();
            if name == keep_job || job_outcome(&job) == JobOutcome::Active {
                continue;
            }
            for result in [
                jobs.delete(&name, &DeleteParams::background()).await.map(|_| ()),
                configmaps.delete(&name, &DeleteParams::default()).await.map(|_| ()),
            ] {
                match result {
                    Ok(()) => {}
                    Err(e) if is_not_found(&e) => {}
                    Err(e) => warn!(job = %name, error = %e, "Failed to delete execution object"),
                }
            }
            deleted += 1;
        }
        Ok(deleted)
    }
}
