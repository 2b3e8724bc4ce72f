use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, EnvVar, PodSpec, PodTemplateSpec, Volume,
    VolumeMount,
};
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Annotation carrying the action an execution job performs
pub const ACTION_ANNOTATION: &str = "executor.kubext.io/action";
/// Annotation carrying the hash of the values the job was built with
pub const VALUES_HASH_ANNOTATION: &str = "executor.kubext.io/values-hash";
/// Extension an execution object belongs to; used for garbage collection
pub const EXTENSION_LABEL: &str = "kubext.io/extension-ref";
/// InstallPlan an execution object belongs to; used to map job events back
pub const INSTALLPLAN_LABEL: &str = "kubext.io/installplan";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "kubext";

const WORKSPACE: &str = "/workspace";
const CHART_KEY: &str = "chart.tgz";
const VALUES_KEY: &str = "values.yaml";
const CA_KEY: &str = "ca.crt";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExecutionAction {
    Install,
    Upgrade,
    Uninstall,
}

impl ExecutionAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Upgrade => "upgrade",
            Self::Uninstall => "uninstall",
        }
    }

    /// Pick install or upgrade
    pub fn for_upgrade(upgrade: bool) -> Self {
        if upgrade {
            Self::Upgrade
        } else {
            Self::Install
        }
    }
}

impl fmt::Display for ExecutionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "install" => Ok(Self::Install),
            "upgrade" => Ok(Self::Upgrade),
            "uninstall" => Ok(Self::Uninstall),
            other => Err(format!("unknown execution action: {}", other)),
        }
    }
}

/// Everything one execution needs, bound to a single target
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionRequest {
    pub plan: String,
    pub extension: String,
    pub version: String,
    pub release: String,
    pub namespace: String,
    pub action: ExecutionAction,
    /// Flattened values (global config merged with the target override)
    pub values: String,
    pub values_hash: String,
    /// Packaged chart, empty for uninstall
    pub chart: Vec<u8>,
    pub ca_bundle: Option<String>,
    pub service_account: String,
}

/// Executor settings shared by every job
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutorSettings {
    pub image: String,
    pub backoff_limit: i32,
    pub active_deadline_seconds: i64,
}

/// Job and ConfigMap name for an execution
///
/// `<release>-<action>-<suffix>`, trimmed to the 63 character label limit.
pub fn execution_name(release: &str, action: ExecutionAction, suffix: &str) -> String {
    let tail = format!("-{}-{}", action.as_str(), suffix);
    let keep = 63usize.saturating_sub(tail.len()).min(release.len());
    let head = release[..keep].trim_end_matches('-');
    format!("{}{}", head, tail)
}

/// Labels put on every execution object of an extension
pub fn execution_labels(request: &ExecutionRequest) -> BTreeMap<String, String> {
    BTreeMap::from([
        (EXTENSION_LABEL.to_string(), request.extension.clone()),
        (INSTALLPLAN_LABEL.to_string(), request.plan.clone()),
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
    ])
}

/// Scratch ConfigMap mounted into the execution job
pub fn build_configmap(request: &ExecutionRequest, name: &str) -> ConfigMap {
    let mut data = BTreeMap::from([(VALUES_KEY.to_string(), request.values.clone())]);
    if let Some(ca) = &request.ca_bundle {
        data.insert(CA_KEY.to_string(), ca.clone());
    }

    let binary_data = (!request.chart.is_empty()).then(|| {
        BTreeMap::from([(CHART_KEY.to_string(), ByteString(request.chart.clone()))])
    });

    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(request.namespace.clone()),
            labels: Some(execution_labels(request)),
            ..Default::default()
        },
        data: Some(data),
        binary_data,
        ..Default::default()
    }
}

/// Execution job for `request`
///
/// The job runs under the provisioned service account and reads the chart and
/// values from the ConfigMap of the same name.
pub fn build_job(request: &ExecutionRequest, name: &str, settings: &ExecutorSettings) -> Job {
    let mut args = vec![
        request.action.as_str().to_string(),
        "--release".to_string(),
        request.release.clone(),
        "--namespace".to_string(),
        request.namespace.clone(),
    ];
    if request.action != ExecutionAction::Uninstall {
        args.extend([
            "--chart".to_string(),
            format!("{}/{}", WORKSPACE, CHART_KEY),
            "--values".to_string(),
            format!("{}/{}", WORKSPACE, VALUES_KEY),
        ]);
        if request.ca_bundle.is_some() {
            args.extend(["--ca-file".to_string(), format!("{}/{}", WORKSPACE, CA_KEY)]);
        }
    }

    let annotations = BTreeMap::from([
        (ACTION_ANNOTATION.to_string(), request.action.as_str().to_string()),
        (VALUES_HASH_ANNOTATION.to_string(), request.values_hash.clone()),
    ]);
    let labels = execution_labels(request);

    let container = Container {
        name: "executor".to_string(),
        image: Some(settings.image.clone()),
        args: Some(args),
        env: Some(vec![
            EnvVar {
                name: "EXTENSION_NAME".to_string(),
                value: Some(request.extension.clone()),
                ..Default::default()
            },
            EnvVar {
                name: "EXTENSION_VERSION".to_string(),
                value: Some(request.version.clone()),
                ..Default::default()
            },
        ]),
        volume_mounts: Some(vec![VolumeMount {
            name: "workspace".to_string(),
            mount_path: WORKSPACE.to_string(),
            read_only: Some(true),
            ..Default::default()
        }]),
        ..Default::default()
    };

    Job {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(request.namespace.clone()),
            labels: Some(labels.clone()),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(settings.backoff_limit),
            active_deadline_seconds: Some(settings.active_deadline_seconds),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(request.service_account.clone()),
                    restart_policy: Some("Never".to_string()),
                    containers: vec![container],
                    volumes: Some(vec![Volume {
                        name: "workspace".to_string(),
                        config_map: Some(ConfigMapVolumeSource {
                            name: name.to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Action recorded on an execution job
pub fn job_action(job: &Job) -> Option<ExecutionAction> {
    job.metadata
        .annotations
        .as_ref()?
        .get(ACTION_ANNOTATION)?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(action: ExecutionAction) -> ExecutionRequest {
        ExecutionRequest {
            plan: "observability".into(),
            extension: "observability".into(),
            version: "2.1.0".into(),
            release: "observability".into(),
            namespace: "extension-observability".into(),
            action,
            values: "replicas: 2\n".into(),
            values_hash: "abc".into(),
            chart: vec![1, 2, 3],
            ca_bundle: None,
            service_account: "observability-executor".into(),
        }
    }

    fn settings() -> ExecutorSettings {
        ExecutorSettings {
            image: "kubext/executor:latest".into(),
            backoff_limit: 0,
            active_deadline_seconds: 1800,
        }
    }

    #[test]
    fn test_job_carries_action_annotation_and_labels() {
        let job = build_job(&request(ExecutionAction::Upgrade), "obs-upgrade-x1", &settings());

        assert_eq!(job_action(&job), Some(ExecutionAction::Upgrade));
        let labels = job.metadata.labels.unwrap();
        assert_eq!(labels.get(EXTENSION_LABEL).unwrap(), "observability");
        assert_eq!(labels.get(INSTALLPLAN_LABEL).unwrap(), "observability");
    }

    #[test]
    fn test_job_runs_under_execution_service_account() {
        let job = build_job(&request(ExecutionAction::Install), "obs-install-x1", &settings());
        let spec = job.spec.unwrap();
        let pod = spec.template.spec.unwrap();

        assert_eq!(pod.service_account_name.as_deref(), Some("observability-executor"));
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        assert_eq!(spec.backoff_limit, Some(0));
        let args = pod.containers[0].args.clone().unwrap();
        assert_eq!(args[0], "install");
        assert!(args.contains(&"--chart".to_string()));
    }

    #[test]
    fn test_uninstall_job_does_not_reference_chart() {
        let job = build_job(&request(ExecutionAction::Uninstall), "obs-uninstall-x1", &settings());
        let args = job.spec.unwrap().template.spec.unwrap().containers[0]
            .args
            .clone()
            .unwrap();

        assert_eq!(args[0], "uninstall");
        assert!(!args.contains(&"--chart".to_string()));
    }

    #[test]
    fn test_configmap_holds_chart_and_values() {
        let mut req = request(ExecutionAction::Install);
        req.ca_bundle = Some("-----BEGIN CERTIFICATE-----".into());
        let cm = build_configmap(&req, "obs-install-x1");

        let data = cm.data.unwrap();
        assert_eq!(data.get(VALUES_KEY).unwrap(), "replicas: 2\n");
        assert!(data.contains_key(CA_KEY));
        assert_eq!(cm.binary_data.unwrap().get(CHART_KEY).unwrap().0, vec![1, 2, 3]);
    }

    #[test]
    fn test_execution_name_fits_label_limit() {
        let long = "a".repeat(80);
        let name = execution_name(&long, ExecutionAction::Uninstall, "k3x9q");
        assert!(name.len() <= 63);
        assert!(name.ends_with("-uninstall-k3x9q"));

        assert_eq!(
            execution_name("demo", ExecutionAction::Install, "abcde"),
            "demo-install-abcde"
        );
    }

    #[test]
    fn test_action_parsing() {
        assert_eq!("upgrade".parse::<ExecutionAction>(), Ok(ExecutionAction::Upgrade));
        assert!("rollback".parse::<ExecutionAction>().is_err());
        assert_eq!(ExecutionAction::for_upgrade(false), ExecutionAction::Install);
    }
}
