use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label marking the cluster the controller itself runs in
pub const HOST_CLUSTER_LABEL: &str = "cluster-role.kubext.io/host";

pub const CLUSTER_READY: &str = "Ready";
pub const CLUSTER_SCHEDULABLE: &str = "Schedulable";

/// Cluster is a registered member cluster
///
/// Read-only for this controller.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "kubext.io",
    version = "v1alpha1",
    kind = "Cluster",
    status = "ClusterStatus",
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct ClusterSpec {
    #[serde(default)]
    pub connection: Connection,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct Connection {
    /// Secret with a `kubeconfig` key for reaching the cluster
    #[serde(rename = "secretRef", skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretRef>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct SecretRef {
    pub namespace: String,
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ClusterStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ClusterCondition>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ClusterCondition {
    #[serde(rename = "type")]
    pub type_: String,

    /// "True", "False" or "Unknown"
    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Cluster {
    fn condition_status(&self, type_: &str) -> Option<&str> {
        self.status
            .as_ref()?
            .conditions
            .iter()
            .find(|c| c.type_ == type_)
            .map(|c| c.status.as_str())
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn is_ready(&self) -> bool {
        self.condition_status(CLUSTER_READY) == Some("True")
    }

    /// Eligible to receive workloads
    ///
    /// Not deleting, `Ready=True`, and not explicitly marked unschedulable.
    pub fn is_schedulable(&self) -> bool {
        !self.is_deleting()
            && self.is_ready()
            && self.condition_status(CLUSTER_SCHEDULABLE) != Some("False")
    }

    pub fn is_host(&self) -> bool {
        self.metadata
            .labels
            .as_ref()
            .is_some_and(|l| l.contains_key(HOST_CLUSTER_LABEL))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster_with(conditions: &[(&str, &str)]) -> Cluster {
        let mut cluster = Cluster::new("member", ClusterSpec::default());
        cluster.status = Some(ClusterStatus {
            conditions: conditions
                .iter()
                .map(|(t, s)| ClusterCondition {
                    type_: t.to_string(),
                    status: s.to_string(),
                    message: None,
                })
                .collect(),
        });
        cluster
    }

    #[test]
    fn test_ready_cluster_is_schedulable() {
        assert!(cluster_with(&[(CLUSTER_READY, "True")]).is_schedulable());
    }

    #[test]
    fn test_not_ready_cluster_is_not_schedulable() {
        assert!(!cluster_with(&[(CLUSTER_READY, "False")]).is_schedulable());
        assert!(!cluster_with(&[]).is_schedulable());
    }

    #[test]
    fn test_unschedulable_condition_excludes_cluster() {
        let cluster = cluster_with(&[(CLUSTER_READY, "True"), (CLUSTER_SCHEDULABLE, "False")]);
        assert!(!cluster.is_schedulable());
    }

    #[test]
    fn test_deleting_cluster_is_not_schedulable() {
        let mut cluster = cluster_with(&[(CLUSTER_READY, "True")]);
        cluster.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()),
        );
        assert!(!cluster.is_schedulable());
    }
}
