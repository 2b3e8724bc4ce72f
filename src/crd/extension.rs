use crate::crd::installplan::{Condition, InstallationState};
use k8s_openapi::api::rbac::v1::PolicyRule;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Extension is the catalog entry of an installable package
///
/// Its status is a projection of the InstallPlan that installs it and is only
/// ever written by the InstallPlan controller.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "kubext.io",
    version = "v1alpha1",
    kind = "Extension",
    status = "ExtensionStatus",
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Installed", "type":"string", "jsonPath":".status.installedVersion"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct ExtensionSpec {
    #[serde(rename = "displayName", default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// Aggregate status across all installation branches
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ExtensionStatus {
    /// Host branch state
    #[serde(default)]
    pub state: InstallationState,

    #[serde(default)]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Version requested by the InstallPlan
    #[serde(rename = "plannedInstallVersion", default, skip_serializing_if = "String::is_empty")]
    pub planned_install_version: String,

    /// Version last deployed on the host
    #[serde(rename = "installedVersion", default, skip_serializing_if = "String::is_empty")]
    pub installed_version: String,

    #[serde(
        rename = "clusterSchedulingStatuses",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub cluster_scheduling_statuses: BTreeMap<String, ClusterExtensionStatus>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ClusterExtensionStatus {
    #[serde(default)]
    pub state: InstallationState,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// ExtensionVersion describes where the package of one version lives
///
/// Named `<extension>-<version>`.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "kubext.io",
    version = "v1alpha1",
    kind = "ExtensionVersion",
    printcolumn = r#"{"name":"Extension", "type":"string", "jsonPath":".spec.extensionName"}"#,
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.version"}"#
)]
pub struct ExtensionVersionSpec {
    #[serde(rename = "extensionName")]
    pub extension_name: String,

    pub version: String,

    /// HTTP(S) location of the packaged chart
    #[serde(rename = "chartURL", skip_serializing_if = "Option::is_none")]
    pub chart_url: Option<String>,

    /// ConfigMap key holding the packaged chart, preferred over `chartURL`
    #[serde(rename = "chartDataRef", skip_serializing_if = "Option::is_none")]
    pub chart_data_ref: Option<ChartDataRef>,

    /// PEM bundle trusted when downloading from `chartURL`
    #[serde(rename = "caBundle", skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<String>,

    /// Namespace the extension is installed into
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// RBAC rules the package needs at install time
    #[serde(default)]
    pub permissions: Permissions,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ChartDataRef {
    pub namespace: String,
    pub name: String,
    pub key: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct Permissions {
    /// Namespaced rules, granted in the target namespace
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<PolicyRule>,

    /// Cluster-wide rules
    #[serde(rename = "clusterRules", default, skip_serializing_if = "Vec::is_empty")]
    pub cluster_rules: Vec<PolicyRule>,
}

pub fn extension_version_name(extension: &str, version: &str) -> String {
    format!("{}-{}", extension, version)
}
