use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;

/// Maximum number of entries kept in `stateHistory`
pub const MAX_STATE_NUM: usize = 10;

/// Finalizer guarding uninstall of everything a plan deployed
pub const INSTALLPLAN_FINALIZER: &str = "kubext.io/installplan-protection";

/// Annotation that skips the uninstall execution on deletion
pub const FORCE_DELETE_ANNOTATION: &str = "kubext.io/force-delete";

/// InstallPlan requests installation of one Extension version
///
/// The host cluster always receives the extension. Member clusters receive it
/// when `clusterScheduling` selects them.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "kubext.io",
    version = "v1alpha1",
    kind = "InstallPlan",
    status = "InstallPlanStatus",
    printcolumn = r#"{"name":"Extension", "type":"string", "jsonPath":".spec.extension.name"}"#,
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.extension.version"}"#,
    printcolumn = r#"{"name":"Enabled", "type":"boolean", "jsonPath":".spec.enabled"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.installationStatus.state"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct InstallPlanSpec {
    /// Extension and version to install
    pub extension: ExtensionRef,

    /// Raw YAML values passed to the package on every target
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub config: String,

    /// Whether the extended APIs of the extension are served
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Member cluster placement
    #[serde(rename = "clusterScheduling", skip_serializing_if = "Option::is_none")]
    pub cluster_scheduling: Option<ClusterScheduling>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct ExtensionRef {
    pub name: String,
    pub version: String,
}

/// Member cluster scheduling
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ClusterScheduling {
    #[serde(default)]
    pub placement: Placement,

    /// Per-cluster YAML values, deep-merged over `spec.config`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub overrides: BTreeMap<String, String>,
}

/// Explicit cluster names take precedence over the selector
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct Placement {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clusters: Vec<String>,

    #[serde(rename = "clusterSelector", skip_serializing_if = "Option::is_none")]
    pub cluster_selector: Option<LabelSelector>,
}

/// Installation lifecycle state of one target
///
/// `Installed` and `Upgraded` are never recorded; they collapse to `Deployed`
/// and only select which condition is set.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, JsonSchema)]
pub enum InstallationState {
    /// Nothing has been attempted yet
    #[default]
    #[serde(rename = "")]
    Initial,
    Preparing,
    Installing,
    Installed,
    Upgrading,
    Upgraded,
    Deployed,
    InstallFailed,
    UpgradeFailed,
    Uninstalling,
    Uninstalled,
    UninstallFailed,
}

impl InstallationState {
    /// State actually written to status
    pub fn collapsed(self) -> Self {
        match self {
            Self::Installed | Self::Upgraded => Self::Deployed,
            other => other,
        }
    }

    /// An execution job is expected to be running
    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            Self::Preparing | Self::Installing | Self::Upgrading | Self::Uninstalling
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "",
            Self::Preparing => "Preparing",
            Self::Installing => "Installing",
            Self::Installed => "Installed",
            Self::Upgrading => "Upgrading",
            Self::Upgraded => "Upgraded",
            Self::Deployed => "Deployed",
            Self::InstallFailed => "InstallFailed",
            Self::UpgradeFailed => "UpgradeFailed",
            Self::Uninstalling => "Uninstalling",
            Self::Uninstalled => "Uninstalled",
            Self::UninstallFailed => "UninstallFailed",
        }
    }
}

impl fmt::Display for InstallationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Condition on an installation branch, unique by `type`
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,

    pub status: ConditionStatus,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// RFC3339 timestamp
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: String,
}

/// One recorded state change
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct StateTransition {
    pub state: InstallationState,

    /// RFC3339 timestamp
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: String,
}

impl StateTransition {
    pub fn time(&self) -> Option<DateTime<Utc>> {
        parse_time(&self.last_transition_time)
    }
}

/// Bounded, time-ordered history of state changes
///
/// Holds at most [`MAX_STATE_NUM`] entries; pushing onto a full history evicts
/// the oldest entry. Serialized as a plain list, oldest first.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(from = "Vec<StateTransition>", into = "Vec<StateTransition>")]
pub struct StateHistory(VecDeque<StateTransition>);

impl StateHistory {
    pub fn latest(&self) -> Option<&StateTransition> {
        self.0.back()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StateTransition> {
        self.0.iter()
    }

    /// Append a transition
    ///
    /// Rejects entries older than the latest one and returns whether the entry
    /// was recorded.
    pub fn record(&mut self, state: InstallationState, at: DateTime<Utc>) -> bool {
        if let Some(latest) = self.latest().and_then(StateTransition::time) {
            if at < latest {
                return false;
            }
        }
        if self.0.len() == MAX_STATE_NUM {
            self.0.pop_front();
        }
        self.0.push_back(StateTransition {
            state,
            last_transition_time: at.to_rfc3339(),
        });
        true
    }
}

impl From<Vec<StateTransition>> for StateHistory {
    fn from(mut entries: Vec<StateTransition>) -> Self {
        if entries.len() > MAX_STATE_NUM {
            entries.drain(..entries.len() - MAX_STATE_NUM);
        }
        Self(entries.into())
    }
}

impl From<StateHistory> for Vec<StateTransition> {
    fn from(history: StateHistory) -> Self {
        history.0.into()
    }
}

/// Status of one rollout branch (the host or a single member cluster)
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct InstallationStatus {
    #[serde(default)]
    pub state: InstallationState,

    #[serde(rename = "stateHistory", default, skip_serializing_if = "StateHistory::is_empty")]
    #[schemars(with = "Vec<StateTransition>")]
    pub state_history: StateHistory,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Hash of the values used by the last dispatched execution
    #[serde(rename = "configHash", default, skip_serializing_if = "String::is_empty")]
    pub config_hash: String,

    /// Extension version of the last dispatched execution
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,

    /// Name of the last dispatched execution job
    #[serde(rename = "jobName", default, skip_serializing_if = "String::is_empty")]
    pub job_name: String,

    #[serde(rename = "releaseName", default, skip_serializing_if = "String::is_empty")]
    pub release_name: String,

    #[serde(rename = "targetNamespace", default, skip_serializing_if = "String::is_empty")]
    pub target_namespace: String,
}

impl InstallationStatus {
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}

/// Status of the InstallPlan
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct InstallPlanStatus {
    /// Namespace the release is installed into, fixed after first resolution
    #[serde(rename = "targetNamespace", default, skip_serializing_if = "String::is_empty")]
    pub target_namespace: String,

    /// Release name, fixed after first resolution
    #[serde(rename = "releaseName", default, skip_serializing_if = "String::is_empty")]
    pub release_name: String,

    /// `spec.enabled` as last applied to the extended APIs; unset until the
    /// first successful sync
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Host cluster branch
    #[serde(rename = "installationStatus", skip_serializing_if = "Option::is_none")]
    pub installation_status: Option<InstallationStatus>,

    /// Member cluster branches keyed by cluster name
    #[serde(
        rename = "clusterSchedulingStatuses",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub cluster_scheduling_statuses: BTreeMap<String, InstallationStatus>,
}

impl InstallPlan {
    pub fn is_force_delete(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(FORCE_DELETE_ANNOTATION))
            .is_some_and(|v| v == "true")
    }

    pub fn has_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|f| f == INSTALLPLAN_FINALIZER))
    }
}

/// Parse an RFC3339 timestamp as stored in status
pub fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
#[path = "installplan_test.rs"]
mod tests;
