//! Objects an execution job needs in its target before it can run
//!
//! The execution ServiceAccount is bound to a Role in the target namespace and
//! a ClusterRole. Both start from a fixed baseline and only ever grow by the
//! declared rules the current rules do not already cover.

use crate::controller::rbac::covers;
use crate::crd::extension::Permissions;
use k8s_openapi::api::core::v1::{Namespace, ServiceAccount};
use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject,
};
use kube::api::ObjectMeta;
use std::collections::BTreeMap;

use super::dispatch::{EXTENSION_LABEL, MANAGED_BY, MANAGED_BY_LABEL};

const RBAC_GROUP: &str = "rbac.authorization.k8s.io";

/// What to provision for one release in one target
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PrerequisiteRequest {
    pub extension: String,
    pub release: String,
    pub namespace: String,
    /// Rules the package declares
    pub permissions: Permissions,
}

impl PrerequisiteRequest {
    pub fn service_account(&self) -> String {
        service_account_name(&self.release)
    }

    pub fn role_name(&self) -> String {
        format!("kubext:{}:executor", self.release)
    }

    fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (EXTENSION_LABEL.to_string(), self.extension.clone()),
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
        ])
    }
}

pub fn service_account_name(release: &str) -> String {
    format!("{}-executor", release)
}

fn rule(groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(groups.iter().map(|s| s.to_string()).collect()),
        resources: Some(resources.iter().map(|s| s.to_string()).collect()),
        verbs: verbs.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

const WRITE_VERBS: &[&str] = &[
    "get", "list", "watch", "create", "update", "patch", "delete",
];

/// Namespaced rules every execution gets
pub fn baseline_rules() -> Vec<PolicyRule> {
    vec![rule(
        &[
            "",
            "apps",
            "batch",
            "autoscaling",
            "policy",
            "networking.k8s.io",
            "discovery.k8s.io",
            RBAC_GROUP,
        ],
        &["*"],
        WRITE_VERBS,
    )]
}

/// Cluster-wide rules every execution gets
pub fn baseline_cluster_rules() -> Vec<PolicyRule> {
    vec![
        rule(
            &[
                "apiextensions.k8s.io",
                "apiregistration.k8s.io",
                "admissionregistration.k8s.io",
                "extensions.kubext.io",
            ],
            &["*"],
            WRITE_VERBS,
        ),
        rule(&[""], &["namespaces"], &["get", "list", "watch", "create"]),
    ]
}

/// Final rule set for a Role or ClusterRole
///
/// Starts from `existing` (or `baseline` when there is none), re-adds any
/// baseline rule that went missing, then appends the declared rules the result
/// does not cover. Running it again with the same inputs returns the same set.
pub fn merge_rules(
    existing: Option<&[PolicyRule]>,
    baseline: &[PolicyRule],
    declared: &[PolicyRule],
) -> Vec<PolicyRule> {
    let mut rules = match existing {
        Some(rules) if !rules.is_empty() => rules.to_vec(),
        _ => baseline.to_vec(),
    };

    let (_, missing_baseline) = covers(&rules, baseline);
    rules.extend(missing_baseline);

    let (_, uncovered) = covers(&rules, declared);
    rules.extend(uncovered);
    rules
}

pub fn build_namespace(request: &PrerequisiteRequest) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(request.namespace.clone()),
            labels: Some(request.labels()),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn build_service_account(request: &PrerequisiteRequest) -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(request.service_account()),
            namespace: Some(request.namespace.clone()),
            labels: Some(request.labels()),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn build_role(request: &PrerequisiteRequest, rules: Vec<PolicyRule>) -> Role {
    Role {
        metadata: ObjectMeta {
            name: Some(request.role_name()),
            namespace: Some(request.namespace.clone()),
            labels: Some(request.labels()),
            ..Default::default()
        },
        rules: Some(rules),
    }
}

pub fn build_cluster_role(request: &PrerequisiteRequest, rules: Vec<PolicyRule>) -> ClusterRole {
    ClusterRole {
        metadata: ObjectMeta {
            name: Some(request.role_name()),
            labels: Some(request.labels()),
            ..Default::default()
        },
        rules: Some(rules),
        ..Default::default()
    }
}

fn subjects(request: &PrerequisiteRequest) -> Vec<Subject> {
    vec![Subject {
        kind: "ServiceAccount".to_string(),
        name: request.service_account(),
        namespace: Some(request.namespace.clone()),
        ..Default::default()
    }]
}

pub fn build_role_binding(request: &PrerequisiteRequest) -> RoleBinding {
    RoleBinding {
        metadata: ObjectMeta {
            name: Some(request.role_name()),
            namespace: Some(request.namespace.clone()),
            labels: Some(request.labels()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: RBAC_GROUP.to_string(),
            kind: "Role".to_string(),
            name: request.role_name(),
        },
        subjects: Some(subjects(request)),
    }
}

pub fn build_cluster_role_binding(request: &PrerequisiteRequest) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(request.role_name()),
            labels: Some(request.labels()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: RBAC_GROUP.to_string(),
            kind: "ClusterRole".to_string(),
            name: request.role_name(),
        },
        subjects: Some(subjects(request)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baseline_is_used_when_no_role_exists() {
        let merged = merge_rules(None, &baseline_rules(), &[]);
        assert_eq!(merged, baseline_rules());
    }

    #[test]
    fn test_declared_rules_already_covered_are_not_added() {
        let declared = vec![rule(&["apps"], &["deployments"], &["create", "patch"])];
        let merged = merge_rules(None, &baseline_rules(), &declared);
        assert_eq!(merged, baseline_rules());
    }

    #[test]
    fn test_uncovered_declared_rules_are_appended() {
        let declared = vec![rule(&["monitoring.coreos.com"], &["servicemonitors"], &["create"])];
        let merged = merge_rules(None, &baseline_rules(), &declared);

        assert_eq!(merged.len(), baseline_rules().len() + 1);
        assert!(covers(&merged, &declared).0);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let declared = vec![
            rule(&["monitoring.coreos.com"], &["servicemonitors", "prometheusrules"], &["get", "create"]),
            rule(&["cert-manager.io"], &["certificates"], &["*"]),
        ];

        let first = merge_rules(None, &baseline_cluster_rules(), &declared);
        let second = merge_rules(Some(&first), &baseline_cluster_rules(), &declared);
        assert_eq!(first, second);
    }

    #[test]
    fn test_existing_rules_are_never_dropped() {
        let previous = vec![rule(&["example.io"], &["widgets"], &["get"])];
        let merged = merge_rules(Some(&previous), &baseline_rules(), &[]);

        assert!(covers(&merged, &previous).0);
        assert!(covers(&merged, &baseline_rules()).0);
    }

    #[test]
    fn test_bindings_reference_execution_service_account() {
        let request = PrerequisiteRequest {
            extension: "gatekeeper".into(),
            release: "gatekeeper".into(),
            namespace: "extension-gatekeeper".into(),
            permissions: Permissions::default(),
        };

        let binding = build_cluster_role_binding(&request);
        let subject = &binding.subjects.unwrap()[0];
        assert_eq!(subject.name, "gatekeeper-executor");
        assert_eq!(subject.namespace.as_deref(), Some("extension-gatekeeper"));
        assert_eq!(binding.role_ref.kind, "ClusterRole");
        assert_eq!(binding.role_ref.name, "kubext:gatekeeper:executor");
    }
}
