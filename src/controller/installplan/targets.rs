use crate::crd::cluster::Cluster;
use crate::crd::installplan::Placement;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet};

/// Member clusters selected by a placement
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TargetSet {
    /// Selected and eligible; these get a branch
    pub schedulable: BTreeSet<String>,
    /// Selected but temporarily not eligible; existing branches are left alone
    pub held: BTreeSet<String>,
}

/// Resolve `placement` against the registered clusters
///
/// Explicit names win over the selector; names without a Cluster are skipped.
/// Deleting clusters are neither schedulable nor held.
pub fn resolve_targets(placement: &Placement, clusters: &[Cluster]) -> TargetSet {
    let selected: Vec<&Cluster> = if !placement.clusters.is_empty() {
        placement
            .clusters
            .iter()
            .filter_map(|name| clusters.iter().find(|c| c.name_any() == *name))
            .collect()
    } else if let Some(selector) = &placement.cluster_selector {
        clusters
            .iter()
            .filter(|c| selector_matches(selector, c.labels()))
            .collect()
    } else {
        Vec::new()
    };

    let mut targets = TargetSet::default();
    for cluster in selected {
        if cluster.is_schedulable() {
            targets.schedulable.insert(cluster.name_any());
        } else if !cluster.is_deleting() {
            targets.held.insert(cluster.name_any());
        }
    }
    targets
}

/// Kubernetes label selector semantics
///
/// All `matchLabels` and all `matchExpressions` must hold. An empty selector
/// matches everything. Unknown operators never match.
pub fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    let labels_match = selector
        .match_labels
        .as_ref()
        .map(|required| required.iter().all(|(k, v)| labels.get(k) == Some(v)))
        .unwrap_or(true);

    labels_match
        && selector
            .match_expressions
            .as_deref()
            .unwrap_or_default()
            .iter()
            .all(|expr| expression_matches(expr, labels))
}

fn expression_matches(expr: &LabelSelectorRequirement, labels: &BTreeMap<String, String>) -> bool {
    let value = labels.get(&expr.key);
    let values = expr.values.as_deref().unwrap_or_default();

    match expr.operator.as_str() {
        "In" => value.is_some_and(|v| values.contains(v)),
        "NotIn" => !value.is_some_and(|v| values.contains(v)),
        "Exists" => value.is_some(),
        "DoesNotExist" => value.is_none(),
        _ => false,
    }
}
