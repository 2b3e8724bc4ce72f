#![allow(clippy::unwrap_used)] // Tests can use unwrap for brevity
#![allow(clippy::expect_used)] // Tests can use expect for better error messages

use super::*;
use chrono::{Duration, TimeZone};
use kube::CustomResourceExt;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()
}

#[test]
fn test_installplan_deserialize_from_yaml() {
    let yaml = r#"
apiVersion: kubext.io/v1alpha1
kind: InstallPlan
metadata:
  name: gatekeeper
spec:
  extension:
    name: gatekeeper
    version: 1.2.0
  config: |
    replicas: 2
  clusterScheduling:
    placement:
      clusterSelector:
        matchLabels:
          env: prod
    overrides:
      edge-1: "replicas: 1"
"#;

    let plan: InstallPlan = serde_yaml::from_str(yaml).expect("Failed to deserialize InstallPlan");

    assert_eq!(plan.spec.extension.name, "gatekeeper");
    assert_eq!(plan.spec.extension.version, "1.2.0");
    assert!(plan.spec.enabled, "enabled should default to true");
    let scheduling = plan.spec.cluster_scheduling.unwrap();
    assert!(scheduling.placement.clusters.is_empty());
    assert!(scheduling.placement.cluster_selector.is_some());
    assert_eq!(scheduling.overrides.get("edge-1").unwrap(), "replicas: 1");
}

#[test]
fn test_initial_state_serializes_as_empty_string() {
    let status = InstallationStatus::default();
    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["state"], "");

    let parsed: InstallationStatus = serde_json::from_value(serde_json::json!({})).unwrap();
    assert_eq!(parsed.state, InstallationState::Initial);
}

#[test]
fn test_installed_and_upgraded_collapse_to_deployed() {
    assert_eq!(
        InstallationState::Installed.collapsed(),
        InstallationState::Deployed
    );
    assert_eq!(
        InstallationState::Upgraded.collapsed(),
        InstallationState::Deployed
    );
    assert_eq!(
        InstallationState::Upgrading.collapsed(),
        InstallationState::Upgrading
    );
}

#[test]
fn test_state_history_never_exceeds_capacity() {
    let mut history = StateHistory::default();
    let states = [InstallationState::Installing, InstallationState::Deployed];

    for i in 0..(MAX_STATE_NUM * 3) {
        let at = t0() + Duration::seconds(i as i64);
        assert!(history.record(states[i % 2], at));
        assert!(history.iter().count() <= MAX_STATE_NUM);
    }

    assert_eq!(history.iter().count(), MAX_STATE_NUM);
    // Oldest entries were evicted, newest is last
    let latest = history.latest().unwrap();
    assert_eq!(
        latest.time().unwrap(),
        t0() + Duration::seconds((MAX_STATE_NUM * 3 - 1) as i64)
    );
}

#[test]
fn test_state_history_rejects_earlier_timestamp() {
    let mut history = StateHistory::default();
    assert!(history.record(InstallationState::Preparing, t0()));
    assert!(!history.record(
        InstallationState::Installing,
        t0() - Duration::seconds(1)
    ));
    assert_eq!(history.iter().count(), 1);

    // Equal timestamps are accepted
    assert!(history.record(InstallationState::Installing, t0()));
    assert_eq!(history.iter().count(), 2);
}

#[test]
fn test_state_history_is_time_ordered() {
    let mut history = StateHistory::default();
    for i in 0..25 {
        // Every third attempt goes back in time and must be dropped
        let offset = if i % 3 == 0 { -100 } else { i };
        history.record(InstallationState::Installing, t0() + Duration::seconds(offset));
    }

    let times: Vec<_> = history.iter().map(|e| e.time().unwrap()).collect();
    assert!(times.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn test_state_history_truncates_oversized_list_on_read() {
    let entries: Vec<serde_json::Value> = (0..15)
        .map(|i| {
            serde_json::json!({
                "state": "Installing",
                "lastTransitionTime": (t0() + Duration::seconds(i)).to_rfc3339(),
            })
        })
        .collect();

    let history: StateHistory = serde_json::from_value(serde_json::Value::Array(entries)).unwrap();

    assert_eq!(history.iter().count(), MAX_STATE_NUM);
    assert_eq!(
        history.iter().next().unwrap().time().unwrap(),
        t0() + Duration::seconds(5)
    );
}

#[test]
fn test_force_delete_annotation() {
    let mut plan = InstallPlan::new(
        "demo",
        InstallPlanSpec {
            extension: ExtensionRef {
                name: "demo".into(),
                version: "1.0.0".into(),
            },
            config: String::new(),
            enabled: true,
            cluster_scheduling: None,
        },
    );
    assert!(!plan.is_force_delete());

    plan.metadata.annotations = Some(
        [(FORCE_DELETE_ANNOTATION.to_string(), "true".to_string())]
            .into_iter()
            .collect(),
    );
    assert!(plan.is_force_delete());
}

#[test]
fn test_installplan_crd_is_cluster_scoped() {
    let crd = InstallPlan::crd();
    assert_eq!(crd.spec.group, "kubext.io");
    assert_eq!(crd.spec.scope, "Cluster");
    assert_eq!(crd.spec.names.kind, "InstallPlan");
}
