use super::*;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;

fn labels(pairs: &[(&str, &str)]) -> Option<BTreeMap<String, String>> {
    Some(
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    )
}

#[test]
fn test_job_maps_to_its_plan() {
    let job = Job {
        metadata: ObjectMeta {
            name: Some("demo-install-1a2b3c4d".to_string()),
            labels: labels(&[(INSTALLPLAN_LABEL, "demo")]),
            ..Default::default()
        },
        ..Default::default()
    };

    let plan = plan_for_job(job).expect("mapped to a plan");
    assert_eq!(plan.name, "demo");
    assert_eq!(plan.namespace, None);
}

#[test]
fn test_unlabelled_job_is_ignored() {
    let job = Job {
        metadata: ObjectMeta {
            name: Some("unrelated".to_string()),
            ..Default::default()
        },
        ..Default::default()
    };

    assert!(plan_for_job(job).is_none());
}

#[test]
fn test_release_secret_maps_to_plan_of_same_name() {
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some("sh.helm.release.v1.demo.v2".to_string()),
            labels: labels(&[("owner", "helm"), ("name", "demo"), ("version", "2")]),
            ..Default::default()
        },
        ..Default::default()
    };

    let plan = plan_for_release(secret).expect("mapped to a plan");
    assert_eq!(plan.name, "demo");
}
