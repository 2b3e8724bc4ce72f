use super::leader::*;
use chrono::{DateTime, TimeZone, Utc};
use k8s_openapi::api::coordination::v1::LeaseSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use std::collections::HashMap;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 4, 12, 0, 0).unwrap()
}

fn config_from(vars: &[(&str, &str)], default_namespace: &str) -> LeaderConfig {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    LeaderConfig::from_lookup(|name| vars.get(name).cloned(), default_namespace)
}

fn replica(holder: &str) -> LeaderConfig {
    config_from(&[("POD_NAME", holder)], "kubext-system")
}

fn held_by(holder: &str, renewed_secs_ago: i64) -> LeaseSpec {
    LeaseSpec {
        holder_identity: Some(holder.to_string()),
        lease_duration_seconds: Some(15),
        acquire_time: Some(MicroTime(now() - chrono::Duration::minutes(10))),
        renew_time: Some(MicroTime(now() - chrono::Duration::seconds(renewed_secs_ago))),
        lease_transitions: Some(3),
        ..Default::default()
    }
}

#[test]
fn test_leader_state_is_shared_between_clones() {
    let state = LeaderState::new();
    let reconciler_view = state.clone();
    assert!(!reconciler_view.is_leader());

    state.set_leader(true);
    assert!(reconciler_view.is_leader());

    state.set_leader(false);
    assert!(!reconciler_view.is_leader());
}

#[test]
fn test_pod_identity_and_namespace() {
    let config = config_from(
        &[
            ("POD_NAME", "kubext-7d9f-abcde"),
            ("HOSTNAME", "node-host"),
            ("POD_NAMESPACE", "extensions"),
        ],
        "kubext-system",
    );

    assert_eq!(config.holder_id, "kubext-7d9f-abcde");
    assert_eq!(config.lease_namespace, "extensions");
    assert_eq!(config.lease_name, DEFAULT_LEASE_NAME);
    assert_eq!(config.lease_duration_seconds, 15);
    assert_eq!(config.renew_interval, DEFAULT_RENEW_INTERVAL);
}

#[test]
fn test_hostname_identity_and_controller_namespace() {
    let config = config_from(&[("HOSTNAME", "kubext-0"), ("POD_NAME", "")], "platform");

    assert_eq!(config.holder_id, "kubext-0");
    assert_eq!(config.lease_namespace, "platform");
}

#[test]
fn test_random_identity_without_pod_env() {
    let first = config_from(&[], "kubext-system");
    let second = config_from(&[], "kubext-system");

    assert!(first.holder_id.starts_with("kubext-"));
    assert_eq!(first.holder_id.len(), "kubext-".len() + 36);
    assert_ne!(first.holder_id, second.holder_id);
}

#[test]
fn test_renew_interval_leaves_room_before_expiry() {
    assert!(DEFAULT_RENEW_INTERVAL * 2 < DEFAULT_LEASE_TTL);
}

#[test]
fn test_lease_expiry_boundary() {
    let ttl = Some(15);
    let renewed = |secs: i64| MicroTime(now() - chrono::Duration::seconds(secs));

    assert!(!is_lease_expired(Some(&renewed(5)), ttl, now()));
    assert!(!is_lease_expired(Some(&renewed(15)), ttl, now()));
    assert!(is_lease_expired(Some(&renewed(16)), ttl, now()));
}

#[test]
fn test_incomplete_lease_counts_as_expired() {
    let renewed = MicroTime(now());

    assert!(is_lease_expired(None, Some(15), now()));
    assert!(is_lease_expired(Some(&renewed), None, now()));
    assert!(is_lease_expired(None, None, now()));
}

#[test]
fn test_live_lease_of_other_replica_is_left_alone() {
    let current = held_by("kubext-0", 3);

    assert!(renewed_spec(Some(&current), &replica("kubext-1"), now()).is_none());
}

#[test]
fn test_holder_renews_without_new_transition() {
    let current = held_by("kubext-0", 3);

    let next = renewed_spec(Some(&current), &replica("kubext-0"), now()).unwrap();

    assert_eq!(next.renew_time, Some(MicroTime(now())));
    assert_eq!(next.acquire_time, current.acquire_time);
    assert_eq!(next.lease_transitions, Some(3));
}

#[test]
fn test_expired_lease_is_taken_over() {
    let current = held_by("kubext-0", 60);

    let next = renewed_spec(Some(&current), &replica("kubext-1"), now()).unwrap();

    assert_eq!(next.holder_identity.as_deref(), Some("kubext-1"));
    assert_eq!(next.acquire_time, Some(MicroTime(now())));
    assert_eq!(next.lease_transitions, Some(4));
}

#[test]
fn test_lease_without_spec_is_claimed() {
    let next = renewed_spec(None, &replica("kubext-1"), now()).unwrap();

    assert_eq!(next.holder_identity.as_deref(), Some("kubext-1"));
    assert_eq!(next.lease_duration_seconds, Some(15));
    assert_eq!(next.lease_transitions, Some(1));
}
