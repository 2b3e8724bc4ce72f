use crate::crd::installplan::{
    Condition, ConditionStatus, InstallationState, InstallationStatus,
};
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

pub const CONDITION_PREPARED: &str = "Prepared";
pub const CONDITION_INSTALLED: &str = "Installed";
pub const CONDITION_UPGRADED: &str = "Upgraded";
pub const CONDITION_UNINSTALLED: &str = "Uninstalled";

/// Reason set when the watchdog fails a stuck execution
pub const REASON_EXECUTION_DEADLINE_EXCEEDED: &str = "ExecutionDeadlineExceeded";

#[derive(Debug, Error)]
pub enum ValuesError {
    #[error("invalid values YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("values cannot be normalized: {0}")]
    Json(#[from] serde_json::Error),
}

/// Move a branch to `state`
///
/// The transition is committed only when the recorded state changes and `now`
/// is not earlier than the latest history entry. `Installed`/`Upgraded` are
/// recorded as `Deployed` but still select their own condition.
///
/// # Returns
/// true if the branch changed
pub fn update_state(
    status: &mut InstallationStatus,
    state: InstallationState,
    message: &str,
    now: DateTime<Utc>,
) -> bool {
    let recorded = state.collapsed();
    if status.state == recorded {
        return false;
    }
    if !status.state_history.record(recorded, now) {
        return false;
    }
    status.state = recorded;

    if let Some(condition) = condition_for(state, message, now) {
        set_condition(&mut status.conditions, condition);
    }
    true
}

/// Insert or replace the condition with the same type
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => *existing = condition,
        None => conditions.push(condition),
    }
}

/// Condition describing `state`, if the state has one
pub fn condition_for(
    state: InstallationState,
    message: &str,
    now: DateTime<Utc>,
) -> Option<Condition> {
    use InstallationState::*;

    let (type_, status) = match state {
        Preparing => (CONDITION_PREPARED, ConditionStatus::Unknown),
        Installing => (CONDITION_INSTALLED, ConditionStatus::Unknown),
        Installed => (CONDITION_INSTALLED, ConditionStatus::True),
        InstallFailed => (CONDITION_INSTALLED, ConditionStatus::False),
        Upgrading => (CONDITION_UPGRADED, ConditionStatus::Unknown),
        Upgraded => (CONDITION_UPGRADED, ConditionStatus::True),
        UpgradeFailed => (CONDITION_UPGRADED, ConditionStatus::False),
        Uninstalling => (CONDITION_UNINSTALLED, ConditionStatus::Unknown),
        Uninstalled => (CONDITION_UNINSTALLED, ConditionStatus::True),
        UninstallFailed => (CONDITION_UNINSTALLED, ConditionStatus::False),
        Initial | Deployed => return None,
    };

    Some(Condition {
        type_: type_.to_string(),
        status,
        reason: state.as_str().to_string(),
        message: message.to_string(),
        last_transition_time: now.to_rfc3339(),
    })
}

/// Condition recorded once prerequisites exist in the target
pub fn prepared_condition(now: DateTime<Utc>) -> Condition {
    Condition {
        type_: CONDITION_PREPARED.to_string(),
        status: ConditionStatus::True,
        reason: "PrerequisitesReady".to_string(),
        message: String::new(),
        last_transition_time: now.to_rfc3339(),
    }
}

/// Check whether an execution has been running longer than `deadline`
///
/// Only branches waiting on a job are considered. The start is the latest
/// `stateHistory` entry.
pub fn is_execution_deadline_exceeded(
    status: &InstallationStatus,
    deadline: Duration,
    now: DateTime<Utc>,
) -> bool {
    if !matches!(
        status.state,
        InstallationState::Installing
            | InstallationState::Upgrading
            | InstallationState::Uninstalling
    ) {
        return false;
    }

    let Some(started) = status.state_history.latest().and_then(|e| e.time()) else {
        return false;
    };

    let elapsed = now.signed_duration_since(started);
    elapsed.num_seconds() > deadline.as_secs() as i64
}

/// State a stuck execution is failed into
pub fn failure_state_for(state: InstallationState) -> InstallationState {
    match state {
        InstallationState::Upgrading => InstallationState::UpgradeFailed,
        InstallationState::Uninstalling => InstallationState::UninstallFailed,
        _ => InstallationState::InstallFailed,
    }
}

/// Deep-merge YAML `overlay` onto `base`
///
/// Mappings merge key by key; any other overlay value replaces the base value.
/// Empty documents are treated as empty mappings.
pub fn merge_values(base: &str, overlay: &str) -> Result<String, ValuesError> {
    if overlay.trim().is_empty() {
        return Ok(base.to_string());
    }
    if base.trim().is_empty() {
        return Ok(overlay.to_string());
    }

    let mut merged: serde_yaml::Value = serde_yaml::from_str(base)?;
    let overlay: serde_yaml::Value = serde_yaml::from_str(overlay)?;
    merge_yaml(&mut merged, overlay);

    Ok(serde_yaml::to_string(&merged)?)
}

fn merge_yaml(base: &mut serde_yaml::Value, overlay: serde_yaml::Value) {
    match (base, overlay) {
        (serde_yaml::Value::Mapping(base), serde_yaml::Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_yaml(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Canonical form of a values document
///
/// Parses YAML and re-encodes as JSON with sorted keys, so formatting, key
/// order and comments do not matter.
pub fn normalize_values(values: &str) -> Result<String, ValuesError> {
    let parsed: serde_yaml::Value = if values.trim().is_empty() {
        serde_yaml::Value::Null
    } else {
        serde_yaml::from_str(values)?
    };
    let json = serde_json::to_value(parsed)?;
    Ok(serde_json::to_string(&json)?)
}

/// Content hash of the values passed to an execution
///
/// FNV-1a over the normalized document. Unparseable values hash their raw
/// trimmed text so a broken config still produces a stable hash.
pub fn compute_config_hash(values: &str) -> String {
    let canonical = normalize_values(values).unwrap_or_else(|_| values.trim().to_string());

    // FNV-1a (deterministic across processes, unlike DefaultHasher/SipHash)
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in canonical.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }

    format!("{hash:016x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap()
    }

    fn at(state: InstallationState, secs: i64) -> InstallationStatus {
        let mut status = InstallationStatus::default();
        update_state(&mut status, state, "", t0() + chrono::Duration::seconds(secs));
        status
    }

    #[test]
    fn test_config_hash_ignores_formatting() {
        let compact = "replicas: 2\nimage: {tag: v1, pull: Always}\n";
        let reformatted = "# tuned for prod\nimage:\n  pull: Always\n  tag: v1\nreplicas: 2\n";

        assert_eq!(compute_config_hash(compact), compute_config_hash(reformatted));
        assert_eq!(compute_config_hash(compact), compute_config_hash(compact));
    }

    #[test]
    fn test_config_hash_tracks_values() {
        assert_ne!(
            compute_config_hash("replicas: 2\n"),
            compute_config_hash("replicas: 3\n")
        );
        assert_ne!(compute_config_hash(""), compute_config_hash("replicas: 2\n"));
        assert_eq!(compute_config_hash("replicas: 2").len(), 16);
    }

    #[test]
    fn test_normalize_rejects_broken_yaml() {
        assert!(normalize_values("replicas: [1, 2").is_err());
        assert_eq!(normalize_values("").unwrap(), "null");
    }

    #[test]
    fn test_merge_values_merges_mappings_and_replaces_the_rest() {
        let base = "image:\n  repo: kubext/app\n  tag: v1\nports: [80, 443]\n";
        let overlay = "image:\n  tag: v2\nports: [8080]\nextra: true\n";

        let merged = merge_values(base, overlay).unwrap();

        let expected = "image: {repo: kubext/app, tag: v2}\nports: [8080]\nextra: true\n";
        assert_eq!(
            normalize_values(&merged).unwrap(),
            normalize_values(expected).unwrap()
        );
    }

    #[test]
    fn test_merge_values_with_empty_side() {
        assert_eq!(merge_values("a: 1\n", "  ").unwrap(), "a: 1\n");
        assert_eq!(merge_values("", "b: 2\n").unwrap(), "b: 2\n");
        assert!(merge_values("a: 1\n", "b: [").is_err());
    }

    #[test]
    fn test_set_condition_keeps_one_per_type() {
        let mut conditions = Vec::new();
        let first = condition_for(InstallationState::Installing, "started", t0()).unwrap();
        let second = condition_for(InstallationState::InstallFailed, "job failed", t0()).unwrap();

        set_condition(&mut conditions, first);
        set_condition(&mut conditions, second);
        set_condition(&mut conditions, prepared_condition(t0()));

        assert_eq!(conditions.len(), 2);
        let installed = conditions
            .iter()
            .find(|c| c.type_ == CONDITION_INSTALLED)
            .unwrap();
        assert_eq!(installed.status, ConditionStatus::False);
        assert_eq!(installed.message, "job failed");
    }

    #[test]
    fn test_installed_and_upgraded_both_record_deployed() {
        let installed = at(InstallationState::Installed, 0);
        let upgraded = at(InstallationState::Upgraded, 0);

        assert_eq!(installed.state, InstallationState::Deployed);
        assert_eq!(upgraded.state, InstallationState::Deployed);
        assert_eq!(installed.conditions[0].type_, CONDITION_INSTALLED);
        assert_eq!(upgraded.conditions[0].type_, CONDITION_UPGRADED);
        assert_eq!(upgraded.conditions[0].status, ConditionStatus::True);
    }

    #[test]
    fn test_update_state_rejects_same_state_and_earlier_time() {
        let mut status = at(InstallationState::Installing, 10);

        assert!(!update_state(
            &mut status,
            InstallationState::Installing,
            "",
            t0() + chrono::Duration::seconds(20)
        ));
        assert!(!update_state(&mut status, InstallationState::Installed, "", t0()));
        assert_eq!(status.state, InstallationState::Installing);

        assert!(update_state(
            &mut status,
            InstallationState::Installed,
            "",
            t0() + chrono::Duration::seconds(10)
        ));
        assert_eq!(status.state, InstallationState::Deployed);
    }

    #[test]
    fn test_deadline_boundary() {
        let status = at(InstallationState::Upgrading, 0);
        let deadline = Duration::from_secs(600);

        assert!(!is_execution_deadline_exceeded(
            &status,
            deadline,
            t0() + chrono::Duration::seconds(600)
        ));
        assert!(is_execution_deadline_exceeded(
            &status,
            deadline,
            t0() + chrono::Duration::seconds(601)
        ));
    }

    #[test]
    fn test_deadline_ignores_settled_branches() {
        let deployed = at(InstallationState::Installed, 0);
        let later = t0() + chrono::Duration::hours(5);

        assert!(!is_execution_deadline_exceeded(&deployed, Duration::from_secs(60), later));
        assert!(!is_execution_deadline_exceeded(
            &InstallationStatus::default(),
            Duration::from_secs(60),
            later
        ));
    }

    #[test]
    fn test_stuck_execution_fails_into_matching_state() {
        use InstallationState::*;
        assert_eq!(failure_state_for(Installing), InstallFailed);
        assert_eq!(failure_state_for(Upgrading), UpgradeFailed);
        assert_eq!(failure_state_for(Uninstalling), UninstallFailed);
    }
}
