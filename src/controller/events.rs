//! Kubernetes Events for InstallPlans
//!
//! Events are fire-and-forget: a failed publish is logged and never fails a
//! reconcile.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Name shown as the reporting component of every Event
pub const CONTROLLER_NAME: &str = "kubext-installplan-controller";

#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on `resource_ref`
    ///
    /// # Arguments
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason, see [`reasons`]
    /// * `action` - What the controller did, see [`actions`]
    /// * `note` - Human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publishes through `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: CONTROLLER_NAME.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Records published events for assertions
#[cfg(test)]
#[allow(clippy::expect_used)]
#[derive(Default)]
pub struct MockEventPublisher {
    events: std::sync::Mutex<Vec<(bool, String)>>,
}

#[cfg(test)]
#[allow(clippy::expect_used)]
impl MockEventPublisher {
    pub fn reasons(&self) -> Vec<String> {
        self.events
            .lock()
            .expect("MockEventPublisher lock poisoned")
            .iter()
            .map(|(_, reason)| reason.clone())
            .collect()
    }

    pub fn warnings(&self) -> usize {
        self.events
            .lock()
            .expect("MockEventPublisher lock poisoned")
            .iter()
            .filter(|(warning, _)| *warning)
            .count()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
#[async_trait]
impl EventPublisher for MockEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
        self.events
            .lock()
            .expect("MockEventPublisher lock poisoned")
            .push((matches!(type_, EventType::Warning), reason.to_string()));
    }
}

/// Event reasons, shown in the REASON column of `kubectl get events`
pub mod reasons {
    pub const INSTALL_STARTED: &str = "InstallStarted";
    pub const UPGRADE_STARTED: &str = "UpgradeStarted";
    pub const UNINSTALL_STARTED: &str = "UninstallStarted";
    pub const DEPLOYED: &str = "Deployed";
    pub const UNINSTALLED: &str = "Uninstalled";
    pub const INSTALL_FAILED: &str = "InstallFailed";
    pub const UPGRADE_FAILED: &str = "UpgradeFailed";
    pub const UNINSTALL_FAILED: &str = "UninstallFailed";
    pub const EXECUTION_DEADLINE_EXCEEDED: &str = "ExecutionDeadlineExceeded";
    pub const FORCE_DELETED: &str = "ForceDeleted";
}

pub mod actions {
    pub const INSTALL: &str = "Install";
    pub const UPGRADE: &str = "Upgrade";
    pub const UNINSTALL: &str = "Uninstall";
    pub const SYNC: &str = "Sync";
}
