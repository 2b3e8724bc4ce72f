//! Lease-based leader election
//!
//! Only the holder of the `coordination.k8s.io/v1` Lease reconciles; other
//! replicas keep their watches warm and skip work. Acquire and renew use the
//! Lease resourceVersion, so two replicas racing for an expired lease cannot
//! both win: the loser gets 409 Conflict.

use crate::server::shutdown::ShutdownSignal;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_LEASE_NAME: &str = "kubext-controller-leader";
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(15);
pub const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum LeaderElectionError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("lease {0} has no resourceVersion")]
    MissingResourceVersion(String),
}

/// Whether this replica currently holds the lease
#[derive(Debug, Clone, Default)]
pub struct LeaderState {
    leader: Arc<AtomicBool>,
}

impl LeaderState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct LeaderConfig {
    pub holder_id: String,
    pub lease_name: String,
    pub lease_namespace: String,
    pub lease_duration_seconds: i32,
    pub renew_interval: Duration,
}

impl LeaderConfig {
    /// Read identity and lease namespace from the pod environment
    pub fn from_env(default_namespace: &str) -> Self {
        Self::from_lookup(|name| std::env::var(name).ok(), default_namespace)
    }

    /// Holder identity is `POD_NAME`, then `HOSTNAME`, then `kubext-<uuid>`;
    /// the lease lives in `POD_NAMESPACE`, else `default_namespace`
    pub fn from_lookup<F>(lookup: F, default_namespace: &str) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let present = |name: &str| lookup(name).filter(|v| !v.is_empty());
        let holder_id = present("POD_NAME")
            .or_else(|| present("HOSTNAME"))
            .unwrap_or_else(|| format!("kubext-{}", uuid::Uuid::new_v4()));
        let lease_namespace =
            present("POD_NAMESPACE").unwrap_or_else(|| default_namespace.to_string());

        Self {
            holder_id,
            lease_name: DEFAULT_LEASE_NAME.to_string(),
            lease_namespace,
            lease_duration_seconds: DEFAULT_LEASE_TTL.as_secs() as i32,
            renew_interval: DEFAULT_RENEW_INTERVAL,
        }
    }
}

/// A lease without a renew time or duration counts as expired
pub fn is_lease_expired(
    renew_time: Option<&MicroTime>,
    lease_duration_seconds: Option<i32>,
    now: DateTime<Utc>,
) -> bool {
    match (renew_time, lease_duration_seconds) {
        (Some(renewed), Some(duration)) => {
            now > renewed.0 + chrono::Duration::seconds(duration as i64)
        }
        _ => true,
    }
}

fn holds_lease(spec: Option<&LeaseSpec>, holder_id: &str) -> bool {
    spec.and_then(|s| s.holder_identity.as_deref()) == Some(holder_id)
}

/// Lease spec to write for this replica, or None while another holder is live
///
/// Renewal only moves `renewTime`; a takeover also resets `acquireTime` and
/// bumps `leaseTransitions`.
pub fn renewed_spec(
    current: Option<&LeaseSpec>,
    config: &LeaderConfig,
    now: DateTime<Utc>,
) -> Option<LeaseSpec> {
    let current = current.cloned().unwrap_or_default();
    let held_by_us = holds_lease(Some(&current), &config.holder_id);
    if !held_by_us
        && !is_lease_expired(
            current.renew_time.as_ref(),
            current.lease_duration_seconds,
            now,
        )
    {
        return None;
    }

    let mut next = current.clone();
    if !held_by_us {
        next.holder_identity = Some(config.holder_id.clone());
        next.acquire_time = Some(MicroTime(now));
        next.lease_transitions = Some(current.lease_transitions.unwrap_or(0) + 1);
    }
    next.lease_duration_seconds = Some(config.lease_duration_seconds);
    next.renew_time = Some(MicroTime(now));
    Some(next)
}

/// Try to acquire or renew the lease once
///
/// # Returns
/// true if this replica holds the lease afterwards
async fn try_acquire_or_renew(
    api: &Api<Lease>,
    config: &LeaderConfig,
) -> Result<bool, LeaderElectionError> {
    let now = Utc::now();

    let Some(existing) = api.get_opt(&config.lease_name).await? else {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(config.lease_name.clone()),
                namespace: Some(config.lease_namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(config.holder_id.clone()),
                lease_duration_seconds: Some(config.lease_duration_seconds),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        };
        return match api.create(&PostParams::default(), &lease).await {
            Ok(_) => {
                info!(holder = %config.holder_id, "Created leader lease");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        };
    };

    if existing.metadata.resource_version.is_none() {
        return Err(LeaderElectionError::MissingResourceVersion(
            config.lease_name.clone(),
        ));
    }

    let Some(next) = renewed_spec(existing.spec.as_ref(), config, now) else {
        return Ok(false);
    };
    let held_by_us = holds_lease(existing.spec.as_ref(), &config.holder_id);
    let mut updated = existing;
    updated.spec = Some(next);

    match api
        .replace(&config.lease_name, &PostParams::default(), &updated)
        .await
    {
        Ok(_) => {
            if !held_by_us {
                info!(holder = %config.holder_id, "Took over expired leader lease");
            }
            Ok(true)
        }
        Err(kube::Error::Api(e)) if e.code == 409 => {
            debug!(holder = %config.holder_id, "Lease changed concurrently");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

/// Keep trying to hold the lease until shutdown
///
/// `state` flips as leadership is gained or lost. Errors are logged and count
/// as not holding the lease.
pub async fn run_leader_election(
    client: Client,
    config: LeaderConfig,
    state: LeaderState,
    mut shutdown: ShutdownSignal,
) {
    let api: Api<Lease> = Api::namespaced(client, &config.lease_namespace);

    loop {
        let leader = match try_acquire_or_renew(&api, &config).await {
            Ok(leader) => leader,
            Err(e) => {
                warn!(holder = %config.holder_id, error = %e, "Leader election attempt failed");
                false
            }
        };

        if leader != state.is_leader() {
            if leader {
                info!(holder = %config.holder_id, "Became leader");
            } else {
                warn!(holder = %config.holder_id, "Lost leadership");
            }
            state.set_leader(leader);
        }

        tokio::select! {
            _ = tokio::time::sleep(config.renew_interval) => {}
            _ = shutdown.wait() => {
                state.set_leader(false);
                info!(holder = %config.holder_id, "Leader election stopped");
                return;
            }
        }
    }
}
