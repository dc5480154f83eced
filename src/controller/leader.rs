//! Lease based leader election
//!
//! Replicas race for a `coordination.k8s.io/v1` Lease named after the
//! provisioner type. Only the holder runs the controller loop; it renews the
//! lease every retry period and stops once it fails to do so within the
//! renew deadline. Writes carry the lease's resource version, so two
//! replicas taking an expired lease at once cannot both succeed.

use crate::error::{Error, Result};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use k8s_openapi::chrono::{self, DateTime, Utc};
use kube::api::{Api, PostParams};
use kube::Client;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Where the lease lives and how it is timed
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    pub name: String,
    pub namespace: String,
    /// Holder identity written into the lease, unique per replica
    pub identity: String,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl LeaseConfig {
    pub fn validate(&self) -> Result<()> {
        if self.identity.is_empty() {
            return Err(Error::Configuration(
                "Leader election identity must not be empty".into(),
            ));
        }
        if self.lease_duration <= self.renew_deadline {
            return Err(Error::Configuration(format!(
                "Lease duration {:?} must be greater than renew deadline {:?}",
                self.lease_duration, self.renew_deadline
            )));
        }
        if self.renew_deadline <= self.retry_period {
            return Err(Error::Configuration(format!(
                "Renew deadline {:?} must be greater than retry period {:?}",
                self.renew_deadline, self.retry_period
            )));
        }
        Ok(())
    }
}

/// Lease object name for a provisioner type such as `example.com/targetd`
pub fn lease_name(provisioner_type: &str) -> String {
    provisioner_type.replace('/', "-").to_lowercase()
}

/// Whether `identity` may take or renew the lease described by `spec` at `now`
pub fn can_acquire(spec: &LeaseSpec, identity: &str, now: DateTime<Utc>) -> bool {
    match spec.holder_identity.as_deref() {
        None | Some("") => true,
        Some(holder) if holder == identity => true,
        Some(_) => {
            let Some(MicroTime(renewed)) = &spec.renew_time else {
                return true;
            };
            let valid_for = chrono::Duration::seconds(spec.lease_duration_seconds.unwrap_or(0).into());
            *renewed + valid_for < now
        }
    }
}

/// Lease spec after `identity` acquired or renewed it at `now`
pub fn claim_lease(
    current: Option<&LeaseSpec>,
    identity: &str,
    lease_duration: Duration,
    now: DateTime<Utc>,
) -> LeaseSpec {
    let current = current.cloned().unwrap_or_default();
    let renewing = current.holder_identity.as_deref() == Some(identity);
    let taken_over = matches!(current.holder_identity.as_deref(), Some(holder) if !holder.is_empty() && holder != identity);
    let transitions = current.lease_transitions.unwrap_or(0);

    LeaseSpec {
        holder_identity: Some(identity.to_string()),
        lease_duration_seconds: Some(i32::try_from(lease_duration.as_secs()).unwrap_or(i32::MAX)),
        acquire_time: if renewing {
            current.acquire_time
        } else {
            Some(MicroTime(now))
        },
        renew_time: Some(MicroTime(now)),
        lease_transitions: Some(if taken_over {
            transitions.saturating_add(1)
        } else {
            transitions
        }),
        ..Default::default()
    }
}

/// Holds the provisioner's lease
pub struct LeaderElection {
    api: Api<Lease>,
    config: LeaseConfig,
}

impl LeaderElection {
    pub fn new(client: Client, config: LeaseConfig) -> Self {
        Self {
            api: Api::namespaced(client, &config.namespace),
            config,
        }
    }

    /// One acquire or renew attempt; `true` when the lease is ours afterwards
    pub async fn try_acquire_or_renew(&self) -> Result<bool> {
        let now = Utc::now();
        let identity = &self.config.identity;

        let result = match self.api.get_opt(&self.config.name).await? {
            None => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(self.config.name.clone()),
                        namespace: Some(self.config.namespace.clone()),
                        ..Default::default()
                    },
                    spec: Some(claim_lease(None, identity, self.config.lease_duration, now)),
                };
                self.api.create(&PostParams::default(), &lease).await
            }
            Some(mut lease) => {
                let spec = lease.spec.take().unwrap_or_default();
                if !can_acquire(&spec, identity, now) {
                    debug!(
                        "Lease {} held by {}",
                        self.config.name,
                        spec.holder_identity.as_deref().unwrap_or_default()
                    );
                    return Ok(false);
                }
                lease.spec = Some(claim_lease(Some(&spec), identity, self.config.lease_duration, now));
                self.api
                    .replace(&self.config.name, &PostParams::default(), &lease)
                    .await
            }
        };

        match result {
            Ok(_) => Ok(true),
            // Another replica wrote the lease first
            Err(kube::Error::Api(response)) if response.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Wait until this replica holds the lease
    pub async fn acquire(&self) -> Result<()> {
        info!(
            "Waiting for lease {}/{} as {}",
            self.config.namespace, self.config.name, self.config.identity
        );
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!("Acquired lease {}/{}", self.config.namespace, self.config.name);
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) => warn!("Failed to acquire lease {}: {}", self.config.name, e),
            }
            tokio::time::sleep(self.config.retry_period).await;
        }
    }

    /// Keep renewing the lease; returns an error once leadership is lost
    pub async fn hold(&self) -> Result<()> {
        let mut renewed = Instant::now();
        loop {
            tokio::time::sleep(self.config.retry_period).await;
            match self.try_acquire_or_renew().await {
                Ok(true) => renewed = Instant::now(),
                Ok(false) => return Err(Error::LeadershipLost(self.config.name.clone())),
                Err(e) => {
                    warn!("Failed to renew lease {}: {}", self.config.name, e);
                    if renewed.elapsed() >= self.config.renew_deadline {
                        return Err(Error::LeadershipLost(self.config.name.clone()));
                    }
                }
            }
        }
    }
}
