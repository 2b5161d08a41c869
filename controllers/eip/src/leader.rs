//! Kubernetes Lease-based leader election.
//!
//! Only the leader runs the informer and recycler. Replicas block in
//! [`LeaderElector::acquire`] until the current holder's lease expires;
//! once leadership is lost the process exits non-zero so the orchestrator
//! restarts it.

use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Error;

const LEASE_NAME: &str = "aws-pod-eip-controller-lock";
const LEASE_NAMESPACE: &str = "kube-system";
const LEASE_DURATION_SECS: i32 = 30;
const RENEW_DEADLINE: Duration = Duration::from_secs(10);
const RETRY_PERIOD: Duration = Duration::from_secs(5);

pub struct LeaderElector {
    lease_api: Api<Lease>,
    identity: String,
}

impl LeaderElector {
    pub fn new(client: Client) -> Self {
        let lease_api = Api::<Lease>::namespaced(client, LEASE_NAMESPACE);
        let identity = uuid::Uuid::new_v4().to_string();
        info!("leader elector identity {identity}");
        Self { lease_api, identity }
    }

    /// Block until the lease is acquired.
    pub async fn acquire(&self) -> Result<(), Error> {
        info!("waiting to acquire lease {LEASE_NAMESPACE}/{LEASE_NAME}");
        loop {
            match self.try_acquire().await {
                Ok(true) => {
                    info!("acquired leader lease");
                    return Ok(());
                }
                Ok(false) => {
                    debug!("lease held elsewhere, retrying in {RETRY_PERIOD:?}");
                }
                Err(e) => {
                    warn!("lease acquisition: {e}, retrying in {RETRY_PERIOD:?}");
                }
            }
            tokio::time::sleep(RETRY_PERIOD).await;
        }
    }

    /// Keep the lease renewed. Returns `Err(LeaseLost)` once another holder
    /// takes over or renewal fails past the deadline.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), Error> {
        let mut last_renewed = Instant::now();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(RETRY_PERIOD) => {}
            }
            match self.renew().await {
                Ok(true) => last_renewed = Instant::now(),
                Ok(false) => {
                    warn!("leader lease taken by another holder");
                    return Err(Error::LeaseLost);
                }
                Err(e) => {
                    warn!("lease renewal: {e}");
                    if last_renewed.elapsed() > RENEW_DEADLINE {
                        return Err(Error::LeaseLost);
                    }
                }
            }
        }
    }

    /// Clear the holder identity so a standby can take over immediately.
    pub async fn release(&self) {
        let lease = match self.lease_api.get(LEASE_NAME).await {
            Ok(lease) => lease,
            Err(e) => {
                warn!("read lease for release: {e}");
                return;
            }
        };
        let held_by_us = lease
            .spec
            .as_ref()
            .and_then(|spec| spec.holder_identity.as_deref())
            == Some(self.identity.as_str());
        if !held_by_us {
            return;
        }
        let mut updated = lease.clone();
        if let Some(spec) = &mut updated.spec {
            spec.holder_identity = None;
        }
        match self
            .lease_api
            .replace(LEASE_NAME, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => info!("released leader lease"),
            Err(e) => warn!("release leader lease: {e}"),
        }
    }

    async fn renew(&self) -> Result<bool, Error> {
        let lease = self.lease_api.get(LEASE_NAME).await?;
        let holder = lease
            .spec
            .as_ref()
            .and_then(|spec| spec.holder_identity.as_deref());
        if holder != Some(self.identity.as_str()) {
            return Ok(false);
        }
        let mut updated = lease.clone();
        if let Some(spec) = &mut updated.spec {
            spec.renew_time = Some(MicroTime(Utc::now()));
        }
        match self
            .lease_api
            .replace(LEASE_NAME, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn try_acquire(&self) -> Result<bool, Error> {
        let now = MicroTime(Utc::now());
        match self.lease_api.get(LEASE_NAME).await {
            Ok(existing) => {
                let spec = existing.spec.as_ref();
                let holder = spec.and_then(|spec| spec.holder_identity.as_deref());
                if holder == Some(self.identity.as_str()) {
                    self.update_lease(&existing, &now, false).await
                } else if is_expired(spec) {
                    self.update_lease(&existing, &now, true).await
                } else {
                    Ok(false)
                }
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => self.create_lease(&now).await,
            Err(e) => Err(e.into()),
        }
    }

    async fn create_lease(&self, now: &MicroTime) -> Result<bool, Error> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(LEASE_NAME.to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(LEASE_DURATION_SECS),
                acquire_time: Some(now.clone()),
                renew_time: Some(now.clone()),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        };
        match self.lease_api.create(&PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_lease(
        &self,
        existing: &Lease,
        now: &MicroTime,
        takeover: bool,
    ) -> Result<bool, Error> {
        let prev = existing.spec.as_ref();
        let transitions = prev.and_then(|spec| spec.lease_transitions).unwrap_or(0);
        let mut updated = existing.clone();
        updated.spec = Some(LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(LEASE_DURATION_SECS),
            acquire_time: if takeover {
                Some(now.clone())
            } else {
                prev.and_then(|spec| spec.acquire_time.clone())
            },
            renew_time: Some(now.clone()),
            lease_transitions: Some(if takeover { transitions + 1 } else { transitions }),
            ..Default::default()
        });
        match self
            .lease_api
            .replace(LEASE_NAME, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

fn is_expired(spec: Option<&LeaseSpec>) -> bool {
    let duration = spec
        .and_then(|spec| spec.lease_duration_seconds)
        .unwrap_or(LEASE_DURATION_SECS) as i64;
    match spec.and_then(|spec| spec.renew_time.as_ref()) {
        Some(MicroTime(renewed)) => {
            Utc::now().signed_duration_since(*renewed).num_seconds() > duration
        }
        None => true,
    }
}
