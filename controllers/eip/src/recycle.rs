//! Orphaned-address recycler.
//!
//! If the controller dies while a Pod is deleted, the delete event is lost
//! and the Elastic IP leaks. The recycler periodically lists live Pod IPs,
//! lists the cluster's auto-allocated addresses, and releases every address
//! whose associated private IP no longer belongs to a live Pod. Shield
//! protections attached to a doomed address are deleted first.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use ec2_client::{Address, Ec2ClientTrait, ShieldClientTrait};

use crate::error::Error;

const ERROR_RETRY: Duration = Duration::from_secs(10);
// spacing between releases keeps the EC2 API from throttling the scan
const RELEASE_PACING: Duration = Duration::from_secs(5);

pub struct Recycler {
    client: Client,
    ec2: Arc<dyn Ec2ClientTrait>,
    shield: Arc<dyn ShieldClientTrait>,
    region: String,
    /// Zero means a single scan on start.
    period: Duration,
}

impl Recycler {
    pub fn new(
        client: Client,
        ec2: Arc<dyn Ec2ClientTrait>,
        shield: Arc<dyn ShieldClientTrait>,
        region: &str,
        period: u64,
    ) -> Self {
        Self {
            client,
            ec2,
            shield,
            region: region.to_string(),
            period: Duration::from_secs(period),
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let account = match self.shield.describe_subscription().await {
            Ok(account) => account,
            Err(e) => {
                error!("shield subscription lookup: {e}");
                None
            }
        };
        loop {
            if let Err(e) = self.scan(account.as_deref(), &cancel).await {
                error!("recycle scan: {e}");
                if !sleep_unless_cancelled(ERROR_RETRY, &cancel).await {
                    return;
                }
                continue;
            }
            if self.period.is_zero() {
                info!("one-shot recycle scan complete");
                return;
            }
            if !sleep_unless_cancelled(self.period, &cancel).await {
                return;
            }
        }
    }

    async fn scan(&self, account: Option<&str>, cancel: &CancellationToken) -> Result<(), Error> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let live_ips: HashSet<String> = pods
            .list(&ListParams::default())
            .await?
            .items
            .iter()
            .filter_map(|pod| pod.status.as_ref()?.pod_ip.clone())
            .collect();

        let addresses = self.ec2.addresses_owned_by_cluster().await?;
        debug!(
            "recycle scan: {} live pod IPs, {} owned addresses",
            live_ips.len(),
            addresses.len()
        );

        for address in orphaned(&addresses, &live_ips) {
            info!(
                "reclaiming orphaned address {} ({}), private ip {:?}",
                address.public_ip, address.allocation_id, address.private_ip
            );
            if let Some(account) = account {
                self.delete_protection(account, &address.allocation_id).await;
            }
            if let Some(association_id) = &address.association_id {
                if let Err(e) = self.ec2.disassociate(association_id).await {
                    error!("disassociate {association_id}: {e}");
                }
            }
            if let Err(e) = self.ec2.release(&address.allocation_id).await {
                error!("release {}: {e}", address.allocation_id);
            }
            if !sleep_unless_cancelled(RELEASE_PACING, cancel).await {
                return Ok(());
            }
        }
        Ok(())
    }

    async fn delete_protection(&self, account: &str, allocation_id: &str) {
        let arn = format!(
            "arn:aws:ec2:{}:{}:eip-allocation/{}",
            self.region, account, allocation_id
        );
        match self.shield.find_protection(&arn).await {
            Ok(Some(protection_id)) => {
                info!("deleting shield protection {protection_id} for {arn}");
                if let Err(e) = self.shield.delete_protection(&protection_id).await {
                    error!("delete protection {protection_id}: {e}");
                }
            }
            Ok(None) => {}
            Err(e) => error!("find protection for {arn}: {e}"),
        }
    }
}

/// Addresses with an association whose private IP is not used by any live
/// Pod. Unassociated addresses are left alone; a worker may be between
/// allocate and associate.
fn orphaned<'a>(addresses: &'a [Address], live_ips: &HashSet<String>) -> Vec<&'a Address> {
    addresses
        .iter()
        .filter(|address| {
            address.is_associated()
                && address
                    .private_ip
                    .as_ref()
                    .is_some_and(|ip| !ip.is_empty() && !live_ips.contains(ip))
        })
        .collect()
}

/// False when cancelled before the duration elapses.
async fn sleep_unless_cancelled(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
