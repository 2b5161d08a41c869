//! The reconciler: interprets a Pod's annotation contract, drives the cloud
//! EIP state to match, and writes the outcome back to the Pod's labels.
//!
//! Both entry points are idempotent. Identical keys are serialized by the
//! work queue; contested fixed-tag pools are serialized by the key-lock
//! registry.

pub mod labels;
pub mod pod_view;

#[cfg(test)]
mod handler_test;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use tracing::{debug, info, warn};

use ec2_client::{
    Address, Allocation, Ec2ClientTrait, DEFAULT_ADDRESS_POOL, PEC_TYPE_AUTO,
    TAG_CLUSTER_NAME_KEY, TAG_POD_KEY, TAG_TYPE_KEY,
};

use crate::error::Error;
use crate::keylock::KeyLock;
use crate::worker::PodHandler;
use labels::LabelPatch;
use pod_view::{PecType, PodView};

/// Submits label patches to the cluster. A trait so tests can record
/// patches instead of talking to an API server.
#[async_trait::async_trait]
pub trait PodPatcher: Send + Sync {
    async fn patch_labels(
        &self,
        namespace: &str,
        name: &str,
        patch: Vec<LabelPatch>,
    ) -> Result<(), Error>;
}

pub struct KubePodPatcher {
    client: Client,
}

impl KubePodPatcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl PodPatcher for KubePodPatcher {
    async fn patch_labels(
        &self,
        namespace: &str,
        name: &str,
        patch: Vec<LabelPatch>,
    ) -> Result<(), Error> {
        let patch: json_patch::Patch = serde_json::from_value(serde_json::to_value(&patch)?)?;
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &PatchParams::default(), &Patch::Json::<()>(patch))
            .await?;
        Ok(())
    }
}

/// What the reconciler remembers about a key between passes.
struct Memo {
    resource_version: String,
    reclaim_on_delete: bool,
}

pub struct Reconciler {
    ec2: Arc<dyn Ec2ClientTrait>,
    pods: Arc<dyn PodPatcher>,
    keylock: KeyLock,
    cluster_name: String,
    memo: Mutex<HashMap<String, Memo>>,
}

impl Reconciler {
    pub fn new(
        ec2: Arc<dyn Ec2ClientTrait>,
        pods: Arc<dyn PodPatcher>,
        cluster_name: String,
    ) -> Self {
        Self {
            ec2,
            pods,
            keylock: KeyLock::new(),
            cluster_name,
            memo: Mutex::new(HashMap::new()),
        }
    }

    fn seen_revision(&self, view: &PodView) -> bool {
        self.memo
            .lock()
            .unwrap()
            .get(&view.key)
            .map(|memo| memo.resource_version == view.resource_version)
            .unwrap_or(false)
    }

    fn remember(&self, view: &PodView) {
        self.memo.lock().unwrap().insert(
            view.key.clone(),
            Memo {
                resource_version: view.resource_version.clone(),
                reclaim_on_delete: pod_view::reclaim_on_delete(view),
            },
        );
    }

    fn owned_tags(&self, pec: &PecType, pod_key: &str) -> Vec<(String, String)> {
        vec![
            (TAG_TYPE_KEY.to_string(), pec.as_str().to_string()),
            (TAG_CLUSTER_NAME_KEY.to_string(), self.cluster_name.clone()),
            (TAG_POD_KEY.to_string(), pod_key.to_string()),
        ]
    }

    /// Detach `address` and give it back per its recorded policy: release
    /// auto allocations, strip the controller tags off pre-created ones.
    async fn reclaim_address(&self, address: &Address) -> Result<(), Error> {
        if let Some(association_id) = &address.association_id {
            self.ec2.disassociate(association_id).await?;
        }
        if address.pec_type() == Some(PEC_TYPE_AUTO) {
            self.ec2.release(&address.allocation_id).await?;
            info!("released {} ({})", address.public_ip, address.allocation_id);
        } else {
            self.ec2
                .remove_tags(
                    &address.allocation_id,
                    &[TAG_TYPE_KEY, TAG_CLUSTER_NAME_KEY, TAG_POD_KEY],
                )
                .await?;
            info!(
                "untagged {} ({}), leaving it allocated",
                address.public_ip, address.allocation_id
            );
        }
        Ok(())
    }

    async fn acquire(&self, view: &PodView, pec: &PecType) -> Result<Allocation, Error> {
        match pec {
            PecType::Auto { pool } => {
                let pool = pool.as_deref().unwrap_or(DEFAULT_ADDRESS_POOL);
                Ok(self.ec2.allocate(&view.key, pool).await?)
            }
            PecType::FixedTag { key } => {
                let allocation = self.ec2.claim_by_tag(key).await?;
                self.ec2
                    .add_tags(&allocation.allocation_id, &self.owned_tags(pec, &view.key))
                    .await?;
                Ok(allocation)
            }
            PecType::FixedTagValue { key } => {
                let allocation = self.ec2.claim_by_tag_value(key, &view.key).await?;
                self.ec2
                    .add_tags(&allocation.allocation_id, &self.owned_tags(pec, &view.key))
                    .await?;
                Ok(allocation)
            }
        }
    }

    /// Bring the cloud and the Pod's labels in line with the desired policy.
    async fn attach(&self, view: &PodView, pec: &PecType) -> Result<(), Error> {
        // claims on a shared tag pool are serialized per tag key up to and
        // including the association, so a second claimant observes the
        // first claim as used
        let _guard = match pec {
            PecType::FixedTag { key } => Some(self.keylock.lock(key).await),
            _ => None,
        };

        // drop addresses whose recorded policy no longer matches
        let mut current: Option<Address> = None;
        for address in self.ec2.addresses_owned_by(&view.key).await? {
            if current.is_none() && address.pec_type() == Some(pec.as_str()) {
                current = Some(address);
            } else {
                info!(
                    "policy for pod {} changed, reclaiming {}",
                    view.key, address.public_ip
                );
                self.reclaim_address(&address).await?;
            }
        }

        // an association left over from a previous incarnation of the Pod
        // points at a stale private IP
        if let Some(address) = &mut current {
            if address.is_associated() && address.private_ip.as_deref() != Some(view.ip.as_str())
            {
                if let Some(association_id) = &address.association_id {
                    self.ec2.disassociate(association_id).await?;
                }
                address.association_id = None;
                address.private_ip = None;
            }
        }

        let already_associated = current
            .as_ref()
            .map(Address::is_associated)
            .unwrap_or(false);
        let allocation = match &current {
            Some(address) => Allocation {
                allocation_id: address.allocation_id.clone(),
                public_ip: address.public_ip.clone(),
            },
            None => self.acquire(view, pec).await?,
        };

        if !already_associated {
            let interface_id = self.ec2.find_interface(&view.ip, &view.host_ip).await?;
            self.ec2
                .associate(&allocation.allocation_id, &interface_id, &view.ip)
                .await?;
            info!(
                "associated {} with pod {} on {}",
                allocation.public_ip, view.key, interface_id
            );
        } else {
            debug!(
                "pod {} already associated with {}",
                view.key, allocation.public_ip
            );
        }

        let patch = labels::build_label_patch(view, pec, &allocation.public_ip);
        if !patch.is_empty() {
            self.pods
                .patch_labels(&view.namespace, &view.name, patch)
                .await?;
        }
        self.remember(view);
        Ok(())
    }

    /// The Pod stopped requesting an address: reclaim whatever it owns and
    /// drop the controller labels.
    async fn detach(&self, view: &PodView) -> Result<(), Error> {
        for address in self.ec2.addresses_owned_by(&view.key).await? {
            self.reclaim_address(&address).await?;
        }
        let patch = labels::build_removal_patch(view);
        if !patch.is_empty() {
            self.pods
                .patch_labels(&view.namespace, &view.name, patch)
                .await?;
        }
        self.remember(view);
        Ok(())
    }
}

#[async_trait::async_trait]
impl PodHandler for Reconciler {
    async fn add_or_update(&self, key: &str, pod: &Pod) -> Result<(), Error> {
        let view = PodView::from_pod(key, pod);
        if view.ip.is_empty() {
            debug!(
                "pod {key} in phase {} does not have an IP, skipping",
                view.phase
            );
            return Ok(());
        }
        if self.seen_revision(&view) {
            debug!("pod {key} revision {} already reconciled", view.resource_version);
            return Ok(());
        }
        if !pod_view::drifted(&view) {
            debug!("pod {key} labels already match annotations");
            self.remember(&view);
            return Ok(());
        }

        let desired = match PecType::parse(&view) {
            Ok(desired) => desired,
            Err(value) => {
                warn!("invalid eip annotation {value} on pod {key}");
                return Ok(());
            }
        };
        info!(
            "reconciling pod {key} phase {} ip {}",
            view.phase, view.ip
        );
        match desired {
            Some(pec) => self.attach(&view, &pec).await,
            None => self.detach(&view).await,
        }
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        let reclaim = {
            let mut memo = self.memo.lock().unwrap();
            let reclaim = memo
                .get(key)
                .map(|memo| memo.reclaim_on_delete)
                .unwrap_or(true);
            if !reclaim {
                memo.remove(key);
            }
            reclaim
        };
        if !reclaim {
            info!("pod {key} deleted with reclaim disabled, keeping its address");
            return Ok(());
        }

        let addresses = self.ec2.addresses_owned_by(key).await?;
        if addresses.is_empty() {
            debug!("no address owned by pod {key}");
        }
        for address in addresses {
            self.reclaim_address(&address).await?;
        }
        self.memo.lock().unwrap().remove(key);
        Ok(())
    }
}
