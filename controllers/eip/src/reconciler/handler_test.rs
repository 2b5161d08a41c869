//! Unit tests for the reconciler, driven through the mock EC2 client and a
//! recording label patcher.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ec2_client::{
    Address, Ec2Error, MockEc2Client, NetworkInterface, TAG_CLUSTER_NAME_KEY, TAG_POD_KEY,
    TAG_TYPE_KEY,
};

use super::labels::LabelPatch;
use super::pod_view::{
    ANNOTATION_FIXED_TAG, ANNOTATION_FIXED_TAG_VALUE, ANNOTATION_RECLAIM, ANNOTATION_TYPE,
    LABEL_PUBLIC_IP, LABEL_TYPE,
};
use super::{PodPatcher, Reconciler};
use crate::error::Error;
use crate::test_utils::{bump_revision, make_pod};
use crate::worker::PodHandler;

const CLUSTER: &str = "test-cluster";

#[derive(Default)]
struct MockPatcher {
    patches: Mutex<Vec<(String, Vec<LabelPatch>)>>,
}

impl MockPatcher {
    fn count(&self) -> usize {
        self.patches.lock().unwrap().len()
    }

    fn last(&self) -> Vec<LabelPatch> {
        self.patches
            .lock()
            .unwrap()
            .last()
            .map(|(_, patch)| patch.clone())
            .unwrap_or_default()
    }

    fn last_value(&self, label: &str) -> Option<String> {
        let path = format!("/metadata/labels/{label}");
        self.last()
            .iter()
            .find(|op| op.op == "add" && op.path == path)
            .and_then(|op| op.value.clone())
    }
}

#[async_trait::async_trait]
impl PodPatcher for MockPatcher {
    async fn patch_labels(
        &self,
        namespace: &str,
        name: &str,
        patch: Vec<LabelPatch>,
    ) -> Result<(), Error> {
        self.patches
            .lock()
            .unwrap()
            .push((format!("{namespace}/{name}"), patch));
        Ok(())
    }
}

fn setup() -> (MockEc2Client, Arc<MockPatcher>, Reconciler) {
    let ec2 = MockEc2Client::new(CLUSTER);
    ec2.add_interface(NetworkInterface {
        id: "eni-1".to_string(),
        instance_id: Some("i-1".to_string()),
        private_ips: vec!["10.0.0.1".to_string(), "10.0.0.250".to_string()],
        ..NetworkInterface::default()
    });
    let patcher = Arc::new(MockPatcher::default());
    let reconciler = Reconciler::new(
        Arc::new(ec2.clone()),
        patcher.clone(),
        CLUSTER.to_string(),
    );
    (ec2, patcher, reconciler)
}

fn pool_eip(allocation_id: &str, public_ip: &str, tag_key: &str, tag_value: &str) -> Address {
    Address {
        allocation_id: allocation_id.to_string(),
        public_ip: public_ip.to_string(),
        tags: HashMap::from([(tag_key.to_string(), tag_value.to_string())]),
        ..Address::default()
    }
}

#[tokio::test]
async fn auto_allocates_associates_and_labels() {
    let (ec2, patcher, reconciler) = setup();
    let pod = make_pod("ns1", "p1", "10.0.0.1", &[(ANNOTATION_TYPE, "auto")]);

    reconciler.add_or_update("ns1/p1", &pod).await.unwrap();

    let addresses = ec2.addresses();
    assert_eq!(addresses.len(), 1);
    let address = &addresses[0];
    assert_eq!(address.tags.get(TAG_TYPE_KEY).unwrap(), "auto");
    assert_eq!(address.tags.get(TAG_CLUSTER_NAME_KEY).unwrap(), CLUSTER);
    assert_eq!(address.tags.get(TAG_POD_KEY).unwrap(), "ns1/p1");
    assert_eq!(address.network_interface_id.as_deref(), Some("eni-1"));
    assert_eq!(address.private_ip.as_deref(), Some("10.0.0.1"));

    assert_eq!(ec2.calls("allocate-address"), 1);
    assert_eq!(ec2.calls("associate-address"), 1);
    assert_eq!(patcher.last_value(LABEL_PUBLIC_IP).as_deref(), Some(address.public_ip.as_str()));
    assert_eq!(patcher.last_value(LABEL_TYPE).as_deref(), Some("auto"));
}

#[tokio::test]
async fn same_revision_makes_no_further_cloud_calls() {
    let (ec2, patcher, reconciler) = setup();
    let pod = make_pod("ns1", "p1", "10.0.0.1", &[(ANNOTATION_TYPE, "auto")]);

    reconciler.add_or_update("ns1/p1", &pod).await.unwrap();
    reconciler.add_or_update("ns1/p1", &pod).await.unwrap();

    assert_eq!(ec2.calls("allocate-address"), 1);
    assert_eq!(ec2.calls("associate-address"), 1);
    assert_eq!(patcher.count(), 1);
}

#[tokio::test]
async fn matching_labels_short_circuit_new_revisions() {
    let (ec2, patcher, reconciler) = setup();
    let mut pod = make_pod("ns1", "p1", "10.0.0.1", &[(ANNOTATION_TYPE, "auto")]);
    reconciler.add_or_update("ns1/p1", &pod).await.unwrap();

    // the cluster applied the patch and bumped the revision
    let public_ip = patcher.last_value(LABEL_PUBLIC_IP).unwrap();
    pod.metadata.labels = Some(
        [
            (LABEL_TYPE.to_string(), "auto".to_string()),
            (LABEL_PUBLIC_IP.to_string(), public_ip),
        ]
        .into(),
    );
    bump_revision(&mut pod, "2");
    reconciler.add_or_update("ns1/p1", &pod).await.unwrap();

    assert_eq!(ec2.calls("describe-addresses"), 1);
    assert_eq!(ec2.calls("allocate-address"), 1);
    assert_eq!(patcher.count(), 1);
}

#[tokio::test]
async fn restart_after_crash_between_associate_and_patch() {
    // the previous leader died after associate; the new one must only
    // patch labels, with no additional cloud writes
    let (ec2, patcher, reconciler) = setup();
    let mut address = pool_eip("eipalloc-prev", "203.0.113.9", TAG_TYPE_KEY, "auto");
    address.tags.insert(TAG_CLUSTER_NAME_KEY.to_string(), CLUSTER.to_string());
    address.tags.insert(TAG_POD_KEY.to_string(), "ns1/p1".to_string());
    address.association_id = Some("eipassoc-prev".to_string());
    address.network_interface_id = Some("eni-1".to_string());
    address.private_ip = Some("10.0.0.1".to_string());
    ec2.add_address(address);

    let pod = make_pod("ns1", "p1", "10.0.0.1", &[(ANNOTATION_TYPE, "auto")]);
    reconciler.add_or_update("ns1/p1", &pod).await.unwrap();

    assert_eq!(ec2.calls("allocate-address"), 0);
    assert_eq!(ec2.calls("associate-address"), 0);
    assert_eq!(ec2.calls("disassociate-address"), 0);
    assert_eq!(patcher.last_value(LABEL_PUBLIC_IP).as_deref(), Some("203.0.113.9"));
}

#[tokio::test]
async fn pod_restart_moves_association_to_the_new_ip() {
    let (ec2, _patcher, reconciler) = setup();
    ec2.add_interface(NetworkInterface {
        id: "eni-2".to_string(),
        instance_id: Some("i-2".to_string()),
        private_ips: vec!["10.0.1.1".to_string()],
        ..NetworkInterface::default()
    });
    let pod = make_pod("ns1", "p1", "10.0.0.1", &[(ANNOTATION_TYPE, "auto")]);
    reconciler.add_or_update("ns1/p1", &pod).await.unwrap();

    let mut pod = make_pod("ns1", "p1", "10.0.1.1", &[(ANNOTATION_TYPE, "auto")]);
    bump_revision(&mut pod, "2");
    reconciler.add_or_update("ns1/p1", &pod).await.unwrap();

    let addresses = ec2.addresses();
    assert_eq!(addresses.len(), 1);
    assert_eq!(addresses[0].private_ip.as_deref(), Some("10.0.1.1"));
    assert_eq!(addresses[0].network_interface_id.as_deref(), Some("eni-2"));
    assert_eq!(ec2.calls("allocate-address"), 1);
}

#[tokio::test]
async fn policy_change_swaps_the_address() {
    let (ec2, patcher, reconciler) = setup();
    let pod = make_pod("ns1", "p1", "10.0.0.1", &[(ANNOTATION_TYPE, "auto")]);
    reconciler.add_or_update("ns1/p1", &pod).await.unwrap();
    let auto_allocation = ec2.addresses()[0].allocation_id.clone();

    ec2.add_address(pool_eip("eipalloc-pool", "198.51.100.7", "pool1", ""));
    let mut pod = make_pod(
        "ns1",
        "p1",
        "10.0.0.1",
        &[(ANNOTATION_TYPE, "fixed-tag"), (ANNOTATION_FIXED_TAG, "pool1")],
    );
    bump_revision(&mut pod, "2");
    reconciler.add_or_update("ns1/p1", &pod).await.unwrap();

    // the auto address is gone, the pool address carries the owner tags
    assert!(ec2.address(&auto_allocation).is_none());
    let claimed = ec2.address("eipalloc-pool").unwrap();
    assert_eq!(claimed.tags.get(TAG_TYPE_KEY).unwrap(), "fixed-tag");
    assert_eq!(claimed.tags.get(TAG_POD_KEY).unwrap(), "ns1/p1");
    assert_eq!(claimed.private_ip.as_deref(), Some("10.0.0.1"));
    assert_eq!(patcher.last_value(LABEL_PUBLIC_IP).as_deref(), Some("198.51.100.7"));
}

#[tokio::test]
async fn fixed_tag_pool_exhaustion_is_retryable() {
    let (ec2, _patcher, reconciler) = setup();
    ec2.add_address(pool_eip("eipalloc-pool", "198.51.100.7", "pool1", ""));

    let annotations = [
        (ANNOTATION_TYPE, "fixed-tag"),
        (ANNOTATION_FIXED_TAG, "pool1"),
    ];
    let p1 = make_pod("ns1", "p1", "10.0.0.1", &annotations);
    reconciler.add_or_update("ns1/p1", &p1).await.unwrap();

    ec2.add_interface(NetworkInterface {
        id: "eni-3".to_string(),
        private_ips: vec!["10.0.0.2".to_string()],
        ..NetworkInterface::default()
    });
    let p2 = make_pod("ns1", "p2", "10.0.0.2", &annotations);
    let err = reconciler.add_or_update("ns1/p2", &p2).await.unwrap_err();
    assert!(matches!(err, Error::Ec2(Ec2Error::NoAvailable(_))));
    assert!(err.is_retryable());

    // a second pool address appears; the retried pass claims it
    ec2.add_address(pool_eip("eipalloc-pool2", "198.51.100.8", "pool1", ""));
    reconciler.add_or_update("ns1/p2", &p2).await.unwrap();
    let claimed = ec2.address("eipalloc-pool2").unwrap();
    assert_eq!(claimed.tags.get(TAG_POD_KEY).unwrap(), "ns1/p2");
}

#[tokio::test]
async fn fixed_tag_value_claims_the_bound_address() {
    let (ec2, patcher, reconciler) = setup();
    ec2.add_address(pool_eip("eipalloc-sts", "198.51.100.9", "pool2", "ns1/sts-0"));

    let pod = make_pod(
        "ns1",
        "sts-0",
        "10.0.0.1",
        &[
            (ANNOTATION_TYPE, "fixed-tag-value"),
            (ANNOTATION_FIXED_TAG_VALUE, "pool2"),
        ],
    );
    reconciler.add_or_update("ns1/sts-0", &pod).await.unwrap();

    let claimed = ec2.address("eipalloc-sts").unwrap();
    assert_eq!(claimed.tags.get(TAG_TYPE_KEY).unwrap(), "fixed-tag-value");
    assert_eq!(claimed.private_ip.as_deref(), Some("10.0.0.1"));
    assert_eq!(patcher.last_value(LABEL_PUBLIC_IP).as_deref(), Some("198.51.100.9"));

    // delete strips the controller tags but keeps the allocation
    reconciler.delete("ns1/sts-0").await.unwrap();
    let kept = ec2.address("eipalloc-sts").unwrap();
    assert!(!kept.is_associated());
    assert!(kept.tags.get(TAG_TYPE_KEY).is_none());
    assert!(kept.tags.get(TAG_POD_KEY).is_none());
    assert_eq!(kept.tags.get("pool2").unwrap(), "ns1/sts-0");
    assert_eq!(ec2.calls("release-address"), 0);
}

#[tokio::test]
async fn delete_disassociates_and_releases_auto_addresses() {
    let (ec2, _patcher, reconciler) = setup();
    let pod = make_pod("ns1", "p1", "10.0.0.1", &[(ANNOTATION_TYPE, "auto")]);
    reconciler.add_or_update("ns1/p1", &pod).await.unwrap();
    assert_eq!(ec2.addresses().len(), 1);

    reconciler.delete("ns1/p1").await.unwrap();

    assert!(ec2.addresses().is_empty());
    assert_eq!(ec2.calls("disassociate-address"), 1);
    assert_eq!(ec2.calls("release-address"), 1);
}

#[tokio::test]
async fn delete_is_idempotent() {
    let (ec2, _patcher, reconciler) = setup();
    let pod = make_pod("ns1", "p1", "10.0.0.1", &[(ANNOTATION_TYPE, "auto")]);
    reconciler.add_or_update("ns1/p1", &pod).await.unwrap();

    reconciler.delete("ns1/p1").await.unwrap();
    reconciler.delete("ns1/p1").await.unwrap();

    assert_eq!(ec2.calls("release-address"), 1);
}

#[tokio::test]
async fn reclaim_false_keeps_the_address_on_delete() {
    let (ec2, _patcher, reconciler) = setup();
    let pod = make_pod(
        "ns1",
        "p1",
        "10.0.0.1",
        &[(ANNOTATION_TYPE, "auto"), (ANNOTATION_RECLAIM, "false")],
    );
    reconciler.add_or_update("ns1/p1", &pod).await.unwrap();

    reconciler.delete("ns1/p1").await.unwrap();

    assert_eq!(ec2.addresses().len(), 1);
    assert_eq!(ec2.calls("release-address"), 0);
}

#[tokio::test]
async fn annotation_removal_detaches_and_clears_labels() {
    let (ec2, patcher, reconciler) = setup();
    let pod = make_pod("ns1", "p1", "10.0.0.1", &[(ANNOTATION_TYPE, "auto")]);
    reconciler.add_or_update("ns1/p1", &pod).await.unwrap();

    let mut pod = make_pod("ns1", "p1", "10.0.0.1", &[]);
    pod.metadata.labels = Some(
        [
            (LABEL_TYPE.to_string(), "auto".to_string()),
            (LABEL_PUBLIC_IP.to_string(), "203.0.113.1".to_string()),
        ]
        .into(),
    );
    bump_revision(&mut pod, "2");
    reconciler.add_or_update("ns1/p1", &pod).await.unwrap();

    assert!(ec2.addresses().is_empty());
    let removals = patcher.last();
    assert!(removals.iter().all(|op| op.op == "remove"));
    assert_eq!(removals.len(), 2);
}

#[tokio::test]
async fn pod_without_ip_is_a_no_op() {
    let (ec2, patcher, reconciler) = setup();
    let pod = make_pod("ns1", "p1", "", &[(ANNOTATION_TYPE, "auto")]);

    reconciler.add_or_update("ns1/p1", &pod).await.unwrap();

    assert_eq!(ec2.calls("describe-addresses"), 0);
    assert_eq!(ec2.calls("allocate-address"), 0);
    assert_eq!(patcher.count(), 0);
}

#[tokio::test]
async fn invalid_type_annotation_is_a_no_op() {
    let (ec2, patcher, reconciler) = setup();
    let pod = make_pod("ns1", "p1", "10.0.0.1", &[(ANNOTATION_TYPE, "bogus")]);

    reconciler.add_or_update("ns1/p1", &pod).await.unwrap();

    assert_eq!(ec2.calls("describe-addresses"), 0);
    assert_eq!(patcher.count(), 0);
}

#[tokio::test]
async fn missing_interface_surfaces_a_retryable_error() {
    let (ec2, _patcher, reconciler) = setup();
    // the host interface resolves, but no interface covers 10.0.9.9
    let pod = make_pod("ns1", "p1", "10.0.9.9", &[(ANNOTATION_TYPE, "auto")]);

    let err = reconciler.add_or_update("ns1/p1", &pod).await.unwrap_err();
    assert!(matches!(err, Error::Ec2(Ec2Error::InterfaceNotFound(_))));
    assert!(err.is_retryable());
}
