//! Data types shared between the real EC2 client and the mock.

use std::collections::HashMap;

/// Tag marking the allocation policy (`auto`, `fixed-tag`, `fixed-tag-value`).
pub const TAG_TYPE_KEY: &str = "aws-samples.github.com/aws-pod-eip-controller-type";
/// Tag marking which cluster's controller owns the address.
pub const TAG_CLUSTER_NAME_KEY: &str =
    "aws-samples.github.com/aws-pod-eip-controller-cluster-name";
/// Tag holding the owning Pod key (`namespace/name`) while associated.
pub const TAG_POD_KEY: &str = "aws-samples.github.com/aws-pod-eip-controller-pod";

/// Address pool used when the Pod does not name one.
pub const DEFAULT_ADDRESS_POOL: &str = "amazon";

/// Allocation policy value stamped on addresses created by `allocate`.
pub const PEC_TYPE_AUTO: &str = "auto";

/// An Elastic IP as reported by `describe-addresses`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Address {
    pub allocation_id: String,
    pub association_id: Option<String>,
    pub network_interface_id: Option<String>,
    pub private_ip: Option<String>,
    pub public_ip: String,
    pub tags: HashMap<String, String>,
}

impl Address {
    /// Value of the controller type tag, if the address carries one.
    pub fn pec_type(&self) -> Option<&str> {
        self.tags.get(TAG_TYPE_KEY).map(String::as_str)
    }

    pub fn is_associated(&self) -> bool {
        self.association_id.is_some()
    }
}

/// A network interface as reported by `describe-network-interfaces`.
///
/// `ipv4_prefixes` holds delegated CIDR blocks whose member addresses are not
/// enumerated in `private_ips`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkInterface {
    pub id: String,
    pub instance_id: Option<String>,
    pub private_ips: Vec<String>,
    pub ipv4_prefixes: Vec<String>,
}

/// Result of allocating or claiming an address.
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub allocation_id: String,
    pub public_ip: String,
}
