//! Mock EC2 and Shield clients for unit testing
//!
//! The mocks keep address and interface state in memory and mirror the real
//! API semantics: claims only match unassociated addresses, releases of
//! associated addresses fail, and repeating an association succeeds. Every
//! call is counted so tests can assert how many cloud writes a
//! reconciliation actually performed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::ec2_trait::{Ec2ClientTrait, ShieldClientTrait};
use crate::error::Ec2Error;
use crate::models::{
    Address, Allocation, NetworkInterface, PEC_TYPE_AUTO, TAG_CLUSTER_NAME_KEY, TAG_POD_KEY,
    TAG_TYPE_KEY,
};

#[derive(Default)]
struct MockState {
    addresses: HashMap<String, Address>,
    interfaces: Vec<NetworkInterface>,
    next_id: u64,
    calls: HashMap<&'static str, u32>,
}

impl MockState {
    fn count(&mut self, op: &'static str) {
        *self.calls.entry(op).or_insert(0) += 1;
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Mock EC2 client backed by in-memory address and interface tables.
#[derive(Clone)]
pub struct MockEc2Client {
    cluster_name: String,
    state: Arc<Mutex<MockState>>,
}

impl MockEc2Client {
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Register a network interface (for test setup).
    pub fn add_interface(&self, interface: NetworkInterface) {
        self.state.lock().unwrap().interfaces.push(interface);
    }

    /// Register a pre-created address (for test setup).
    pub fn add_address(&self, address: Address) {
        self.state
            .lock()
            .unwrap()
            .addresses
            .insert(address.allocation_id.clone(), address);
    }

    /// Snapshot of every address, sorted by allocation id.
    pub fn addresses(&self) -> Vec<Address> {
        let state = self.state.lock().unwrap();
        let mut addresses: Vec<Address> = state.addresses.values().cloned().collect();
        addresses.sort_by(|a, b| a.allocation_id.cmp(&b.allocation_id));
        addresses
    }

    pub fn address(&self, allocation_id: &str) -> Option<Address> {
        self.state.lock().unwrap().addresses.get(allocation_id).cloned()
    }

    /// Number of times `op` was called, e.g. `calls("allocate-address")`.
    pub fn calls(&self, op: &str) -> u32 {
        *self.state.lock().unwrap().calls.get(op).unwrap_or(&0)
    }

    fn owned_tags(&self, pod_key: &str) -> HashMap<String, String> {
        HashMap::from([
            (TAG_TYPE_KEY.to_string(), PEC_TYPE_AUTO.to_string()),
            (TAG_CLUSTER_NAME_KEY.to_string(), self.cluster_name.clone()),
            (TAG_POD_KEY.to_string(), pod_key.to_string()),
        ])
    }
}

#[async_trait::async_trait]
impl Ec2ClientTrait for MockEc2Client {
    async fn find_interface(&self, private_ip: &str, host_ip: &str) -> Result<String, Ec2Error> {
        let mut state = self.state.lock().unwrap();
        state.count("describe-network-interfaces");

        if let Some(interface) = state
            .interfaces
            .iter()
            .find(|ni| ni.private_ips.iter().any(|ip| ip == private_ip))
        {
            return Ok(interface.id.clone());
        }

        let instance_id = state
            .interfaces
            .iter()
            .find(|ni| ni.private_ips.iter().any(|ip| ip == host_ip))
            .and_then(|ni| ni.instance_id.clone())
            .ok_or_else(|| Ec2Error::InterfaceNotFound(private_ip.to_string()))?;
        let target: std::net::Ipv4Addr = private_ip
            .parse()
            .map_err(|_| Ec2Error::InterfaceNotFound(private_ip.to_string()))?;
        state
            .interfaces
            .iter()
            .filter(|ni| ni.instance_id.as_deref() == Some(&instance_id))
            .find(|ni| {
                ni.ipv4_prefixes.iter().any(|prefix| {
                    prefix
                        .parse::<ipnetwork::Ipv4Network>()
                        .map(|network| network.contains(target))
                        .unwrap_or(false)
                })
            })
            .map(|ni| ni.id.clone())
            .ok_or_else(|| Ec2Error::InterfaceNotFound(private_ip.to_string()))
    }

    async fn allocate(&self, pod_key: &str, _pool: &str) -> Result<Allocation, Ec2Error> {
        let tags = self.owned_tags(pod_key);
        let mut state = self.state.lock().unwrap();
        state.count("allocate-address");
        let id = state.next_id();
        let address = Address {
            allocation_id: format!("eipalloc-{id:04}"),
            public_ip: format!("203.0.113.{id}"),
            tags,
            ..Address::default()
        };
        let allocation = Allocation {
            allocation_id: address.allocation_id.clone(),
            public_ip: address.public_ip.clone(),
        };
        state
            .addresses
            .insert(address.allocation_id.clone(), address);
        Ok(allocation)
    }

    async fn claim_by_tag(&self, tag_key: &str) -> Result<Allocation, Ec2Error> {
        let mut state = self.state.lock().unwrap();
        state.count("describe-addresses");
        let mut candidates: Vec<&Address> = state
            .addresses
            .values()
            .filter(|address| address.tags.contains_key(tag_key) && !address.is_associated())
            .collect();
        candidates.sort_by(|a, b| a.allocation_id.cmp(&b.allocation_id));
        candidates
            .first()
            .map(|address| Allocation {
                allocation_id: address.allocation_id.clone(),
                public_ip: address.public_ip.clone(),
            })
            .ok_or_else(|| Ec2Error::NoAvailable(tag_key.to_string()))
    }

    async fn claim_by_tag_value(
        &self,
        tag_key: &str,
        value: &str,
    ) -> Result<Allocation, Ec2Error> {
        let mut state = self.state.lock().unwrap();
        state.count("describe-addresses");
        state
            .addresses
            .values()
            .find(|address| address.tags.get(tag_key).map(String::as_str) == Some(value))
            .map(|address| Allocation {
                allocation_id: address.allocation_id.clone(),
                public_ip: address.public_ip.clone(),
            })
            .ok_or_else(|| Ec2Error::NotFound(format!("tag:{tag_key}={value}")))
    }

    async fn add_tags(
        &self,
        allocation_id: &str,
        tags: &[(String, String)],
    ) -> Result<(), Ec2Error> {
        let mut state = self.state.lock().unwrap();
        state.count("create-tags");
        let address = state
            .addresses
            .get_mut(allocation_id)
            .ok_or_else(|| Ec2Error::NotFound(allocation_id.to_string()))?;
        for (key, value) in tags {
            address.tags.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    async fn remove_tags(&self, allocation_id: &str, keys: &[&str]) -> Result<(), Ec2Error> {
        let mut state = self.state.lock().unwrap();
        state.count("delete-tags");
        let address = state
            .addresses
            .get_mut(allocation_id)
            .ok_or_else(|| Ec2Error::NotFound(allocation_id.to_string()))?;
        for key in keys {
            address.tags.remove(*key);
        }
        Ok(())
    }

    async fn associate(
        &self,
        allocation_id: &str,
        interface_id: &str,
        private_ip: &str,
    ) -> Result<String, Ec2Error> {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id();
        let address = state
            .addresses
            .get_mut(allocation_id)
            .ok_or_else(|| Ec2Error::NotFound(allocation_id.to_string()))?;
        if let Some(association_id) = &address.association_id {
            if address.network_interface_id.as_deref() == Some(interface_id)
                && address.private_ip.as_deref() == Some(private_ip)
            {
                return Ok(association_id.clone());
            }
            return Err(Ec2Error::Api(format!(
                "associate-address: {allocation_id} already associated"
            )));
        }
        let association_id = format!("eipassoc-{id:04}");
        address.association_id = Some(association_id.clone());
        address.network_interface_id = Some(interface_id.to_string());
        address.private_ip = Some(private_ip.to_string());
        state.count("associate-address");
        Ok(association_id)
    }

    async fn disassociate(&self, association_id: &str) -> Result<(), Ec2Error> {
        let mut state = self.state.lock().unwrap();
        state.count("disassociate-address");
        let address = state
            .addresses
            .values_mut()
            .find(|address| address.association_id.as_deref() == Some(association_id))
            .ok_or_else(|| Ec2Error::NotFound(association_id.to_string()))?;
        address.association_id = None;
        address.network_interface_id = None;
        address.private_ip = None;
        Ok(())
    }

    async fn release(&self, allocation_id: &str) -> Result<(), Ec2Error> {
        let mut state = self.state.lock().unwrap();
        state.count("release-address");
        match state.addresses.get(allocation_id) {
            Some(address) if address.is_associated() => Err(Ec2Error::Api(format!(
                "release-address: {allocation_id} is still associated"
            ))),
            Some(_) => {
                state.addresses.remove(allocation_id);
                Ok(())
            }
            None => Err(Ec2Error::NotFound(allocation_id.to_string())),
        }
    }

    async fn addresses_owned_by(&self, pod_key: &str) -> Result<Vec<Address>, Ec2Error> {
        let mut state = self.state.lock().unwrap();
        state.count("describe-addresses");
        let mut addresses: Vec<Address> = state
            .addresses
            .values()
            .filter(|address| {
                address.tags.get(TAG_POD_KEY).map(String::as_str) == Some(pod_key)
                    && address.tags.get(TAG_CLUSTER_NAME_KEY).map(String::as_str)
                        == Some(&self.cluster_name)
            })
            .cloned()
            .collect();
        addresses.sort_by(|a, b| a.allocation_id.cmp(&b.allocation_id));
        Ok(addresses)
    }

    async fn addresses_owned_by_cluster(&self) -> Result<Vec<Address>, Ec2Error> {
        let mut state = self.state.lock().unwrap();
        state.count("describe-addresses");
        let mut addresses: Vec<Address> = state
            .addresses
            .values()
            .filter(|address| {
                address.pec_type() == Some(PEC_TYPE_AUTO)
                    && address.tags.get(TAG_CLUSTER_NAME_KEY).map(String::as_str)
                        == Some(&self.cluster_name)
            })
            .cloned()
            .collect();
        addresses.sort_by(|a, b| a.allocation_id.cmp(&b.allocation_id));
        Ok(addresses)
    }
}

/// Mock Shield client with a fixed subscription and protection table.
#[derive(Clone, Default)]
pub struct MockShieldClient {
    account: Option<String>,
    protections: Arc<Mutex<HashMap<String, String>>>,
}

impl MockShieldClient {
    /// A client for an account without a Shield subscription.
    pub fn unsubscribed() -> Self {
        Self::default()
    }

    pub fn subscribed(account: impl Into<String>) -> Self {
        Self {
            account: Some(account.into()),
            protections: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn add_protection(&self, resource_arn: impl Into<String>, id: impl Into<String>) {
        self.protections
            .lock()
            .unwrap()
            .insert(resource_arn.into(), id.into());
    }

    pub fn protection_count(&self) -> usize {
        self.protections.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl ShieldClientTrait for MockShieldClient {
    async fn describe_subscription(&self) -> Result<Option<String>, Ec2Error> {
        Ok(self.account.clone())
    }

    async fn find_protection(&self, resource_arn: &str) -> Result<Option<String>, Ec2Error> {
        Ok(self.protections.lock().unwrap().get(resource_arn).cloned())
    }

    async fn delete_protection(&self, protection_id: &str) -> Result<(), Ec2Error> {
        let mut protections = self.protections.lock().unwrap();
        let arn = protections
            .iter()
            .find(|(_, id)| id.as_str() == protection_id)
            .map(|(arn, _)| arn.clone())
            .ok_or_else(|| Ec2Error::NotFound(protection_id.to_string()))?;
        protections.remove(&arn);
        Ok(())
    }
}
