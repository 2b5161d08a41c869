//! AWS EC2 API client
//!
//! Implements the Elastic IP and network interface operations the controller
//! needs. Every call carries a bounded operation timeout so a stuck API
//! endpoint cannot wedge a worker.

use std::time::Duration;

use aws_config::timeout::TimeoutConfig;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_ec2::error::DisplayErrorContext;
use aws_sdk_ec2::types::{Filter, ResourceType, Tag, TagSpecification};
use tracing::{debug, info};

use crate::ec2_trait::Ec2ClientTrait;
use crate::error::Ec2Error;
use crate::models::{
    Address, Allocation, NetworkInterface, DEFAULT_ADDRESS_POOL, PEC_TYPE_AUTO,
    TAG_CLUSTER_NAME_KEY, TAG_POD_KEY, TAG_TYPE_KEY,
};

const OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// EC2 API client scoped to one VPC and one cluster.
pub struct Ec2Client {
    client: aws_sdk_ec2::Client,
    vpc_id: String,
    cluster_name: String,
}

impl Ec2Client {
    /// Create a new client for `region`, resolving credentials from the
    /// default provider chain.
    pub async fn new(region: &str, vpc_id: &str, cluster_name: &str) -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .timeout_config(
                TimeoutConfig::builder()
                    .operation_timeout(OPERATION_TIMEOUT)
                    .build(),
            )
            .load()
            .await;
        Self {
            client: aws_sdk_ec2::Client::new(&config),
            vpc_id: vpc_id.to_string(),
            cluster_name: cluster_name.to_string(),
        }
    }

    fn filter(name: &str, value: &str) -> Filter {
        Filter::builder().name(name).values(value).build()
    }

    fn tag(key: &str, value: &str) -> Tag {
        Tag::builder().key(key).value(value).build()
    }

    async fn describe_addresses(&self, filters: Vec<Filter>) -> Result<Vec<Address>, Ec2Error> {
        let resp = self
            .client
            .describe_addresses()
            .set_filters(Some(filters))
            .send()
            .await
            .map_err(|e| Ec2Error::Api(format!("describe-addresses: {}", DisplayErrorContext(e))))?;
        Ok(resp.addresses().iter().map(to_address).collect())
    }

    async fn describe_interfaces(
        &self,
        filters: Vec<Filter>,
    ) -> Result<Vec<NetworkInterface>, Ec2Error> {
        let resp = self
            .client
            .describe_network_interfaces()
            .set_filters(Some(filters))
            .send()
            .await
            .map_err(|e| {
                Ec2Error::Api(format!(
                    "describe-network-interfaces: {}",
                    DisplayErrorContext(e)
                ))
            })?;
        Ok(resp.network_interfaces().iter().map(to_interface).collect())
    }

    /// Interface that enumerates `private_ip` among its addresses.
    async fn interface_by_address(
        &self,
        private_ip: &str,
    ) -> Result<Option<NetworkInterface>, Ec2Error> {
        // aws ec2 describe-network-interfaces \
        //   --filters Name=addresses.private-ip-address,Values=<ip> Name=vpc-id,Values=<vpc>
        let interfaces = self
            .describe_interfaces(vec![
                Self::filter("addresses.private-ip-address", private_ip),
                Self::filter("vpc-id", &self.vpc_id),
            ])
            .await?;
        Ok(interfaces.into_iter().next())
    }
}

#[async_trait::async_trait]
impl Ec2ClientTrait for Ec2Client {
    async fn find_interface(&self, private_ip: &str, host_ip: &str) -> Result<String, Ec2Error> {
        if let Some(interface) = self.interface_by_address(private_ip).await? {
            return Ok(interface.id);
        }

        // Prefix-delegated interfaces do not enumerate secondary addresses,
        // so walk the hosting instance's interfaces and match the delegated
        // CIDR that contains the Pod IP.
        debug!("no interface enumerates {private_ip}, trying prefix lookup via host {host_ip}");
        let host_interface = self
            .interface_by_address(host_ip)
            .await?
            .ok_or_else(|| Ec2Error::InterfaceNotFound(host_ip.to_string()))?;
        let instance_id = host_interface
            .instance_id
            .ok_or_else(|| Ec2Error::InterfaceNotFound(private_ip.to_string()))?;

        let target: std::net::Ipv4Addr = private_ip
            .parse()
            .map_err(|_| Ec2Error::InterfaceNotFound(private_ip.to_string()))?;
        let interfaces = self
            .describe_interfaces(vec![
                Self::filter("attachment.instance-id", &instance_id),
                Self::filter("vpc-id", &self.vpc_id),
            ])
            .await?;
        for interface in interfaces {
            let contains = interface.ipv4_prefixes.iter().any(|prefix| {
                prefix
                    .parse::<ipnetwork::Ipv4Network>()
                    .map(|network| network.contains(target))
                    .unwrap_or(false)
            });
            if contains {
                return Ok(interface.id);
            }
        }
        Err(Ec2Error::InterfaceNotFound(private_ip.to_string()))
    }

    async fn allocate(&self, pod_key: &str, pool: &str) -> Result<Allocation, Ec2Error> {
        // aws ec2 allocate-address
        let tags = TagSpecification::builder()
            .resource_type(ResourceType::ElasticIp)
            .tags(Self::tag(TAG_TYPE_KEY, PEC_TYPE_AUTO))
            .tags(Self::tag(TAG_CLUSTER_NAME_KEY, &self.cluster_name))
            .tags(Self::tag(TAG_POD_KEY, pod_key))
            .build();
        let mut request = self.client.allocate_address().tag_specifications(tags);
        if pool != DEFAULT_ADDRESS_POOL {
            request = request.public_ipv4_pool(pool);
        }
        let resp = request
            .send()
            .await
            .map_err(|e| Ec2Error::Api(format!("allocate-address: {}", DisplayErrorContext(e))))?;
        let allocation = Allocation {
            allocation_id: resp.allocation_id().unwrap_or_default().to_string(),
            public_ip: resp.public_ip().unwrap_or_default().to_string(),
        };
        info!(
            "allocated {} ({}) for pod {pod_key}",
            allocation.public_ip, allocation.allocation_id
        );
        Ok(allocation)
    }

    async fn claim_by_tag(&self, tag_key: &str) -> Result<Allocation, Ec2Error> {
        let addresses = self
            .describe_addresses(vec![Self::filter("tag-key", tag_key)])
            .await?;
        addresses
            .into_iter()
            .find(|address| !address.is_associated())
            .map(|address| Allocation {
                allocation_id: address.allocation_id,
                public_ip: address.public_ip,
            })
            .ok_or_else(|| Ec2Error::NoAvailable(tag_key.to_string()))
    }

    async fn claim_by_tag_value(
        &self,
        tag_key: &str,
        value: &str,
    ) -> Result<Allocation, Ec2Error> {
        let addresses = self
            .describe_addresses(vec![Self::filter(&format!("tag:{tag_key}"), value)])
            .await?;
        addresses
            .into_iter()
            .next()
            .map(|address| Allocation {
                allocation_id: address.allocation_id,
                public_ip: address.public_ip,
            })
            .ok_or_else(|| Ec2Error::NotFound(format!("tag:{tag_key}={value}")))
    }

    async fn add_tags(
        &self,
        allocation_id: &str,
        tags: &[(String, String)],
    ) -> Result<(), Ec2Error> {
        let mut request = self.client.create_tags().resources(allocation_id);
        for (key, value) in tags {
            request = request.tags(Self::tag(key, value));
        }
        request
            .send()
            .await
            .map_err(|e| Ec2Error::Api(format!("create-tags: {}", DisplayErrorContext(e))))?;
        Ok(())
    }

    async fn remove_tags(&self, allocation_id: &str, keys: &[&str]) -> Result<(), Ec2Error> {
        let mut request = self.client.delete_tags().resources(allocation_id);
        for key in keys {
            request = request.tags(Tag::builder().key(*key).build());
        }
        request
            .send()
            .await
            .map_err(|e| Ec2Error::Api(format!("delete-tags: {}", DisplayErrorContext(e))))?;
        Ok(())
    }

    async fn associate(
        &self,
        allocation_id: &str,
        interface_id: &str,
        private_ip: &str,
    ) -> Result<String, Ec2Error> {
        // Repeating an association is a success, not a conflict.
        let existing = self
            .describe_addresses(vec![Self::filter("allocation-id", allocation_id)])
            .await?;
        if let Some(address) = existing.into_iter().next() {
            if address.network_interface_id.as_deref() == Some(interface_id)
                && address.private_ip.as_deref() == Some(private_ip)
            {
                if let Some(association_id) = address.association_id {
                    debug!("{allocation_id} already associated with {private_ip}");
                    return Ok(association_id);
                }
            }
        }

        // aws ec2 associate-address --allocation-id <id> \
        //   --network-interface-id <eni> --private-ip-address <ip>
        let resp = self
            .client
            .associate_address()
            .allocation_id(allocation_id)
            .network_interface_id(interface_id)
            .private_ip_address(private_ip)
            .send()
            .await
            .map_err(|e| Ec2Error::Api(format!("associate-address: {}", DisplayErrorContext(e))))?;
        Ok(resp.association_id().unwrap_or_default().to_string())
    }

    async fn disassociate(&self, association_id: &str) -> Result<(), Ec2Error> {
        self.client
            .disassociate_address()
            .association_id(association_id)
            .send()
            .await
            .map_err(|e| {
                Ec2Error::Api(format!("disassociate-address: {}", DisplayErrorContext(e)))
            })?;
        info!("disassociated {association_id}");
        Ok(())
    }

    async fn release(&self, allocation_id: &str) -> Result<(), Ec2Error> {
        self.client
            .release_address()
            .allocation_id(allocation_id)
            .send()
            .await
            .map_err(|e| Ec2Error::Api(format!("release-address: {}", DisplayErrorContext(e))))?;
        info!("released {allocation_id}");
        Ok(())
    }

    async fn addresses_owned_by(&self, pod_key: &str) -> Result<Vec<Address>, Ec2Error> {
        self.describe_addresses(vec![
            Self::filter(&format!("tag:{TAG_POD_KEY}"), pod_key),
            Self::filter(&format!("tag:{TAG_CLUSTER_NAME_KEY}"), &self.cluster_name),
        ])
        .await
    }

    async fn addresses_owned_by_cluster(&self) -> Result<Vec<Address>, Ec2Error> {
        self.describe_addresses(vec![
            Self::filter(&format!("tag:{TAG_TYPE_KEY}"), PEC_TYPE_AUTO),
            Self::filter(&format!("tag:{TAG_CLUSTER_NAME_KEY}"), &self.cluster_name),
        ])
        .await
    }
}

fn to_address(address: &aws_sdk_ec2::types::Address) -> Address {
    let tags = address
        .tags()
        .iter()
        .filter_map(|tag| Some((tag.key()?.to_string(), tag.value()?.to_string())))
        .collect();
    Address {
        allocation_id: address.allocation_id().unwrap_or_default().to_string(),
        association_id: address.association_id().map(str::to_string),
        network_interface_id: address.network_interface_id().map(str::to_string),
        private_ip: address.private_ip_address().map(str::to_string),
        public_ip: address.public_ip().unwrap_or_default().to_string(),
        tags,
    }
}

fn to_interface(interface: &aws_sdk_ec2::types::NetworkInterface) -> NetworkInterface {
    NetworkInterface {
        id: interface.network_interface_id().unwrap_or_default().to_string(),
        instance_id: interface
            .attachment()
            .and_then(|attachment| attachment.instance_id())
            .map(str::to_string),
        private_ips: interface
            .private_ip_addresses()
            .iter()
            .filter_map(|entry| entry.private_ip_address())
            .map(str::to_string)
            .collect(),
        ipv4_prefixes: interface
            .ipv4_prefixes()
            .iter()
            .filter_map(|prefix| prefix.ipv4_prefix())
            .map(str::to_string)
            .collect(),
    }
}
