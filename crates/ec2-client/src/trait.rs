//! Client traits for mocking
//!
//! The concrete `Ec2Client` and `ShieldClient` implement these traits;
//! controller tests substitute the in-memory mocks behind the `test-util`
//! feature.

use crate::error::Ec2Error;
use crate::models::{Address, Allocation};

/// EC2 operations the controller depends on.
///
/// Every operation is safe to repeat: tag writes are last-write-wins and
/// `associate` on an already-associated triple reports success.
#[async_trait::async_trait]
pub trait Ec2ClientTrait: Send + Sync {
    /// Resolve the network interface that carries `private_ip` inside the
    /// configured VPC, falling back to the hosting instance's
    /// prefix-delegated interfaces when the address is not enumerated.
    async fn find_interface(&self, private_ip: &str, host_ip: &str) -> Result<String, Ec2Error>;

    /// Allocate a new address from `pool` tagged as owned by `pod_key`.
    async fn allocate(&self, pod_key: &str, pool: &str) -> Result<Allocation, Ec2Error>;

    /// Claim any unassociated address carrying `tag_key`.
    async fn claim_by_tag(&self, tag_key: &str) -> Result<Allocation, Ec2Error>;

    /// Claim the address whose `tag_key` tag value equals `value`.
    async fn claim_by_tag_value(&self, tag_key: &str, value: &str)
        -> Result<Allocation, Ec2Error>;

    async fn add_tags(
        &self,
        allocation_id: &str,
        tags: &[(String, String)],
    ) -> Result<(), Ec2Error>;

    async fn remove_tags(&self, allocation_id: &str, keys: &[&str]) -> Result<(), Ec2Error>;

    /// Associate the allocation with `private_ip` on `interface_id`,
    /// returning the association id.
    async fn associate(
        &self,
        allocation_id: &str,
        interface_id: &str,
        private_ip: &str,
    ) -> Result<String, Ec2Error>;

    async fn disassociate(&self, association_id: &str) -> Result<(), Ec2Error>;

    async fn release(&self, allocation_id: &str) -> Result<(), Ec2Error>;

    /// Addresses tagged as owned by `pod_key` in this cluster.
    async fn addresses_owned_by(&self, pod_key: &str) -> Result<Vec<Address>, Ec2Error>;

    /// Auto-allocated addresses owned by this cluster; the recycler input.
    async fn addresses_owned_by_cluster(&self) -> Result<Vec<Address>, Ec2Error>;
}

/// Shield Advanced operations used by the recycler to drop protections
/// before releasing an address.
#[async_trait::async_trait]
pub trait ShieldClientTrait: Send + Sync {
    /// Account id parsed from the subscription ARN, or `None` when the
    /// account has no Shield Advanced subscription.
    async fn describe_subscription(&self) -> Result<Option<String>, Ec2Error>;

    /// Protection id attached to `resource_arn`, if any.
    async fn find_protection(&self, resource_arn: &str) -> Result<Option<String>, Ec2Error>;

    async fn delete_protection(&self, protection_id: &str) -> Result<(), Ec2Error>;
}
