//! Instance metadata lookups
//!
//! Fills in the VPC id and region when they are not configured explicitly,
//! which is the normal case for an in-cluster deployment.

use crate::error::Ec2Error;

pub struct Imds {
    client: aws_config::imds::Client,
}

impl Imds {
    pub fn new() -> Self {
        Self {
            client: aws_config::imds::Client::builder().build(),
        }
    }

    pub async fn region(&self) -> Result<String, Ec2Error> {
        self.get("placement/region").await
    }

    /// The VPC id of the primary interface, resolved via its MAC address.
    pub async fn vpc_id(&self) -> Result<String, Ec2Error> {
        let mac = self.get("mac").await?;
        self.get(&format!("network/interfaces/macs/{mac}/vpc-id"))
            .await
    }

    async fn get(&self, path: &str) -> Result<String, Ec2Error> {
        let value = self
            .client
            .get(&format!("/latest/meta-data/{path}"))
            .await
            .map_err(|e| Ec2Error::Imds(format!("get {path}: {e}")))?;
        Ok(value.into())
    }
}

impl Default for Imds {
    fn default() -> Self {
        Self::new()
    }
}
