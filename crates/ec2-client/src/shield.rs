//! AWS Shield Advanced client
//!
//! The recycler drops the protection attached to an Elastic IP allocation
//! before releasing it. Protections are never created by this controller.

use std::time::Duration;

use aws_config::timeout::TimeoutConfig;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_shield::error::DisplayErrorContext;
use tracing::{info, warn};

use crate::ec2_trait::ShieldClientTrait;
use crate::error::Ec2Error;

const OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ShieldClient {
    client: aws_sdk_shield::Client,
}

impl ShieldClient {
    pub async fn new(region: &str) -> Self {
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
            client: aws_sdk_shield::Client::new(&config),
        }
    }
}

#[async_trait::async_trait]
impl ShieldClientTrait for ShieldClient {
    async fn describe_subscription(&self) -> Result<Option<String>, Ec2Error> {
        // aws shield describe-subscription
        let resp = match self.client.describe_subscription().send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!("describe-subscription: {}", DisplayErrorContext(e));
                return Ok(None);
            }
        };
        // The account id is the fifth ARN segment:
        // arn:aws:shield::123456789012:subscription/...
        let account = resp
            .subscription()
            .and_then(|subscription| subscription.subscription_arn())
            .and_then(|arn| arn.split(':').nth(4))
            .map(str::to_string);
        if let Some(account) = &account {
            info!("shield subscription found for account {account}");
        }
        Ok(account)
    }

    async fn find_protection(&self, resource_arn: &str) -> Result<Option<String>, Ec2Error> {
        // aws shield describe-protection --resource-arn <arn>
        match self
            .client
            .describe_protection()
            .resource_arn(resource_arn)
            .send()
            .await
        {
            Ok(resp) => Ok(resp
                .protection()
                .and_then(|protection| protection.id())
                .map(str::to_string)),
            Err(e) => {
                warn!("describe-protection {resource_arn}: {}", DisplayErrorContext(e));
                Ok(None)
            }
        }
    }

    async fn delete_protection(&self, protection_id: &str) -> Result<(), Ec2Error> {
        self.client
            .delete_protection()
            .protection_id(protection_id)
            .send()
            .await
            .map_err(|e| {
                Ec2Error::Api(format!("delete-protection: {}", DisplayErrorContext(e)))
            })?;
        info!("deleted shield protection {protection_id}");
        Ok(())
    }
}
