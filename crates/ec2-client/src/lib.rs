//! AWS EC2 / Shield / IMDS gateway
//!
//! Thin, bounded-deadline operations over Elastic IPs, network interfaces
//! and tags, plus the instance metadata lookups used to resolve the VPC id
//! and region at startup.
//!
//! The controller talks to the [`Ec2ClientTrait`] and [`ShieldClientTrait`]
//! traits so tests can substitute the in-memory mocks (behind the
//! `test-util` feature).

pub mod client;
pub mod error;
pub mod imds;
#[cfg(feature = "test-util")]
pub mod mock;
pub mod models;
pub mod shield;
#[path = "trait.rs"]
pub mod ec2_trait;

pub use client::Ec2Client;
pub use ec2_trait::{Ec2ClientTrait, ShieldClientTrait};
pub use error::Ec2Error;
pub use imds::Imds;
#[cfg(feature = "test-util")]
pub use mock::{MockEc2Client, MockShieldClient};
pub use models::*;
pub use shield::ShieldClient;
