//! aws-pod-eip-controller
//!
//! Watches Pods whose annotations request a public address, allocates or
//! claims an Elastic IP per the requested policy, attaches it to the network
//! interface carrying the Pod IP, and publishes the result through Pod
//! labels. A lease keeps a single active replica; an optional recycler
//! reclaims addresses whose Pods vanished while the controller was down.

mod config;
mod controller;
mod error;
mod keylock;
mod leader;
mod queue;
mod reconciler;
mod recycle;
#[cfg(test)]
mod test_utils;
mod watcher;
mod worker;

use std::sync::Arc;

use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use ec2_client::{Ec2Client, Ec2ClientTrait, Imds, ShieldClient, ShieldClientTrait};

use crate::config::Flags;
use crate::controller::Controller;
use crate::error::Error;
use crate::leader::LeaderElector;
use crate::reconciler::{KubePodPatcher, Reconciler};
use crate::recycle::Recycler;

#[tokio::main]
async fn main() {
    let flags = Flags::parse();
    init_tracing(&flags);

    if let Err(e) = run(flags).await {
        error!("fatal: {e}");
        std::process::exit(1);
    }
}

fn init_tracing(flags: &Flags) {
    let builder = tracing_subscriber::fmt().with_max_level(flags.level_filter());
    if flags.log_format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(mut flags: Flags) -> Result<(), Error> {
    if flags.vpc_id.is_empty() || flags.region.is_empty() {
        let imds = Imds::new();
        if flags.region.is_empty() {
            flags.region = imds.region().await?;
        }
        if flags.vpc_id.is_empty() {
            flags.vpc_id = imds.vpc_id().await?;
        }
        info!(
            "resolved vpc-id {} region {} from instance metadata",
            flags.vpc_id, flags.region
        );
    }

    let client = build_kube_client(&flags).await?;
    let ec2: Arc<dyn Ec2ClientTrait> =
        Arc::new(Ec2Client::new(&flags.region, &flags.vpc_id, &flags.cluster_name).await);

    let elector = LeaderElector::new(client.clone());
    elector.acquire().await?;

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    if flags.recycle {
        let shield: Arc<dyn ShieldClientTrait> = Arc::new(ShieldClient::new(&flags.region).await);
        let recycler = Recycler::new(
            client.clone(),
            ec2.clone(),
            shield,
            &flags.region,
            flags.recycle_period,
        );
        let cancel = cancel.child_token();
        tokio::spawn(async move { recycler.run(cancel).await });
    }

    let reconciler = Arc::new(Reconciler::new(
        ec2,
        Arc::new(KubePodPatcher::new(client.clone())),
        flags.cluster_name.clone(),
    ));
    let controller = Controller::new(
        client,
        &flags.watch_namespace,
        flags.resync_period,
        flags.workers,
        reconciler,
    );

    let result = tokio::select! {
        result = controller.run(cancel.clone()) => result,
        result = elector.run(cancel.clone()) => result,
    };
    cancel.cancel();
    elector.release().await;
    result
}

async fn build_kube_client(flags: &Flags) -> Result<kube::Client, Error> {
    if flags.kubeconfig.is_empty() {
        return Ok(kube::Client::try_default().await?);
    }
    let kubeconfig = Kubeconfig::read_from(&flags.kubeconfig)
        .map_err(|e| Error::InvalidConfig(format!("read kubeconfig: {e}")))?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::InvalidConfig(format!("load kubeconfig: {e}")))?;
    Ok(kube::Client::try_from(config)?)
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut terminate = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(e) => {
                error!("install SIGTERM handler: {e}");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
            _ = terminate.recv() => info!("received SIGTERM, shutting down"),
        }
        cancel.cancel();
    });
}
