//! Controller driver.
//!
//! Wires one informer, one queue and a fixed worker pool; runs until the
//! cancellation token fires, then drains the queue so workers exit.

use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::Error;
use crate::queue::WorkQueue;
use crate::watcher::start_pod_watch;
use crate::worker::{PodHandler, PodIndex, Worker};

const QUEUE_BASE_DELAY: Duration = Duration::from_millis(5);
const QUEUE_MAX_DELAY: Duration = Duration::from_secs(1000);

pub struct Controller {
    client: Client,
    namespace: String,
    resync_period: Option<Duration>,
    workers: usize,
    handler: Arc<dyn PodHandler>,
    queue: WorkQueue,
}

impl Controller {
    pub fn new(
        client: Client,
        namespace: &str,
        resync_period: u64,
        workers: usize,
        handler: Arc<dyn PodHandler>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            resync_period: (resync_period > 0).then(|| Duration::from_secs(resync_period)),
            workers: workers.max(1),
            handler,
            queue: WorkQueue::new(QUEUE_BASE_DELAY, QUEUE_MAX_DELAY),
        }
    }

    /// Run until `cancel` fires. Returns once the queue has drained and
    /// every worker has exited.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), Error> {
        let store = start_pod_watch(
            self.client.clone(),
            &self.namespace,
            self.queue.clone(),
            cancel.child_token(),
        );

        info!("waiting for initial pod list");
        store
            .wait_until_ready()
            .await
            .map_err(|e| Error::Watch(format!("initial pod list: {e}")))?;
        info!("pod cache synced");

        if let Some(period) = self.resync_period {
            let store = store.clone();
            let queue = self.queue.clone();
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = interval.tick() => {}
                    }
                    let mut enqueued = 0usize;
                    for pod in store.state() {
                        let has_ip = pod
                            .status
                            .as_ref()
                            .and_then(|status| status.pod_ip.as_deref())
                            .is_some_and(|ip| !ip.is_empty());
                        if !has_ip {
                            continue;
                        }
                        if let (Some(namespace), Some(name)) =
                            (pod.metadata.namespace.as_deref(), pod.metadata.name.as_deref())
                        {
                            queue.add(&format!("{namespace}/{name}"));
                            enqueued += 1;
                        }
                    }
                    debug!("resync enqueued {enqueued} pods");
                }
            });
        }

        let index: Arc<dyn PodIndex> = Arc::new(store);
        let mut workers = Vec::with_capacity(self.workers);
        for _ in 0..self.workers {
            let worker = Worker::new(self.queue.clone(), index.clone(), self.handler.clone());
            workers.push(tokio::spawn(async move { worker.run().await }));
        }
        info!("started {} worker(s)", self.workers);

        cancel.cancelled().await;
        info!("stopping controller, draining queue");
        self.queue.shutdown();
        for worker in workers {
            let _ = worker.await;
        }
        info!("controller stopped");
        Ok(())
    }
}
