//! Queue workers.
//!
//! A worker drains the queue, resolves each key against the informer's
//! in-memory index (absence means the Pod was deleted), and hands the
//! result to the handler. Failures are requeued with backoff a bounded
//! number of times; the next informer update re-delivers anything that
//! exhausts its retries.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::runtime::reflector::{ObjectRef, Store};
use tracing::{debug, error, warn};

use crate::error::Error;
use crate::queue::WorkQueue;

pub const MAX_QUEUE_RETRIES: u32 = 3;

/// Reconciliation entry points, keyed by `namespace/name`.
#[async_trait::async_trait]
pub trait PodHandler: Send + Sync {
    async fn add_or_update(&self, key: &str, pod: &Pod) -> Result<(), Error>;
    async fn delete(&self, key: &str) -> Result<(), Error>;
}

/// Lookup of the current Pod for a key. Implemented by the reflector store;
/// tests substitute a map.
pub trait PodIndex: Send + Sync {
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<Pod>>;
}

impl PodIndex for Store<Pod> {
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<Pod>> {
        self.get(&ObjectRef::new(name).within(namespace))
    }
}

pub struct Worker {
    queue: WorkQueue,
    index: Arc<dyn PodIndex>,
    handler: Arc<dyn PodHandler>,
}

impl Worker {
    pub fn new(queue: WorkQueue, index: Arc<dyn PodIndex>, handler: Arc<dyn PodHandler>) -> Self {
        Self {
            queue,
            index,
            handler,
        }
    }

    /// Process items until the queue shuts down.
    pub async fn run(&self) {
        while let Some(key) = self.queue.take().await {
            match self.process(&key).await {
                Ok(()) => self.queue.forget(&key),
                Err(e) => {
                    let retries = self.queue.num_retries(&key);
                    if e.is_retryable() && retries < MAX_QUEUE_RETRIES {
                        warn!(
                            "process {key}: {e}, retry {} of {MAX_QUEUE_RETRIES}",
                            retries + 1
                        );
                        self.queue.retry(&key);
                    } else {
                        error!("process {key}: {e}, giving up");
                        self.queue.forget(&key);
                    }
                }
            }
            self.queue.done(&key);
        }
        debug!("worker observed queue shutdown");
    }

    async fn process(&self, key: &str) -> Result<(), Error> {
        let Some((namespace, name)) = key.split_once('/') else {
            return Err(Error::InvalidConfig(format!("malformed pod key {key}")));
        };
        match self.index.get(namespace, name) {
            Some(pod) => {
                debug!("key {key} found in store, calling handler add/update");
                self.handler.add_or_update(key, &pod).await
            }
            None => {
                debug!("key {key} not found in store, calling handler delete");
                self.handler.delete(key).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::test_utils::make_pod;
    use ec2_client::Ec2Error;

    #[derive(Default)]
    struct MapIndex {
        pods: Mutex<HashMap<String, Arc<Pod>>>,
    }

    impl MapIndex {
        fn insert(&self, key: &str, pod: Pod) {
            self.pods
                .lock()
                .unwrap()
                .insert(key.to_string(), Arc::new(pod));
        }
    }

    impl PodIndex for MapIndex {
        fn get(&self, namespace: &str, name: &str) -> Option<Arc<Pod>> {
            self.pods
                .lock()
                .unwrap()
                .get(&format!("{namespace}/{name}"))
                .cloned()
        }
    }

    #[derive(Default)]
    struct CountingHandler {
        add_calls: AtomicU32,
        delete_calls: AtomicU32,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl PodHandler for CountingHandler {
        async fn add_or_update(&self, _key: &str, _pod: &Pod) -> Result<(), Error> {
            self.add_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::Ec2(Ec2Error::Api("simulated".to_string())));
            }
            Ok(())
        }

        async fn delete(&self, _key: &str) -> Result<(), Error> {
            self.delete_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::Ec2(Ec2Error::Api("simulated".to_string())));
            }
            Ok(())
        }
    }

    fn test_queue() -> WorkQueue {
        WorkQueue::new(Duration::from_millis(5), Duration::from_millis(100))
    }

    #[tokio::test]
    async fn shutdown_stops_the_worker_without_processing() {
        let queue = test_queue();
        queue.shutdown();
        let handler = Arc::new(CountingHandler::default());
        let worker = Worker::new(queue, Arc::new(MapIndex::default()), handler.clone());
        worker.run().await;
        assert_eq!(handler.add_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn present_key_goes_to_add_or_update() {
        let queue = test_queue();
        let index = MapIndex::default();
        index.insert(
            "default/test",
            make_pod("default", "test", "10.0.0.1", &[]),
        );
        let handler = Arc::new(CountingHandler::default());
        let worker = Worker::new(queue.clone(), Arc::new(index), handler.clone());

        queue.add("default/test");
        queue.shutdown();
        worker.run().await;

        assert_eq!(handler.add_calls.load(Ordering::SeqCst), 1);
        assert_eq!(handler.delete_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn absent_key_goes_to_delete() {
        let queue = test_queue();
        let handler = Arc::new(CountingHandler::default());
        let worker = Worker::new(
            queue.clone(),
            Arc::new(MapIndex::default()),
            handler.clone(),
        );

        queue.add("default/test");
        queue.shutdown();
        worker.run().await;

        assert_eq!(handler.delete_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_key_is_retried_only_max_times() {
        let queue = test_queue();
        let handler = Arc::new(CountingHandler {
            fail: true,
            ..CountingHandler::default()
        });
        let worker = {
            let worker = Worker::new(
                queue.clone(),
                Arc::new(MapIndex::default()),
                handler.clone(),
            );
            tokio::spawn(async move { worker.run().await })
        };

        queue.add("default/test");
        // first delivery plus the capped retries, then the key is forgotten
        // and the worker goes idle; the shutdown lets run() return
        tokio::time::sleep(Duration::from_secs(2)).await;
        queue.shutdown();
        worker.await.unwrap();

        assert_eq!(
            handler.delete_calls.load(Ordering::SeqCst),
            1 + MAX_QUEUE_RETRIES
        );
        assert_eq!(queue.num_retries("default/test"), 0);
    }
}
