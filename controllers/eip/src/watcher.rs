//! Pod watch stream and event filter.
//!
//! A reflector keeps the in-memory Pod index that workers read; the event
//! filter decides which watch events become queue keys:
//!
//! - add: only Pods with a valid type annotation and an assigned IP;
//! - update: any Pod with an IP, even if nothing visibly changed, so
//!   annotation/label drift is caught;
//! - delete: always, so the reconciler can observe absence.

use std::collections::HashSet;
use std::sync::Mutex;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::reflector::Store;
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::queue::WorkQueue;
use crate::reconciler::pod_view::{self, ANNOTATION_TYPE};

/// Canonical queue key for a Pod, `namespace/name`.
fn pod_key(pod: &Pod) -> Option<String> {
    let name = pod.metadata.name.as_deref()?;
    let namespace = pod.metadata.namespace.as_deref()?;
    Some(format!("{namespace}/{name}"))
}

fn pod_ip(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|status| status.pod_ip.as_deref())
        .unwrap_or_default()
}

/// Filters watch events into the queue.
pub struct EventFilter {
    queue: WorkQueue,
    seen: Mutex<HashSet<String>>,
}

impl EventFilter {
    pub fn new(queue: WorkQueue) -> Self {
        Self {
            queue,
            seen: Mutex::new(HashSet::new()),
        }
    }

    pub fn handle(&self, event: watcher::Event<Pod>) {
        match event {
            watcher::Event::Init => debug!("pod watch (re)starting"),
            watcher::Event::InitDone => debug!("pod watch list complete"),
            watcher::Event::InitApply(pod) | watcher::Event::Apply(pod) => self.on_apply(&pod),
            watcher::Event::Delete(pod) => self.on_delete(&pod),
        }
    }

    fn on_apply(&self, pod: &Pod) {
        let Some(key) = pod_key(pod) else {
            warn!("dropping pod event without namespace/name");
            return;
        };
        let first_seen = self.seen.lock().unwrap().insert(key.clone());
        if first_seen {
            if self.should_enqueue_add(pod) {
                debug!("add event {key} added to queue");
                self.queue.add(&key);
            } else {
                debug!("skipping add event {key}");
            }
        } else if self.should_enqueue_update(pod) {
            debug!("update event {key} added to queue");
            self.queue.add(&key);
        } else {
            debug!("skipping update event {key}");
        }
    }

    fn on_delete(&self, pod: &Pod) {
        let Some(key) = pod_key(pod) else {
            warn!("dropping pod delete event without namespace/name");
            return;
        };
        self.seen.lock().unwrap().remove(&key);
        debug!("delete event {key} added to queue");
        self.queue.add(&key);
    }

    fn should_enqueue_add(&self, pod: &Pod) -> bool {
        let annotated = pod
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(ANNOTATION_TYPE))
            .map(|value| pod_view::valid_pec_type(value))
            .unwrap_or(false);
        annotated && !pod_ip(pod).is_empty()
    }

    fn should_enqueue_update(&self, pod: &Pod) -> bool {
        !pod_ip(pod).is_empty()
    }
}

/// Start the shared list-and-watch. Returns the store workers read; the
/// stream task runs until cancelled.
pub fn start_pod_watch(
    client: Client,
    namespace: &str,
    queue: WorkQueue,
    cancel: CancellationToken,
) -> Store<Pod> {
    let api: Api<Pod> = if namespace.is_empty() {
        Api::all(client)
    } else {
        Api::namespaced(client, namespace)
    };
    info!(
        "watching pods in {}",
        if namespace.is_empty() { "all namespaces" } else { namespace }
    );

    let (reader, writer) = reflector::store::<Pod>();
    let filter = EventFilter::new(queue);
    let stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .reflect(writer);

    tokio::spawn(async move {
        let mut stream = Box::pin(stream);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("pod watch stopped");
                    return;
                }
                event = stream.next() => match event {
                    Some(Ok(event)) => filter.handle(event),
                    Some(Err(e)) => error!("pod watch stream error: {e}"),
                    None => {
                        error!("pod watch stream ended");
                        return;
                    }
                },
            }
        }
    });

    reader
}
