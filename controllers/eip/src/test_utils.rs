//! Shared fixtures for controller tests.

use k8s_openapi::api::core::v1::{Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// A Pod with the given IP and annotations; the host IP and resource
/// version are fixed so tests can assert against them.
pub fn make_pod(namespace: &str, name: &str, ip: &str, annotations: &[(&str, &str)]) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            resource_version: Some("1".to_string()),
            annotations: Some(
                annotations
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            labels: Some(Default::default()),
            ..Default::default()
        },
        spec: None,
        status: Some(PodStatus {
            pod_ip: (!ip.is_empty()).then(|| ip.to_string()),
            host_ip: Some("10.0.0.250".to_string()),
            phase: Some("Running".to_string()),
            ..Default::default()
        }),
    }
}

/// Bump the resource version so the reconciler's memo does not short-circuit.
pub fn bump_revision(pod: &mut Pod, revision: &str) {
    pod.metadata.resource_version = Some(revision.to_string());
}
