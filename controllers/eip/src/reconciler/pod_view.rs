//! Pod-side contract: the annotations the controller consumes and the
//! labels it writes back, plus the desired-policy parser.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;

// Annotations (inputs)
pub const ANNOTATION_TYPE: &str = "aws-samples.github.com/aws-pod-eip-controller-type";
pub const ANNOTATION_POOL: &str =
    "aws-samples.github.com/aws-pod-eip-controller-public-ipv4-pool";
pub const ANNOTATION_FIXED_TAG: &str =
    "aws-samples.github.com/aws-pod-eip-controller-fixed-tag";
pub const ANNOTATION_FIXED_TAG_VALUE: &str =
    "aws-samples.github.com/aws-pod-eip-controller-fixed-tag-value";
pub const ANNOTATION_RECLAIM: &str = "aws-samples.github.com/aws-pod-eip-controller-reclaim";
pub const ANNOTATION_MODE: &str = "aws-samples.github.com/aws-pod-eip-controller-mode";

// Labels (outputs)
pub const LABEL_PUBLIC_IP: &str = "aws-pod-eip-controller-public-ip";
pub const LABEL_TYPE: &str = "aws-pod-eip-controller-type";
pub const LABEL_POOL: &str = "aws-pod-eip-controller-public-ipv4-pool";
pub const LABEL_FIXED_TAG: &str = "aws-pod-eip-controller-fixed-tag";
pub const LABEL_FIXED_TAG_VALUE: &str = "aws-pod-eip-controller-fixed-tag-value";

pub const TYPE_AUTO: &str = "auto";
pub const TYPE_FIXED_TAG: &str = "fixed-tag";
pub const TYPE_FIXED_TAG_VALUE: &str = "fixed-tag-value";

/// What the event filter and reconciler consume from a Pod.
#[derive(Debug, Clone, Default)]
pub struct PodView {
    pub key: String,
    pub name: String,
    pub namespace: String,
    pub ip: String,
    pub host_ip: String,
    pub phase: String,
    pub resource_version: String,
    pub annotations: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

impl PodView {
    pub fn from_pod(key: &str, pod: &Pod) -> Self {
        let status = pod.status.as_ref();
        Self {
            key: key.to_string(),
            name: pod.metadata.name.clone().unwrap_or_default(),
            namespace: pod.metadata.namespace.clone().unwrap_or_default(),
            ip: status
                .and_then(|s| s.pod_ip.clone())
                .unwrap_or_default(),
            host_ip: status
                .and_then(|s| s.host_ip.clone())
                .unwrap_or_default(),
            phase: status
                .and_then(|s| s.phase.clone())
                .unwrap_or_default(),
            resource_version: pod.metadata.resource_version.clone().unwrap_or_default(),
            annotations: pod.metadata.annotations.clone().unwrap_or_default(),
            labels: pod.metadata.labels.clone().unwrap_or_default(),
        }
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// The allocation policy a Pod requests through its annotations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PecType {
    /// Allocate a fresh address from `pool` and release it on detach.
    Auto { pool: Option<String> },
    /// Claim any unassociated pre-created address carrying `key`.
    FixedTag { key: String },
    /// Claim the pre-created address whose `key` tag value equals the Pod key.
    FixedTagValue { key: String },
}

impl PecType {
    /// Parse the desired policy from a Pod's annotations.
    ///
    /// `Ok(None)` means the Pod does not request an address; `Err` carries
    /// the offending annotation value for the warn log.
    pub fn parse(view: &PodView) -> Result<Option<PecType>, String> {
        let Some(value) = view.annotation(ANNOTATION_TYPE) else {
            return Ok(None);
        };
        match value {
            TYPE_AUTO => Ok(Some(PecType::Auto {
                pool: view
                    .annotation(ANNOTATION_POOL)
                    .filter(|pool| !pool.is_empty())
                    .map(str::to_string),
            })),
            TYPE_FIXED_TAG => match view.annotation(ANNOTATION_FIXED_TAG) {
                Some(key) if !key.is_empty() => Ok(Some(PecType::FixedTag {
                    key: key.to_string(),
                })),
                _ => Err(format!("{value} without {ANNOTATION_FIXED_TAG}")),
            },
            TYPE_FIXED_TAG_VALUE => match view.annotation(ANNOTATION_FIXED_TAG_VALUE) {
                Some(key) if !key.is_empty() => Ok(Some(PecType::FixedTagValue {
                    key: key.to_string(),
                })),
                _ => Err(format!("{value} without {ANNOTATION_FIXED_TAG_VALUE}")),
            },
            other => Err(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PecType::Auto { .. } => TYPE_AUTO,
            PecType::FixedTag { .. } => TYPE_FIXED_TAG,
            PecType::FixedTagValue { .. } => TYPE_FIXED_TAG_VALUE,
        }
    }
}

/// Whether the annotation type value names a known policy. Used by the event
/// filter, which has no need for the full parse.
pub fn valid_pec_type(value: &str) -> bool {
    matches!(value, TYPE_AUTO | TYPE_FIXED_TAG | TYPE_FIXED_TAG_VALUE)
}

/// Whether the delete path may release this Pod's address.
///
/// Releasing is the default; `reclaim=false` or `mode=fixed` pins the
/// address even for `auto` allocations.
pub fn reclaim_on_delete(view: &PodView) -> bool {
    if view.annotation(ANNOTATION_RECLAIM) == Some("false") {
        return false;
    }
    if view.annotation(ANNOTATION_MODE) == Some("fixed") {
        return false;
    }
    true
}

/// Whether the Pod's annotations and the controller's own labels disagree,
/// meaning a reconcile pass is needed. Label state is written last, so
/// agreement implies the previous pass completed.
pub fn drifted(view: &PodView) -> bool {
    let annotation = view.annotation(ANNOTATION_TYPE).unwrap_or_default();
    let label = view.label(LABEL_TYPE).unwrap_or_default();
    if annotation != label {
        return true;
    }
    match annotation {
        TYPE_AUTO => {
            view.annotation(ANNOTATION_POOL).unwrap_or_default()
                != view.label(LABEL_POOL).unwrap_or_default()
        }
        TYPE_FIXED_TAG => {
            view.annotation(ANNOTATION_FIXED_TAG).unwrap_or_default()
                != view.label(LABEL_FIXED_TAG).unwrap_or_default()
        }
        TYPE_FIXED_TAG_VALUE => {
            view.annotation(ANNOTATION_FIXED_TAG_VALUE).unwrap_or_default()
                != view.label(LABEL_FIXED_TAG_VALUE).unwrap_or_default()
        }
        _ => false,
    }
}
