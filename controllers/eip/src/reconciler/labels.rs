//! JSON-patch construction for the controller's Pod labels.

use serde::Serialize;

use super::pod_view::{
    PecType, PodView, LABEL_FIXED_TAG, LABEL_FIXED_TAG_VALUE, LABEL_POOL, LABEL_PUBLIC_IP,
    LABEL_TYPE,
};

/// One JSON-patch operation against `/metadata/labels`. Removal carries no
/// value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LabelPatch {
    pub op: &'static str,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

fn add(label: &str, value: &str) -> LabelPatch {
    LabelPatch {
        op: "add",
        path: format!("/metadata/labels/{label}"),
        value: Some(value.to_string()),
    }
}

fn remove(label: &str) -> LabelPatch {
    LabelPatch {
        op: "remove",
        path: format!("/metadata/labels/{label}"),
        value: None,
    }
}

/// Patch that makes the Pod's labels reflect a successful reconciliation:
/// the public IP, the type, the mode-specific detail, and removals for any
/// stale controller labels left over from a previous policy.
pub fn build_label_patch(view: &PodView, pec: &PecType, public_ip: &str) -> Vec<LabelPatch> {
    let mut desired: Vec<(&str, String)> = vec![
        (LABEL_TYPE, pec.as_str().to_string()),
        (LABEL_PUBLIC_IP, public_ip.to_string()),
    ];
    match pec {
        PecType::Auto { pool } => {
            if let Some(pool) = pool {
                desired.push((LABEL_POOL, pool.clone()));
            }
        }
        PecType::FixedTag { key } => desired.push((LABEL_FIXED_TAG, key.clone())),
        PecType::FixedTagValue { key } => desired.push((LABEL_FIXED_TAG_VALUE, key.clone())),
    }

    let mut patch = Vec::new();
    for label in controller_labels() {
        let wanted = desired.iter().find(|(name, _)| *name == label);
        match (wanted, view.label(label)) {
            (Some((_, value)), current) if current != Some(value.as_str()) => {
                patch.push(add(label, value));
            }
            (None, Some(_)) => patch.push(remove(label)),
            _ => {}
        }
    }
    patch
}

/// Patch removing every controller label the Pod currently carries. Used
/// when the Pod stops requesting an address.
pub fn build_removal_patch(view: &PodView) -> Vec<LabelPatch> {
    controller_labels()
        .iter()
        .filter(|label| view.label(label).is_some())
        .map(|label| remove(label))
        .collect()
}

fn controller_labels() -> [&'static str; 5] {
    [
        LABEL_PUBLIC_IP,
        LABEL_TYPE,
        LABEL_POOL,
        LABEL_FIXED_TAG,
        LABEL_FIXED_TAG_VALUE,
    ]
}
