//! Decides which namespaces are managed, and which metadata managed objects should carry

use std::collections::{BTreeMap, BTreeSet};

/// Hooks that let the surrounding deployment restrict and decorate the objects that the
/// [`CertificateManager`](crate::manager::CertificateManager) manages.
pub trait ControllerContext: Send + Sync {
    /// Whether objects in `namespace` should be managed at all.
    fn is_controlled(&self, namespace: &str) -> bool;

    /// Adds any required labels to `labels`, returning whether anything changed.
    fn set_labels(
        &self,
        namespace: &str,
        name: &str,
        kind: &str,
        labels: &mut BTreeMap<String, String>,
    ) -> bool;

    /// Adds any required annotations to `annotations`, returning whether anything changed.
    fn set_annotations(
        &self,
        namespace: &str,
        name: &str,
        kind: &str,
        annotations: &mut BTreeMap<String, String>,
    ) -> bool;
}

/// A [`ControllerContext`] with a fixed namespace allowlist and fixed metadata.
#[derive(Debug, Default)]
pub struct StaticControllerContext {
    /// Namespaces to manage, or [`None`] to manage all of them.
    pub namespaces: Option<BTreeSet<String>>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl ControllerContext for StaticControllerContext {
    fn is_controlled(&self, namespace: &str) -> bool {
        self.namespaces
            .as_ref()
            .map_or(true, |namespaces| namespaces.contains(namespace))
    }

    fn set_labels(
        &self,
        _namespace: &str,
        _name: &str,
        _kind: &str,
        labels: &mut BTreeMap<String, String>,
    ) -> bool {
        merge_into(labels, &self.labels)
    }

    fn set_annotations(
        &self,
        _namespace: &str,
        _name: &str,
        _kind: &str,
        annotations: &mut BTreeMap<String, String>,
    ) -> bool {
        merge_into(annotations, &self.annotations)
    }
}

fn merge_into(target: &mut BTreeMap<String, String>, required: &BTreeMap<String, String>) -> bool {
    let mut changed = false;
    for (key, value) in required {
        if target.get(key) != Some(value) {
            target.insert(key.clone(), value.clone());
            changed = true;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use super::{ControllerContext, StaticControllerContext};

    #[test]
    fn namespace_allowlist() {
        let all = StaticControllerContext::default();
        assert!(all.is_controlled("anything"));

        let some = StaticControllerContext {
            namespaces: Some(BTreeSet::from(["site".to_string()])),
            ..StaticControllerContext::default()
        };
        assert!(some.is_controlled("site"));
        assert!(!some.is_controlled("other"));
    }

    #[test]
    fn labels_only_change_once() {
        let ctx = StaticControllerContext {
            labels: BTreeMap::from([("app".to_string(), "router".to_string())]),
            ..StaticControllerContext::default()
        };
        let mut labels = BTreeMap::from([("keep".to_string(), "me".to_string())]);
        assert!(ctx.set_labels("site", "router", "Secret", &mut labels));
        assert_eq!(labels.get("app").map(String::as_str), Some("router"));
        assert_eq!(labels.get("keep").map(String::as_str), Some("me"));
        assert!(!ctx.set_labels("site", "router", "Secret", &mut labels));

        let mut annotations = BTreeMap::new();
        assert!(!ctx.set_annotations("site", "router", "Secret", &mut annotations));
        assert!(annotations.is_empty());
    }
}
