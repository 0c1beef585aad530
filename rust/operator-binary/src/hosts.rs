//! Merges the host requests of the independent owners of a shared [`Certificate`](crate::crd::Certificate)

use std::collections::BTreeSet;

use tracing::info;

use crate::crd::ObjectKey;

/// The hosts to add to and remove from a Certificate on behalf of a single owner.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct HostChanges {
    pub additions: BTreeSet<String>,
    pub removals: BTreeSet<String>,
}

impl HostChanges {
    /// Computes the changes between the hosts that an owner requested `previously` and the hosts
    /// that it is `requesting` now.
    ///
    /// Without a previous request every requested host is an addition, and nothing is removed,
    /// since we can't know which of the existing hosts belong to this owner.
    pub fn between(previously: Option<&BTreeSet<String>>, requesting: &BTreeSet<String>) -> Self {
        match previously {
            Some(previously) => Self {
                additions: requesting.difference(previously).cloned().collect(),
                removals: previously.difference(requesting).cloned().collect(),
            },
            None => Self {
                additions: requesting.clone(),
                removals: BTreeSet::new(),
            },
        }
    }

    /// Applies the changes to the merged host set of the Certificate identified by `key`.
    pub fn apply(&self, key: &ObjectKey, original: &BTreeSet<String>) -> BTreeSet<String> {
        let hosts = original
            .union(&self.additions)
            .filter(|host| !self.removals.contains(*host))
            .cloned()
            .collect::<BTreeSet<_>>();
        if &hosts != original {
            info!(
                certificate = %key,
                from = ?original,
                to = ?hosts,
                "changing hosts for Certificate"
            );
        }
        hosts
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::HostChanges;
    use crate::crd::ObjectKey;

    fn hosts<const N: usize>(hosts: [&str; N]) -> BTreeSet<String> {
        hosts.into_iter().map(String::from).collect()
    }

    #[test]
    fn first_request_only_adds() {
        let changes = HostChanges::between(None, &hosts(["a.example", "b.example"]));
        assert_eq!(changes.additions, hosts(["a.example", "b.example"]));
        assert!(changes.removals.is_empty());
    }

    #[test]
    fn changed_request_adds_and_removes() {
        let changes = HostChanges::between(
            Some(&hosts(["a.example", "b.example"])),
            &hosts(["b.example", "c.example"]),
        );
        assert_eq!(changes.additions, hosts(["c.example"]));
        assert_eq!(changes.removals, hosts(["a.example"]));
    }

    #[test]
    fn unchanged_request_changes_nothing() {
        let changes = HostChanges::between(Some(&hosts(["a.example"])), &hosts(["a.example"]));
        assert_eq!(changes, HostChanges::default());
    }

    #[test]
    fn apply_keeps_hosts_of_other_owners() {
        let key = ObjectKey::new("default", "shared");
        let merged = hosts(["a.example", "b.example"]);

        // owner A used to request a.example, and now requests nothing
        let changes = HostChanges::between(Some(&hosts(["a.example"])), &hosts([]));
        assert_eq!(changes.apply(&key, &merged), hosts(["b.example"]));

        // owner C has never requested anything before
        let changes = HostChanges::between(None, &hosts(["c.example"]));
        assert_eq!(
            changes.apply(&key, &merged),
            hosts(["a.example", "b.example", "c.example"])
        );
    }

    #[test]
    fn removing_unknown_host_is_noop() {
        let key = ObjectKey::new("default", "shared");
        let merged = hosts(["b.example"]);
        let changes = HostChanges::between(Some(&hosts(["a.example"])), &hosts([]));
        assert_eq!(changes.apply(&key, &merged), merged);
    }
}
