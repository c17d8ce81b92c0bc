use crate::{
    index::Index,
    network_policy::{ProcessedPolicy, RawPolicy},
    sets::{Membership, Memberships},
};
use ahash::AHashMap as HashMap;
use netpol_controller_core::{
    set::{self, ALL_NAMESPACES},
    Op, SetKind,
};
use netpol_controller_k8s_api::{self as k8s, ResourceExt};
use tracing::instrument;

#[derive(Debug, Default)]
pub(crate) struct NamespaceIndex {
    pub by_ns: HashMap<String, Namespace>,
}

/// Holds the state of a single namespace.
#[derive(Debug, Default)]
pub(crate) struct Namespace {
    /// The list memberships of the namespace's own set, if the namespace
    /// exists.
    pub labels: Option<Memberships>,

    /// Holds the memberships of each enforced pod, by name.
    pub pods: HashMap<String, Memberships>,

    /// Holds network policies by name.
    pub policies: HashMap<String, RawPolicy>,

    /// Holds merged policies by pod selector hash.
    pub processed: HashMap<String, ProcessedPolicy>,
}

/// Computes the list memberships of a namespace's set.
pub(crate) fn memberships(ns: &k8s::Namespace) -> Memberships {
    let member = set::namespace_set(&ns.name_unchecked());
    let mut memberships = Memberships::new();
    memberships.insert(Membership::new(
        ALL_NAMESPACES.to_string(),
        SetKind::NamespaceLabel,
        &member,
    ));
    for (key, value) in ns.labels() {
        memberships.insert(Membership::new(
            set::namespace_label_set(key),
            SetKind::NamespaceLabel,
            &member,
        ));
        memberships.insert(Membership::new(
            set::namespace_label_set(&set::label(key, value)),
            SetKind::NamespaceLabel,
            &member,
        ));
    }
    memberships
}

// === impl NamespaceIndex ===

impl NamespaceIndex {
    pub fn get_or_default(&mut self, name: &str) -> &mut Namespace {
        self.by_ns.entry(name.to_string()).or_default()
    }

    /// Drops a namespace's record once it holds no state.
    pub fn gc(&mut self, name: &str) {
        if self.by_ns.get(name).is_some_and(Namespace::is_empty) {
            self.by_ns.remove(name);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Namespace)> {
        self.by_ns.iter()
    }
}

// === impl Namespace ===

impl Namespace {
    fn is_empty(&self) -> bool {
        self.labels.is_none()
            && self.pods.is_empty()
            && self.policies.is_empty()
            && self.processed.is_empty()
    }
}

// === impl Index ===

impl Index {
    /// Adds a namespace's set to `all-namespaces` and to the label sets
    /// matching its labels.
    #[instrument(skip(self, ns), fields(name = ?ns.metadata.name))]
    pub fn apply_namespace(&mut self, ns: k8s::Namespace) -> Vec<Op> {
        let name = ns.name_unchecked();
        let desired = memberships(&ns);

        let mut ops = vec![];
        let current = self
            .namespaces
            .get_or_default(&name)
            .labels
            .replace(desired.clone())
            .unwrap_or_default();
        self.sets.update_memberships(&current, &desired, &mut ops);
        ops
    }

    /// Removes a namespace's set from every list set.
    #[instrument(skip(self))]
    pub fn delete_namespace(&mut self, name: &str) -> Vec<Op> {
        let mut ops = vec![];
        let Some(current) = self
            .namespaces
            .by_ns
            .get_mut(name)
            .and_then(|ns| ns.labels.take())
        else {
            return ops;
        };
        self.sets
            .update_memberships(&current, &Memberships::new(), &mut ops);
        self.namespaces.gc(name);
        ops
    }
}

impl kubert::index::IndexClusterResource<k8s::Namespace> for Index {
    fn apply(&mut self, ns: k8s::Namespace) {
        let ops = self.apply_namespace(ns);
        self.publish(ops);
    }

    fn delete(&mut self, name: String) {
        let ops = self.delete_namespace(&name);
        self.publish(ops);
    }

    // Since apply only reindexes a single namespace at a time, there's no need
    // to handle resets specially.
}
