use crate::{
    namespace::NamespaceIndex,
    sets::{SetIndex, INDEX_HOLDER},
    ClusterInfo,
};
use netpol_controller_core::{set::ALL_NAMESPACES, MembershipSet, Op, SetKind};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

pub type SharedIndex = Arc<RwLock<Index>>;

/// Holds all reconciler state.
///
/// Every mutation runs under the shared index's write lock and returns the
/// backend operations it implies, in the order they must be applied. The
/// `kubert` index trait impls forward those operations to the backend task.
#[derive(Debug)]
pub struct Index {
    pub(crate) cluster_info: Arc<ClusterInfo>,

    /// Holds pods, namespaces and policies by namespace.
    pub(crate) namespaces: NamespaceIndex,

    /// Holds every set the backend knows about.
    pub(crate) sets: SetIndex,

    /// Indicates whether shared infrastructure has been installed.
    pub(crate) bootstrapped: bool,

    updates: UnboundedSender<Vec<Op>>,
}

// === impl Index ===

impl Index {
    /// Creates an index and publishes the `all-namespaces` list, which lives
    /// as long as the index.
    pub fn new(cluster_info: ClusterInfo, updates: UnboundedSender<Vec<Op>>) -> Self {
        let mut sets = SetIndex::default();
        let mut ops = vec![];
        sets.hold(
            &MembershipSet::dynamic(ALL_NAMESPACES, SetKind::NamespaceLabel),
            INDEX_HOLDER,
            &mut ops,
        );
        let index = Self {
            cluster_info: Arc::new(cluster_info),
            namespaces: NamespaceIndex::default(),
            sets,
            bootstrapped: false,
            updates,
        };
        index.publish(ops);
        index
    }

    pub fn shared(cluster_info: ClusterInfo, updates: UnboundedSender<Vec<Op>>) -> SharedIndex {
        Arc::new(RwLock::new(Self::new(cluster_info, updates)))
    }

    pub fn cluster_info(&self) -> &ClusterInfo {
        &self.cluster_info
    }

    pub fn set_count(&self) -> usize {
        self.sets.len()
    }

    pub fn contains_set(&self, name: &str) -> bool {
        self.sets.contains(name)
    }

    /// Sends operations to the backend.
    pub fn publish(&self, ops: Vec<Op>) {
        if ops.is_empty() {
            return;
        }
        tracing::trace!(ops = ops.len(), "Publishing");
        if let Err(error) = self.updates.send(ops) {
            tracing::error!(%error, "Failed to send backend operations");
        }
    }
}
