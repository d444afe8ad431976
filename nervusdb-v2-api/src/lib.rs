//! The Backend contract: the trait boundary between the query engine and a
//! storage implementation, plus the value and id types shared across it.
//!
//! A storage backend implements [`GraphStore`] (an always-available handle)
//! and [`GraphSnapshot`] (a point-in-time, read-only view taken from it). The
//! query engine depends only on these two traits, never on any concrete
//! storage crate.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type ExternalId = u64;
pub type InternalNodeId = u32;
pub type LabelId = u32;
pub type RelTypeId = u32;

/// A directed, typed edge endpoint triple. Identity of an edge in the
/// adjacency representation; multiple edges may share the same
/// `(src, rel, dst)` (multigraph).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EdgeKey {
    pub src: InternalNodeId,
    pub rel: RelTypeId,
    pub dst: InternalNodeId,
}

/// A property value as persisted by a storage backend.
///
/// This is the closed set a backend is required to round-trip through its
/// encoding; the query engine's richer runtime `Value` (which also carries
/// node/relationship/path identities) is built on top of this on read and
/// collapsed back down to it on write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// Milliseconds since the Unix epoch.
    DateTime(i64),
    Blob(Vec<u8>),
    List(Vec<PropertyValue>),
    Map(BTreeMap<String, PropertyValue>),
}

/// A handle to a graph store capable of producing consistent read snapshots.
pub trait GraphStore {
    type Snapshot: GraphSnapshot;

    fn snapshot(&self) -> Self::Snapshot;
}

/// A point-in-time, read-only view of a graph.
///
/// Every accessor takes `&self` and returns owned data or borrowed iterators
/// scoped to the snapshot's lifetime; a snapshot never observes mutations
/// committed after it was taken.
pub trait GraphSnapshot {
    type Neighbors<'a>: Iterator<Item = EdgeKey> + 'a
    where
        Self: 'a;

    /// Outgoing edges from `src`, optionally filtered to one relationship
    /// type. Iteration order must be stable (insertion order) so that query
    /// results are reproducible across runs.
    fn neighbors(&self, src: InternalNodeId, rel: Option<RelTypeId>) -> Self::Neighbors<'_>;

    /// Incoming edges to `dst`, optionally filtered to one relationship
    /// type. The reverse-direction counterpart of [`GraphSnapshot::neighbors`],
    /// needed for `<-[:rel]-` patterns and undirected traversal.
    fn incoming_neighbors(&self, dst: InternalNodeId, rel: Option<RelTypeId>)
    -> Self::Neighbors<'_>;

    /// All live (non-tombstoned) node ids in the snapshot.
    fn nodes(&self) -> Box<dyn Iterator<Item = InternalNodeId> + '_>;

    /// The caller-supplied external id a node was created with, if any.
    fn resolve_external(&self, _iid: InternalNodeId) -> Option<ExternalId> {
        None
    }

    /// The first label of a node, if it has one.
    ///
    /// Nodes may carry more than one label; prefer [`GraphSnapshot::resolve_node_labels`]
    /// for label-set membership tests. This method exists for backends that
    /// have not been updated to the multi-label accessor.
    fn node_label(&self, iid: InternalNodeId) -> Option<LabelId>;

    /// The full label set of a node.
    ///
    /// Default implementation falls back to [`GraphSnapshot::node_label`] so
    /// that single-label-only backends keep compiling; multi-label-aware
    /// backends should override this directly rather than relying on the
    /// fallback.
    fn resolve_node_labels(&self, iid: InternalNodeId) -> Option<Vec<LabelId>> {
        self.node_label(iid).map(|id| vec![id])
    }

    fn is_tombstoned_node(&self, iid: InternalNodeId) -> bool;

    fn node_property(&self, iid: InternalNodeId, key: &str) -> Option<PropertyValue>;

    fn edge_property(&self, edge: EdgeKey, key: &str) -> Option<PropertyValue>;

    fn node_properties(&self, iid: InternalNodeId) -> Option<BTreeMap<String, PropertyValue>>;

    fn edge_properties(&self, edge: EdgeKey) -> Option<BTreeMap<String, PropertyValue>>;

    fn resolve_label_id(&self, name: &str) -> Option<LabelId>;

    fn resolve_rel_type_id(&self, name: &str) -> Option<RelTypeId>;

    fn resolve_label_name(&self, id: LabelId) -> Option<String>;

    fn resolve_rel_type_name(&self, id: RelTypeId) -> Option<String>;

    /// Number of nodes, optionally restricted to one label. Backends that
    /// don't maintain eager statistics may return `0`; the optimizer treats
    /// this as "unknown" and falls back to a conservative estimate.
    fn node_count(&self, _label: Option<LabelId>) -> u64 {
        0
    }

    /// Number of edges, optionally restricted to one relationship type.
    fn edge_count(&self, _rel: Option<RelTypeId>) -> u64 {
        0
    }

    /// Look up nodes via a secondary index on `label.field = value`, if the
    /// backend has one. Returns `None` when no such index exists (the
    /// planner then falls back to a label scan plus a filter).
    fn lookup_index(
        &self,
        _label: &str,
        _field: &str,
        _value: &PropertyValue,
    ) -> Option<Vec<InternalNodeId>> {
        None
    }
}
