use crate::csr::CsrSegment;
use crate::idmap::LabelId;
use crate::label_interner::LabelSnapshot;
use crate::snapshot::{L0Run, Snapshot};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub(crate) fn build_snapshot_from_published(
    runs: Arc<Vec<Arc<L0Run>>>,
    segments: Arc<Vec<Arc<CsrSegment>>>,
    labels: Arc<LabelSnapshot>,
    node_labels: Arc<Vec<Vec<LabelId>>>,
    properties_root: u64,
    stats_root: u64,
) -> Snapshot {
    Snapshot::new(
        runs,
        segments,
        labels,
        node_labels,
        properties_root,
        stats_root,
    )
}

pub(crate) fn load_properties_and_stats_roots(
    properties_root: &AtomicU64,
    stats_root: &AtomicU64,
) -> (u64, u64) {
    (
        properties_root.load(Ordering::SeqCst),
        stats_root.load(Ordering::SeqCst),
    )
}
