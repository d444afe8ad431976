use crate::idmap::LabelId;
use crate::snapshot::RelTypeId;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
pub struct GraphStatistics {
    pub node_counts_by_label: BTreeMap<LabelId, u64>,
    pub edge_counts_by_type: BTreeMap<RelTypeId, u64>,
    pub total_nodes: u64,
    pub total_edges: u64,
    /// Mean out-degree of nodes for each relationship type, derived as
    /// `edge_counts_by_type[rel] / total_nodes` at the point statistics were
    /// last recomputed. Used by the planner to pick a join order without a
    /// full scan.
    pub avg_out_degree_by_type: BTreeMap<RelTypeId, f64>,
    /// The write-transaction id statistics were last recomputed at. A
    /// monotonic counter, not a wall-clock timestamp: cheap to maintain
    /// exactly and sufficient to tell a caller how stale the numbers are in
    /// terms of committed writes.
    pub last_updated: u64,
}

impl GraphStatistics {
    /// Fills in `avg_out_degree_by_type` from `edge_counts_by_type` and
    /// `total_nodes`. Call after populating those fields and before `encode`.
    pub fn compute_avg_out_degree(&mut self) {
        self.avg_out_degree_by_type.clear();
        if self.total_nodes == 0 {
            return;
        }
        for (&rel, &count) in &self.edge_counts_by_type {
            self.avg_out_degree_by_type
                .insert(rel, count as f64 / self.total_nodes as f64);
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::new();

        // Total stats
        bytes.extend_from_slice(&self.total_nodes.to_le_bytes());
        bytes.extend_from_slice(&self.total_edges.to_le_bytes());

        // Node counts
        bytes.extend_from_slice(&(self.node_counts_by_label.len() as u32).to_le_bytes());
        for (label, count) in &self.node_counts_by_label {
            bytes.extend_from_slice(&label.to_le_bytes());
            bytes.extend_from_slice(&count.to_le_bytes());
        }

        // Edge counts
        bytes.extend_from_slice(&(self.edge_counts_by_type.len() as u32).to_le_bytes());
        for (rel, count) in &self.edge_counts_by_type {
            bytes.extend_from_slice(&rel.to_le_bytes());
            bytes.extend_from_slice(&count.to_le_bytes());
        }

        // Average out-degree by type
        bytes.extend_from_slice(&(self.avg_out_degree_by_type.len() as u32).to_le_bytes());
        for (rel, avg) in &self.avg_out_degree_by_type {
            bytes.extend_from_slice(&rel.to_le_bytes());
            bytes.extend_from_slice(&avg.to_le_bytes());
        }

        bytes.extend_from_slice(&self.last_updated.to_le_bytes());

        bytes
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 16 {
            return None;
        }
        let mut pos = 0;

        let total_nodes = u64::from_le_bytes(bytes[pos..pos + 8].try_into().ok()?);
        pos += 8;
        let total_edges = u64::from_le_bytes(bytes[pos..pos + 8].try_into().ok()?);
        pos += 8;

        let node_len = u32::from_le_bytes(bytes[pos..pos + 4].try_into().ok()?) as usize;
        pos += 4;
        let mut node_counts_by_label = BTreeMap::new();
        for _ in 0..node_len {
            let label = LabelId::from_le_bytes(bytes[pos..pos + 4].try_into().ok()?);
            pos += 4;
            let count = u64::from_le_bytes(bytes[pos..pos + 8].try_into().ok()?);
            pos += 8;
            node_counts_by_label.insert(label, count);
        }

        let edge_len = u32::from_le_bytes(bytes[pos..pos + 4].try_into().ok()?) as usize;
        pos += 4;
        let mut edge_counts_by_type = BTreeMap::new();
        for _ in 0..edge_len {
            let rel = RelTypeId::from_le_bytes(bytes[pos..pos + 4].try_into().ok()?);
            pos += 4;
            let count = u64::from_le_bytes(bytes[pos..pos + 8].try_into().ok()?);
            pos += 8;
            edge_counts_by_type.insert(rel, count);
        }

        // Trailing fields are absent in statistics blobs written before this
        // format grew them; default to empty/zero rather than failing decode.
        let mut avg_out_degree_by_type = BTreeMap::new();
        let mut last_updated = 0u64;
        if pos + 4 <= bytes.len() {
            let avg_len = u32::from_le_bytes(bytes[pos..pos + 4].try_into().ok()?) as usize;
            pos += 4;
            for _ in 0..avg_len {
                if pos + 4 + 8 > bytes.len() {
                    break;
                }
                let rel = RelTypeId::from_le_bytes(bytes[pos..pos + 4].try_into().ok()?);
                pos += 4;
                let avg = f64::from_le_bytes(bytes[pos..pos + 8].try_into().ok()?);
                pos += 8;
                avg_out_degree_by_type.insert(rel, avg);
            }
            if pos + 8 <= bytes.len() {
                last_updated = u64::from_le_bytes(bytes[pos..pos + 8].try_into().ok()?);
            }
        }

        Some(Self {
            node_counts_by_label,
            edge_counts_by_type,
            total_nodes,
            total_edges,
            avg_out_degree_by_type,
            last_updated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip_with_new_fields() {
        let mut stats = GraphStatistics {
            total_nodes: 10,
            total_edges: 25,
            ..Default::default()
        };
        stats.node_counts_by_label.insert(1, 6);
        stats.node_counts_by_label.insert(2, 4);
        stats.edge_counts_by_type.insert(1, 25);
        stats.compute_avg_out_degree();
        stats.last_updated = 42;

        let encoded = stats.encode();
        let decoded = GraphStatistics::decode(&encoded).unwrap();

        assert_eq!(decoded.total_nodes, 10);
        assert_eq!(decoded.total_edges, 25);
        assert_eq!(decoded.avg_out_degree_by_type.get(&1), Some(&2.5));
        assert_eq!(decoded.last_updated, 42);
    }

    #[test]
    fn decode_accepts_legacy_blob_without_new_fields() {
        let legacy = GraphStatistics {
            total_nodes: 3,
            total_edges: 5,
            ..Default::default()
        };
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&legacy.total_nodes.to_le_bytes());
        bytes.extend_from_slice(&legacy.total_edges.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());

        let decoded = GraphStatistics::decode(&bytes).unwrap();
        assert_eq!(decoded.total_nodes, 3);
        assert!(decoded.avg_out_degree_by_type.is_empty());
        assert_eq!(decoded.last_updated, 0);
    }
}
