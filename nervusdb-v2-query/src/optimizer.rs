//! Cost-based rewrites run once per execution, after `compile_m3_plan`
//! produces the initial left-deep plan and before the executor opens it.
//!
//! The inline predicate-pushdown folding (`compile_pattern_chain`,
//! `extend_predicates_from_properties` in `query_api.rs`) already happens at
//! compile time, before a snapshot exists. The two rewrites here need a
//! snapshot's [`GraphStatistics`]-backed cardinality estimates
//! (`GraphSnapshot::node_count`/`edge_count`), so they run later, at the
//! start of each `execute_*` call in `query_api.rs`.

use crate::executor::Plan;
use nervusdb_v2_api::GraphSnapshot;

/// Fallback cardinality used when a backend reports `0` for a count, which
/// per [`GraphSnapshot::node_count`]'s contract means "unknown" rather than
/// "empty". Large enough that an unknown side of a cartesian product is
/// never preferred as the re-executed (right) side over a side we do have
/// real counts for.
const UNKNOWN_CARDINALITY: f64 = 10_000.0;

/// Fallback mean out-degree when no edges of the relevant type are recorded
/// in statistics yet (e.g. a freshly opened, never-compacted store).
const UNKNOWN_FANOUT: f64 = 4.0;

/// Rewrites `plan` in place: reorders cartesian products so the
/// cheaper-to-materialize side drives the outer loop, and drops a `Distinct`
/// sitting directly over an `Aggregate` (whose grouped output is already
/// unique per group).
pub fn optimize<S: GraphSnapshot>(plan: Plan, snapshot: &S) -> Plan {
    match plan {
        Plan::Distinct { input } => {
            let input = optimize(*input, snapshot);
            match input {
                Plan::Aggregate { .. } => input,
                other => Plan::Distinct {
                    input: Box::new(other),
                },
            }
        }
        Plan::CartesianProduct { left, right } => {
            let left = optimize(*left, snapshot);
            let right = optimize(*right, snapshot);
            let left_cost = estimate_cardinality(&left, snapshot);
            let right_cost = estimate_cardinality(&right, snapshot);
            // `right` is re-executed once per row the outer (left) side
            // produces, so the more expensive subtree belongs on the right
            // only when it is also the more selective one; putting the
            // smaller estimate outer minimizes total re-execution.
            if right_cost < left_cost {
                Plan::CartesianProduct {
                    left: Box::new(right),
                    right: Box::new(left),
                }
            } else {
                Plan::CartesianProduct {
                    left: Box::new(left),
                    right: Box::new(right),
                }
            }
        }
        Plan::Filter { input, predicate } => Plan::Filter {
            input: Box::new(optimize(*input, snapshot)),
            predicate,
        },
        Plan::Project { input, projections } => Plan::Project {
            input: Box::new(optimize(*input, snapshot)),
            projections,
        },
        Plan::Aggregate {
            input,
            group_by,
            aggregates,
        } => Plan::Aggregate {
            input: Box::new(optimize(*input, snapshot)),
            group_by,
            aggregates,
        },
        Plan::OrderBy { input, items } => Plan::OrderBy {
            input: Box::new(optimize(*input, snapshot)),
            items,
        },
        Plan::Skip { input, skip } => Plan::Skip {
            input: Box::new(optimize(*input, snapshot)),
            skip,
        },
        Plan::Limit { input, limit } => Plan::Limit {
            input: Box::new(optimize(*input, snapshot)),
            limit,
        },
        Plan::Unwind { input, expression, alias } => Plan::Unwind {
            input: Box::new(optimize(*input, snapshot)),
            expression,
            alias,
        },
        Plan::Union { left, right, all } => Plan::Union {
            left: Box::new(optimize(*left, snapshot)),
            right: Box::new(optimize(*right, snapshot)),
            all,
        },
        Plan::Delete {
            input,
            detach,
            expressions,
        } => Plan::Delete {
            input: Box::new(optimize(*input, snapshot)),
            detach,
            expressions,
        },
        Plan::SetProperty { input, items } => Plan::SetProperty {
            input: Box::new(optimize(*input, snapshot)),
            items,
        },
        Plan::SetLabels { input, items } => Plan::SetLabels {
            input: Box::new(optimize(*input, snapshot)),
            items,
        },
        Plan::RemoveProperty { input, items } => Plan::RemoveProperty {
            input: Box::new(optimize(*input, snapshot)),
            items,
        },
        Plan::RemoveLabels { input, items } => Plan::RemoveLabels {
            input: Box::new(optimize(*input, snapshot)),
            items,
        },
        Plan::Create { input, pattern } => Plan::Create {
            input: Box::new(optimize(*input, snapshot)),
            pattern,
        },
        Plan::IndexSeek {
            alias,
            label,
            field,
            value_expr,
            fallback,
        } => Plan::IndexSeek {
            alias,
            label,
            field,
            value_expr,
            fallback: Box::new(optimize(*fallback, snapshot)),
        },
        Plan::OptionalWhereFixup {
            outer,
            filtered,
            null_aliases,
        } => Plan::OptionalWhereFixup {
            outer: Box::new(optimize(*outer, snapshot)),
            filtered: Box::new(optimize(*filtered, snapshot)),
            null_aliases,
        },
        Plan::MatchOut {
            input,
            src_alias,
            rels,
            edge_alias,
            dst_alias,
            dst_labels,
            src_prebound,
            limit,
            project,
            project_external,
            optional,
            optional_unbind,
            path_alias,
        } => Plan::MatchOut {
            input: input.map(|p| Box::new(optimize(*p, snapshot))),
            src_alias,
            rels,
            edge_alias,
            dst_alias,
            dst_labels,
            src_prebound,
            limit,
            project,
            project_external,
            optional,
            optional_unbind,
            path_alias,
        },
        Plan::MatchOutVarLen {
            input,
            src_alias,
            rels,
            edge_alias,
            dst_alias,
            dst_labels,
            src_prebound,
            direction,
            min_hops,
            max_hops,
            limit,
            project,
            project_external,
            optional,
            optional_unbind,
            path_alias,
        } => Plan::MatchOutVarLen {
            input: input.map(|p| Box::new(optimize(*p, snapshot))),
            src_alias,
            rels,
            edge_alias,
            dst_alias,
            dst_labels,
            src_prebound,
            direction,
            min_hops,
            max_hops,
            limit,
            project,
            project_external,
            optional,
            optional_unbind,
            path_alias,
        },
        Plan::MatchIn {
            input,
            src_alias,
            rels,
            edge_alias,
            dst_alias,
            dst_labels,
            src_prebound,
            limit,
            optional,
            optional_unbind,
            path_alias,
        } => Plan::MatchIn {
            input: input.map(|p| Box::new(optimize(*p, snapshot))),
            src_alias,
            rels,
            edge_alias,
            dst_alias,
            dst_labels,
            src_prebound,
            limit,
            optional,
            optional_unbind,
            path_alias,
        },
        Plan::MatchUndirected {
            input,
            src_alias,
            rels,
            edge_alias,
            dst_alias,
            dst_labels,
            src_prebound,
            limit,
            optional,
            optional_unbind,
            path_alias,
        } => Plan::MatchUndirected {
            input: input.map(|p| Box::new(optimize(*p, snapshot))),
            src_alias,
            rels,
            edge_alias,
            dst_alias,
            dst_labels,
            src_prebound,
            limit,
            optional,
            optional_unbind,
            path_alias,
        },
        Plan::MatchBoundRel {
            input,
            rel_alias,
            src_alias,
            dst_alias,
            dst_labels,
            src_prebound,
            rels,
            direction,
            optional,
            optional_unbind,
            path_alias,
        } => Plan::MatchBoundRel {
            input: Box::new(optimize(*input, snapshot)),
            rel_alias,
            src_alias,
            dst_alias,
            dst_labels,
            src_prebound,
            rels,
            direction,
            optional,
            optional_unbind,
            path_alias,
        },
        // No children, or children that are not plan nodes: nothing to reorder.
        leaf @ (Plan::ReturnOne | Plan::NodeScan { .. } | Plan::Values { .. }) => leaf,
    }
}

/// Estimates the number of rows `plan` will produce, using `GraphStatistics`
/// (via `GraphSnapshot::node_count`/`edge_count`) where the plan touches the
/// store, and fixed selectivity heuristics for filtering/grouping operators.
fn estimate_cardinality<S: GraphSnapshot>(plan: &Plan, snapshot: &S) -> f64 {
    match plan {
        Plan::ReturnOne => 1.0,
        Plan::Values { rows } => rows.len().max(1) as f64,
        Plan::NodeScan { label, .. } => label
            .as_deref()
            .and_then(|name| snapshot.resolve_label_id(name))
            .map(|id| snapshot.node_count(Some(id)))
            .filter(|&n| n > 0)
            .or_else(|| Some(snapshot.node_count(None)).filter(|&n| n > 0))
            .map(|n| n as f64)
            .unwrap_or(UNKNOWN_CARDINALITY),
        Plan::IndexSeek { .. } => 1.0,
        Plan::Filter { input, .. } => estimate_cardinality(input, snapshot) * 0.5,
        Plan::CartesianProduct { left, right } => {
            estimate_cardinality(left, snapshot) * estimate_cardinality(right, snapshot)
        }
        Plan::Union { left, right, .. } => {
            estimate_cardinality(left, snapshot) + estimate_cardinality(right, snapshot)
        }
        Plan::Aggregate {
            input, group_by, ..
        } => {
            if group_by.is_empty() {
                1.0
            } else {
                (estimate_cardinality(input, snapshot) * 0.3).max(1.0)
            }
        }
        Plan::Distinct { input } => (estimate_cardinality(input, snapshot) * 0.7).max(1.0),
        Plan::Limit { input, limit } => estimate_cardinality(input, snapshot).min(*limit as f64),
        Plan::Skip { input, skip } => (estimate_cardinality(input, snapshot) - *skip as f64).max(0.0),
        Plan::Unwind { input, .. } => estimate_cardinality(input, snapshot) * 3.0,
        Plan::OptionalWhereFixup { outer, .. } => estimate_cardinality(outer, snapshot),
        Plan::MatchOut {
            input,
            rels,
            optional,
            ..
        }
        | Plan::MatchIn {
            input,
            rels,
            optional,
            ..
        }
        | Plan::MatchUndirected {
            input,
            rels,
            optional,
            ..
        } => {
            let base = input
                .as_deref()
                .map(|p| estimate_cardinality(p, snapshot))
                .unwrap_or(1.0);
            let est = base * mean_fanout(rels, snapshot);
            if *optional { est.max(base) } else { est }
        }
        Plan::MatchOutVarLen {
            input,
            rels,
            min_hops,
            max_hops,
            ..
        } => {
            let base = input
                .as_deref()
                .map(|p| estimate_cardinality(p, snapshot))
                .unwrap_or(1.0);
            let hops = max_hops.unwrap_or((*min_hops).max(1) + 2).max(1) as f64;
            base * mean_fanout(rels, snapshot).powf(hops.min(4.0))
        }
        Plan::MatchBoundRel { input, rels, .. } => {
            estimate_cardinality(input, snapshot) * mean_fanout(rels, snapshot)
        }
        Plan::Project { input, .. }
        | Plan::OrderBy { input, .. }
        | Plan::Delete { input, .. }
        | Plan::SetProperty { input, .. }
        | Plan::SetLabels { input, .. }
        | Plan::RemoveProperty { input, .. }
        | Plan::RemoveLabels { input, .. }
        | Plan::Create { input, .. } => estimate_cardinality(input, snapshot),
    }
}

/// Average out-degree across `rels`, derived from `edge_count`/`node_count`
/// the same way `GraphStatistics::avg_out_degree_by_type` is computed, since
/// the per-type average isn't itself exposed across the `GraphSnapshot`
/// trait boundary.
fn mean_fanout<S: GraphSnapshot>(rels: &[String], snapshot: &S) -> f64 {
    if rels.is_empty() {
        return UNKNOWN_FANOUT;
    }
    let total_nodes = snapshot.node_count(None).max(1) as f64;
    let sum: f64 = rels
        .iter()
        .map(|name| {
            snapshot
                .resolve_rel_type_id(name)
                .map(|id| snapshot.edge_count(Some(id)))
                .filter(|&n| n > 0)
                .map(|n| n as f64 / total_nodes)
                .unwrap_or(UNKNOWN_FANOUT)
        })
        .sum();
    (sum / rels.len() as f64).max(0.01)
}
