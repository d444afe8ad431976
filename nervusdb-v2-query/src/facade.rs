//! Re-exports the Backend contract types so downstream crates can depend on
//! `nervusdb-v2-query` alone, plus a small convenience surface for running a
//! prepared query straight off a snapshot.

pub use nervusdb_v2_api::{
    EdgeKey, ExternalId, GraphSnapshot, GraphStore, InternalNodeId, LabelId, PropertyValue,
    RelTypeId,
};

use crate::error::Result;
use crate::executor::Row;
use crate::query_api::{Params, prepare};

/// Convenience methods for running a Cypher query directly against a
/// [`GraphSnapshot`] without separately calling [`prepare`].
pub trait QueryExt: GraphSnapshot + Sized {
    /// Prepares and streams `cypher` against this snapshot.
    fn query<'a>(
        &'a self,
        cypher: &str,
        params: &'a Params,
    ) -> Result<Box<dyn Iterator<Item = Result<Row>> + 'a>> {
        let prepared = prepare(cypher)?;
        Ok(Box::new(
            prepared.execute_streaming(self, params).collect::<Vec<_>>().into_iter(),
        ))
    }
}

impl<S: GraphSnapshot> QueryExt for S {}

/// Prepares `cypher`, executes it against `snapshot`, and collects every
/// resulting row eagerly.
///
/// This is the fast path for read-only queries where the caller wants a
/// `Vec<Row>` rather than a streaming iterator; it still surfaces the first
/// evaluation error encountered, per the propagation rule in the error
/// taxonomy (an error aborts the query rather than returning partial rows).
pub fn query_collect<S: GraphSnapshot>(
    snapshot: &S,
    cypher: &str,
    params: &Params,
) -> Result<Vec<Row>> {
    let prepared = prepare(cypher)?;
    prepared.execute_streaming(snapshot, params).collect()
}
