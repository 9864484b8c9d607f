//! Inference request/result items flowing through the serving pipeline.
//!
//! Every item carries the composite key `(connection, episode, sequence)`
//! it entered with, so results can complete out of order and still be
//! routed back to the right episode.

use serde::{Deserialize, Serialize};

use crate::version::ModelVersion;

/// Composite correlation key of one inference request
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestKey {
    /// Gateway connection the request arrived on
    pub connection_id: u64,
    /// Episode issuing the request
    pub episode_id: u64,
    /// Per-episode message sequence number
    pub sequence: u64,
}

impl RequestKey {
    /// Build a key
    pub const fn new(connection_id: u64, episode_id: u64, sequence: u64) -> Self {
        Self {
            connection_id,
            episode_id,
            sequence,
        }
    }
}

/// An accepted inference request waiting for batching
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Correlation key
    pub key: RequestKey,
    /// Version the requesting episode was running when it issued the request
    pub model_version: ModelVersion,
    /// Decompressed request payload
    pub payload: Vec<u8>,
}

/// One prediction, tagged with the version active at dispatch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceResult {
    /// Correlation key copied from the request
    pub key: RequestKey,
    /// Version that produced this result
    pub model_version: ModelVersion,
    /// Model output
    pub payload: Vec<u8>,
}

/// All results for one connection produced by a single batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSet {
    /// Destination connection
    pub connection_id: u64,
    /// Results in dispatch order
    pub results: Vec<InferenceResult>,
}

impl ResultSet {
    /// Serialize for compression and egress
    pub fn encode(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    /// Inverse of [`encode`](Self::encode)
    pub fn decode(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }

    /// Oldest version among the results, if any
    pub fn oldest_version(&self) -> Option<ModelVersion> {
        self.results.iter().map(|r| r.model_version).min()
    }
}

/// Group results by connection, keeping dispatch order within each connection
pub fn group_by_connection(results: Vec<InferenceResult>) -> Vec<ResultSet> {
    let mut sets: Vec<ResultSet> = Vec::new();
    for result in results {
        let conn = result.key.connection_id;
        match sets.iter_mut().find(|s| s.connection_id == conn) {
            Some(set) => set.results.push(result),
            None => sets.push(ResultSet {
                connection_id: conn,
                results: vec![result],
            }),
        }
    }
    sets
}
