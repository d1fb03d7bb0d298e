//! DHT wire messages. Carried inside [`crate::frame::MeshFrame::Dht`],
//! or serialized into a gossip `dht-routing` envelope's `content` for
//! nodes not directly connected to the target replica.

use serde::{Deserialize, Serialize};

use crate::id::PeerId;

/// One stored value: `{key, value, timestamp, publisher}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DhtRecord {
    pub key: String,
    pub value: serde_json::Value,
    pub timestamp: u64,
    pub publisher: PeerId,
}

/// Messages exchanged between DHT replicas.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DhtMessage {
    /// Fire-and-forget replication write.
    Store { record: DhtRecord },
    /// A `get` query, answered by [`DhtMessage::QueryResponse`] with the
    /// same `query_id`.
    Query { key: String, query_id: u64 },
    QueryResponse { query_id: u64, record: Option<DhtRecord> },
}
