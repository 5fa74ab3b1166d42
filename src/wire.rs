//! Wire types exchanged with the sequencing server (§6). Field names are
//! normative for interoperability; do not rename without updating the
//! server contract.

use serde::{Deserialize, Serialize};

use crate::model::{ClientId, CrdtOperation, Dot};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub client_id: ClientId,
    pub last_seen_server_version: i64,
    pub operations: Vec<CrdtOperation>,
    pub request_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub base_server_version: i64,
    pub latest_server_version: i64,
    pub operations: Vec<CrdtOperation>,
    pub synced_operations: Vec<Dot>,
    pub response_hash: String,
}

impl SyncRequest {
    /// Recompute the hash over this request's own fields and compare.
    pub fn hash_is_valid(&self) -> bool {
        crate::hash::request_hash(&self.client_id, self.last_seen_server_version, &self.operations)
            == self.request_hash
    }
}

impl SyncResponse {
    pub fn hash_is_valid(&self) -> bool {
        crate::hash::response_hash(
            self.base_server_version,
            self.latest_server_version,
            &self.operations,
            &self.synced_operations,
        ) == self.response_hash
    }
}
