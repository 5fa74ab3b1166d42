//! Core data model: dots, LWW fields, OR-Map rows, and CRDT operations.
//!
//! Everything in this module is plain data — no I/O, no clocks, no
//! persistence. `crdt::apply` is the only place that interprets it.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Replica identifier. Opaque to the CRDT core beyond its ordering.
pub type ClientId = String;

/// Monotonic per-replica counter assigned by the logical clock.
pub type Version = i64;

/// Unique identifier for a single write: `(client_id, version)`.
///
/// Dots from the same replica strictly increase; dots are totally ordered
/// first by `version`, then by `client_id` (lexicographic).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dot {
    pub client_id: ClientId,
    pub version: Version,
}

impl Dot {
    pub fn new(client_id: impl Into<ClientId>, version: Version) -> Self {
        Self {
            client_id: client_id.into(),
            version,
        }
    }
}

impl Ord for Dot {
    fn cmp(&self, other: &Self) -> Ordering {
        self.version
            .cmp(&other.version)
            .then_with(|| self.client_id.cmp(&other.client_id))
    }
}

impl PartialOrd for Dot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A single Last-Writer-Wins field: a value together with the dot that wrote it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LwwField {
    pub value: serde_json::Value,
    pub dot: Dot,
}

/// Causal context: per-client high-water version observed by a removal.
pub type Context = BTreeMap<ClientId, Version>;

/// Record of a row deletion, carrying the context used to suppress
/// observed writes and decide which later writes may resurrect the row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    pub dot: Dot,
    pub context: Context,
}

/// One row of one table: an Observed-Remove Map of LWW fields.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrMapRow {
    pub fields: BTreeMap<String, LwwField>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tombstone: Option<Tombstone>,
}

impl OrMapRow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invariant 1: a row with no fields and no tombstone is not stored.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.tombstone.is_none()
    }

    /// A row is "live" (visible to `get`/`getAllRows`) when it has at least
    /// one surviving field, tombstoned or not.
    pub fn is_live(&self) -> bool {
        !self.fields.is_empty()
    }
}

/// A CRDT operation, as authored locally or received from the server.
///
/// Field names are normative for wire interoperability (§6 of the design
/// spec): `rowKey`, and the tag values `set` / `setRow` / `remove`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CrdtOperation {
    #[serde(rename = "set")]
    Set {
        table: String,
        #[serde(rename = "rowKey")]
        row_key: String,
        field: String,
        value: serde_json::Value,
        dot: Dot,
    },
    #[serde(rename = "setRow")]
    SetRow {
        table: String,
        #[serde(rename = "rowKey")]
        row_key: String,
        value: BTreeMap<String, serde_json::Value>,
        dot: Dot,
    },
    #[serde(rename = "remove")]
    Remove {
        table: String,
        #[serde(rename = "rowKey")]
        row_key: String,
        dot: Dot,
        context: Context,
    },
}

impl CrdtOperation {
    pub fn table(&self) -> &str {
        match self {
            CrdtOperation::Set { table, .. } => table,
            CrdtOperation::SetRow { table, .. } => table,
            CrdtOperation::Remove { table, .. } => table,
        }
    }

    pub fn row_key(&self) -> &str {
        match self {
            CrdtOperation::Set { row_key, .. } => row_key,
            CrdtOperation::SetRow { row_key, .. } => row_key,
            CrdtOperation::Remove { row_key, .. } => row_key,
        }
    }

    pub fn dot(&self) -> &Dot {
        match self {
            CrdtOperation::Set { dot, .. } => dot,
            CrdtOperation::SetRow { dot, .. } => dot,
            CrdtOperation::Remove { dot, .. } => dot,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CrdtOperation::Set { .. } => "set",
            CrdtOperation::SetRow { .. } => "setRow",
            CrdtOperation::Remove { .. } => "remove",
        }
    }
}

/// Per-client sync bookkeeping persisted in `client_state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientState {
    pub client_id: ClientId,
    pub last_seen_server_version: i64,
}
