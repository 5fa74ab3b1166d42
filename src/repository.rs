//! Persistence Repository (C2): the sole owner of durable state.
//!
//! Every mutating method requires a [`ScopedTransaction`] naming the stores
//! it touches and the mode it needs them in; a mismatch fails fast with
//! [`SyncError::Transaction`] rather than silently scanning a store the
//! caller never declared.

use std::ops::BitOr;

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::model::{ClientState, CrdtOperation, Dot, OrMapRow};

/// The four logical stores named in §4.2, as a small bitset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stores(u8);

impl Stores {
    pub const NONE: Stores = Stores(0);
    pub const ROWS: Stores = Stores(0b001);
    pub const OPERATIONS: Stores = Stores(0b010);
    pub const CLIENT_STATE: Stores = Stores(0b100);

    fn contains(self, other: Stores) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Stores {
    type Output = Stores;
    fn bitor(self, rhs: Stores) -> Stores {
        Stores(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    ReadOnly,
    ReadWrite,
}

/// A rusqlite transaction tagged with the stores/mode the caller declared,
/// mirroring the `transaction(stores, mode)` primitive from §4.2.
pub struct ScopedTransaction<'conn> {
    tx: rusqlite::Transaction<'conn>,
    stores: Stores,
    mode: TxMode,
}

impl<'conn> ScopedTransaction<'conn> {
    fn require(&self, store: Stores, name: &'static str, mode: TxMode) -> Result<()> {
        if !self.stores.contains(store) {
            return Err(SyncError::Transaction {
                required: name,
                mode: if mode == TxMode::ReadWrite {
                    "readwrite"
                } else {
                    "readonly"
                },
            });
        }
        if mode == TxMode::ReadWrite && self.mode != TxMode::ReadWrite {
            return Err(SyncError::Transaction {
                required: name,
                mode: "readwrite",
            });
        }
        Ok(())
    }

    pub fn commit(self) -> Result<()> {
        self.tx.commit().map_err(Into::into)
    }

    /// Explicit rollback; matches §7's "explicitly abort the transaction" contract.
    pub fn abort(self) -> Result<()> {
        self.tx.rollback().map_err(Into::into)
    }
}

pub struct Repository<'c> {
    conn: &'c Connection,
}

impl<'c> Repository<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Create tables/indexes if missing and ensure `client_state` has all
    /// three labels. Safe to call on every open. Per the normative ordering
    /// (§9 open question 3), `client_id` is persisted before this returns,
    /// so no `tick` can run before a client id exists.
    pub fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
PRAGMA journal_mode=WAL;

CREATE TABLE IF NOT EXISTS rows (
    table_name TEXT NOT NULL,
    row_key TEXT NOT NULL,
    data TEXT NOT NULL,
    PRIMARY KEY (table_name, row_key)
);
CREATE INDEX IF NOT EXISTS idx_rows_table ON rows(table_name);

CREATE TABLE IF NOT EXISTS operations (
    client_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    op TEXT NOT NULL,
    synced INTEGER NOT NULL DEFAULT 0 CHECK(synced IN (0, 1)),
    PRIMARY KEY (client_id, version)
);
CREATE INDEX IF NOT EXISTS idx_operations_synced ON operations(synced);
CREATE INDEX IF NOT EXISTS idx_operations_client_synced ON operations(client_id, synced);

CREATE TABLE IF NOT EXISTS client_state (
    k TEXT PRIMARY KEY,
    v TEXT NOT NULL
);
"#,
        )?;

        self.conn.execute(
            "INSERT INTO client_state(k, v) VALUES('client_id', ?1)
             ON CONFLICT(k) DO NOTHING",
            params![Uuid::new_v4().to_string()],
        )?;
        self.conn.execute(
            "INSERT INTO client_state(k, v) VALUES('last_seen_server_version', '-1')
             ON CONFLICT(k) DO NOTHING",
            [],
        )?;
        self.conn.execute(
            "INSERT INTO client_state(k, v) VALUES('logical_clock', '-1')
             ON CONFLICT(k) DO NOTHING",
            [],
        )?;
        Ok(())
    }

    pub fn transaction(&self, stores: Stores, mode: TxMode) -> Result<ScopedTransaction<'c>> {
        let tx = self.conn.unchecked_transaction()?;
        Ok(ScopedTransaction { tx, stores, mode })
    }

    // ---- rows ---------------------------------------------------------

    /// Invariant-enforcing save: a row with empty fields and no tombstone
    /// is deleted rather than stored (§4.2 "one behavior-critical rule").
    pub fn save_row(
        &self,
        scope: &ScopedTransaction<'_>,
        table: &str,
        row_key: &str,
        row: &OrMapRow,
    ) -> Result<()> {
        scope.require(Stores::ROWS, "rows", TxMode::ReadWrite)?;
        if row.is_empty() {
            scope.tx.execute(
                "DELETE FROM rows WHERE table_name = ?1 AND row_key = ?2",
                params![table, row_key],
            )?;
            return Ok(());
        }
        let data = serde_json::to_string(row)?;
        scope.tx.execute(
            "INSERT INTO rows(table_name, row_key, data) VALUES(?1, ?2, ?3)
             ON CONFLICT(table_name, row_key) DO UPDATE SET data = excluded.data",
            params![table, row_key, data],
        )?;
        Ok(())
    }

    pub fn get_row(
        &self,
        scope: &ScopedTransaction<'_>,
        table: &str,
        row_key: &str,
    ) -> Result<OrMapRow> {
        scope.require(Stores::ROWS, "rows", TxMode::ReadOnly)?;
        let data: Option<String> = scope
            .tx
            .query_row(
                "SELECT data FROM rows WHERE table_name = ?1 AND row_key = ?2",
                params![table, row_key],
                |r| r.get(0),
            )
            .optional()?;
        match data {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(OrMapRow::new()),
        }
    }

    /// Uses the `by_table` index; rows are never stored empty, so every
    /// result already has at least one live field.
    pub fn get_all_rows(
        &self,
        scope: &ScopedTransaction<'_>,
        table: &str,
    ) -> Result<Vec<(String, OrMapRow)>> {
        scope.require(Stores::ROWS, "rows", TxMode::ReadOnly)?;
        let mut stmt = scope
            .tx
            .prepare("SELECT row_key, data FROM rows WHERE table_name = ?1 ORDER BY row_key")?;
        let rows = stmt.query_map(params![table], |r| {
            let row_key: String = r.get(0)?;
            let data: String = r.get(1)?;
            Ok((row_key, data))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (row_key, data) = row?;
            out.push((row_key, serde_json::from_str(&data)?));
        }
        Ok(out)
    }

    // ---- operations -----------------------------------------------------

    pub fn append_operation(
        &self,
        scope: &ScopedTransaction<'_>,
        op: &CrdtOperation,
        synced: bool,
    ) -> Result<()> {
        scope.require(Stores::OPERATIONS, "operations", TxMode::ReadWrite)?;
        let dot = op.dot();
        let payload = serde_json::to_string(op)?;
        scope.tx.execute(
            "INSERT INTO operations(client_id, version, op, synced) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(client_id, version) DO NOTHING",
            params![dot.client_id, dot.version, payload, synced as i64],
        )?;
        Ok(())
    }

    /// Idempotent: marking an unknown or already-synced operation is a no-op.
    /// There is no path back to unsynced.
    pub fn mark_synced(&self, scope: &ScopedTransaction<'_>, dot: &Dot) -> Result<()> {
        scope.require(Stores::OPERATIONS, "operations", TxMode::ReadWrite)?;
        scope.tx.execute(
            "UPDATE operations SET synced = 1 WHERE client_id = ?1 AND version = ?2",
            params![dot.client_id, dot.version],
        )?;
        Ok(())
    }

    /// Uses the compound `(client_id, synced)` index; must not scan the
    /// full log.
    pub fn get_unsynced_operations(
        &self,
        scope: &ScopedTransaction<'_>,
        client_id: &str,
        limit: i64,
    ) -> Result<Vec<CrdtOperation>> {
        scope.require(Stores::OPERATIONS, "operations", TxMode::ReadOnly)?;
        let mut stmt = scope.tx.prepare(
            "SELECT op FROM operations
             WHERE client_id = ?1 AND synced = 0
             ORDER BY version ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![client_id, limit], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }

    // ---- client_state ---------------------------------------------------

    pub fn get_client_state(&self, scope: &ScopedTransaction<'_>) -> Result<ClientState> {
        scope.require(Stores::CLIENT_STATE, "client_state", TxMode::ReadOnly)?;
        let client_id = self.read_label(scope, "client_id")?;
        let last_seen_server_version: i64 = self
            .read_label(scope, "last_seen_server_version")?
            .parse()
            .map_err(|_| SyncError::State("corrupt last_seen_server_version"))?;
        Ok(ClientState {
            client_id,
            last_seen_server_version,
        })
    }

    pub fn set_last_seen_server_version(
        &self,
        scope: &ScopedTransaction<'_>,
        version: i64,
    ) -> Result<()> {
        scope.require(Stores::CLIENT_STATE, "client_state", TxMode::ReadWrite)?;
        self.write_label(scope, "last_seen_server_version", &version.to_string())
    }

    /// Rejects values `< -1` as corruption, per §4.2.
    pub fn get_logical_clock(&self, scope: &ScopedTransaction<'_>) -> Result<i64> {
        scope.require(Stores::CLIENT_STATE, "client_state", TxMode::ReadOnly)?;
        let raw = self.read_label(scope, "logical_clock")?;
        let value: i64 = raw
            .parse()
            .map_err(|_| SyncError::State("corrupt logical_clock"))?;
        if value < -1 {
            return Err(SyncError::ClockCorruption(value));
        }
        Ok(value)
    }

    pub fn set_logical_clock(&self, scope: &ScopedTransaction<'_>, value: i64) -> Result<()> {
        scope.require(Stores::CLIENT_STATE, "client_state", TxMode::ReadWrite)?;
        self.write_label(scope, "logical_clock", &value.to_string())
    }

    fn read_label(&self, scope: &ScopedTransaction<'_>, key: &str) -> Result<String> {
        Ok(scope
            .tx
            .query_row("SELECT v FROM client_state WHERE k = ?1", params![key], |r| {
                r.get(0)
            })?)
    }

    fn write_label(&self, scope: &ScopedTransaction<'_>, key: &str, value: &str) -> Result<()> {
        scope.tx.execute(
            "INSERT INTO client_state(k, v) VALUES(?1, ?2)
             ON CONFLICT(k) DO UPDATE SET v = excluded.v",
            params![key, value],
        )?;
        Ok(())
    }
}
