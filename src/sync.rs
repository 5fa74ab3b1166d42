//! Sync Engine (C5): the client side of the sequencing protocol (§4.3, §6, §7).
//!
//! `build_request` reads unsynced local operations and the client's sync
//! cursor into a hashed [`SyncRequest`]; `apply_response` validates a
//! server's [`SyncResponse`], merges its operations into local state, and
//! advances the cursor — all inside one transaction that is aborted
//! wholesale on any failure.

use std::collections::HashMap;

use log::{debug, error, warn};

use crate::clock::LogicalClock;
use crate::crdt;
use crate::error::{Result, SyncError};
use crate::model::CrdtOperation;
use crate::repository::{Repository, Stores, TxMode};
use crate::transport::SyncTransport;
use crate::wire::{SyncRequest, SyncResponse};

/// Outcome of applying one server response. A stale response is a
/// successful no-op per §7 ("ordering drops... return success with no
/// state changes"), not an error — the caller simply retries on its next
/// tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Applied,
    Stale,
}

pub struct SyncEngine<'c> {
    repo: Repository<'c>,
}

impl<'c> SyncEngine<'c> {
    pub fn new(conn: &'c rusqlite::Connection) -> Result<Self> {
        let repo = Repository::new(conn);
        repo.init_schema()?;
        Ok(Self { repo })
    }

    /// Build a hashed request carrying up to `batch_limit` unsynced
    /// operations. Does not mutate local state.
    pub fn build_request(&self, batch_limit: i64) -> Result<SyncRequest> {
        let scope = self
            .repo
            .transaction(Stores::CLIENT_STATE | Stores::OPERATIONS, TxMode::ReadOnly)?;
        let state = self.repo.get_client_state(&scope)?;
        let operations = self
            .repo
            .get_unsynced_operations(&scope, &state.client_id, batch_limit)?;
        let request_hash = crate::hash::request_hash(
            &state.client_id,
            state.last_seen_server_version,
            &operations,
        );
        Ok(SyncRequest {
            client_id: state.client_id,
            last_seen_server_version: state.last_seen_server_version,
            operations,
            request_hash,
        })
    }

    /// Run one full cycle: build a request, send it, and apply whatever
    /// comes back.
    pub fn sync_cycle(&self, transport: &dyn SyncTransport, batch_limit: i64) -> Result<SyncOutcome> {
        let request = self.build_request(batch_limit)?;
        let response = transport.send(&request)?;
        self.apply_response(&response)
    }

    /// Validate and merge a server response (§7).
    ///
    /// A hash mismatch is fatal: the transaction is explicitly aborted and
    /// the error logged and returned. A stale `baseServerVersion` is a
    /// successful no-op (§7 "ordering drops"): nothing is mutated and
    /// [`SyncOutcome::Stale`] is returned.
    pub fn apply_response(&self, response: &SyncResponse) -> Result<SyncOutcome> {
        let scope = self.repo.transaction(
            Stores::CLIENT_STATE | Stores::ROWS | Stores::OPERATIONS,
            TxMode::ReadWrite,
        )?;

        let outcome = match self.apply_response_inner(&scope, response) {
            Ok(outcome) => outcome,
            Err(err) => {
                error!("aborting sync transaction: {err}");
                scope.abort()?;
                return Err(err);
            }
        };

        scope.commit()?;
        if outcome == SyncOutcome::Applied {
            debug!(
                "sync applied: base={} latest={} ops={} synced={}",
                response.base_server_version,
                response.latest_server_version,
                response.operations.len(),
                response.synced_operations.len()
            );
        }
        Ok(outcome)
    }

    fn apply_response_inner(
        &self,
        scope: &crate::repository::ScopedTransaction<'c>,
        response: &SyncResponse,
    ) -> Result<SyncOutcome> {
        if !response.hash_is_valid() {
            error!("sync response failed integrity check");
            return Err(SyncError::IntegrityMismatch {
                expected: response.response_hash.clone(),
                actual: crate::hash::response_hash(
                    response.base_server_version,
                    response.latest_server_version,
                    &response.operations,
                    &response.synced_operations,
                ),
            });
        }

        let state = self.repo.get_client_state(scope)?;
        if response.base_server_version != state.last_seen_server_version {
            warn!(
                "stale sync response: base={} local={}",
                response.base_server_version, state.last_seen_server_version
            );
            return Ok(SyncOutcome::Stale);
        }

        // Batched merge (§4.3 step 4): group by (table, row_key) so each
        // row is loaded and saved once, folding every op in arrival order.
        let mut group_order: Vec<(&str, &str)> = Vec::new();
        let mut groups: HashMap<(&str, &str), Vec<&CrdtOperation>> = HashMap::new();
        for op in &response.operations {
            let key = (op.table(), op.row_key());
            groups.entry(key).or_insert_with(|| {
                group_order.push(key);
                Vec::new()
            }).push(op);
        }
        for key in group_order {
            let (table, row_key) = key;
            let ops = &groups[&key];
            let mut row = self.repo.get_row(scope, table, row_key)?;
            for op in ops {
                row = crdt::apply(row, op)?;
            }
            self.repo.save_row(scope, table, row_key, &row)?;
        }

        for op in &response.operations {
            self.repo.append_operation(scope, op, true)?;
        }

        for dot in &response.synced_operations {
            self.repo.mark_synced(scope, dot)?;
        }

        self.repo
            .set_last_seen_server_version(scope, response.latest_server_version)?;
        if let Some(max_version) = response.operations.iter().map(|op| op.dot().version).max() {
            LogicalClock::sync(&self.repo, scope, max_version)?;
        }

        Ok(SyncOutcome::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CrdtOperation, Dot};
    use crate::transport::test_support::ScriptedTransport;
    use rusqlite::Connection;
    use serde_json::json;

    fn engine(conn: &Connection) -> SyncEngine<'_> {
        SyncEngine::new(conn).unwrap()
    }

    #[test]
    fn build_request_carries_unsynced_operations_and_a_valid_hash() {
        let conn = Connection::open_in_memory().unwrap();
        let db = crate::facade::Database::open(&conn).unwrap();
        db.set_cell("widgets", "w1", "name", json!("A")).unwrap();

        let engine = engine(&conn);
        let request = engine.build_request(10).unwrap();
        assert_eq!(request.operations.len(), 1);
        assert!(request.hash_is_valid());
    }

    #[test]
    fn stale_response_is_a_successful_no_op() {
        let conn = Connection::open_in_memory().unwrap();
        let db = crate::facade::Database::open(&conn).unwrap();
        let engine = engine(&conn);

        let op = CrdtOperation::Set {
            table: "widgets".into(),
            row_key: "w1".into(),
            field: "name".into(),
            value: json!("server-write"),
            dot: Dot::new("server-origin", 0),
        };
        let response = crate::wire::SyncResponse {
            base_server_version: 5,
            latest_server_version: 6,
            operations: vec![op],
            synced_operations: vec![],
            response_hash: String::new(),
        };
        let response = crate::wire::SyncResponse {
            response_hash: crate::hash::response_hash(
                response.base_server_version,
                response.latest_server_version,
                &response.operations,
                &response.synced_operations,
            ),
            ..response
        };

        let outcome = engine.apply_response(&response).unwrap();
        assert_eq!(outcome, SyncOutcome::Stale);
        assert!(db.get("widgets", "w1").unwrap().is_none());
        let state = db.client_state().unwrap();
        assert_eq!(state.last_seen_server_version, -1);
    }

    #[test]
    fn hash_mismatch_is_fatal() {
        let conn = Connection::open_in_memory().unwrap();
        let engine = engine(&conn);
        let response = crate::wire::SyncResponse {
            base_server_version: -1,
            latest_server_version: 1,
            operations: vec![],
            synced_operations: vec![],
            response_hash: "not-a-real-hash".into(),
        };
        let err = engine.apply_response(&response).unwrap_err();
        assert!(matches!(err, SyncError::IntegrityMismatch { .. }));
    }

    #[test]
    fn successful_sync_applies_ops_marks_synced_and_advances_cursor() {
        let conn = Connection::open_in_memory().unwrap();
        let db = crate::facade::Database::open(&conn).unwrap();
        let local_dot = db.set_cell("widgets", "w1", "name", json!("local")).unwrap();

        let engine = engine(&conn);
        let remote_op = CrdtOperation::Set {
            table: "widgets".into(),
            row_key: "w2".into(),
            field: "name".into(),
            value: json!("remote"),
            dot: Dot::new("other-client", 0),
        };
        let synced = vec![local_dot.clone()];
        let mut response = crate::wire::SyncResponse {
            base_server_version: -1,
            latest_server_version: 10,
            operations: vec![remote_op],
            synced_operations: synced,
            response_hash: String::new(),
        };
        response.response_hash = crate::hash::response_hash(
            response.base_server_version,
            response.latest_server_version,
            &response.operations,
            &response.synced_operations,
        );

        engine.apply_response(&response).unwrap();

        let row = db.get("widgets", "w2").unwrap().unwrap();
        assert_eq!(row["name"], json!("remote"));

        let state = db.client_state().unwrap();
        assert_eq!(state.last_seen_server_version, 10);

        let request = engine.build_request(10).unwrap();
        assert!(request.operations.is_empty());

        // the received op itself is retained in the log, marked synced.
        let scope = engine
            .repo
            .transaction(Stores::OPERATIONS, TxMode::ReadOnly)
            .unwrap();
        let remote_unsynced = engine
            .repo
            .get_unsynced_operations(&scope, "other-client", 10)
            .unwrap();
        assert!(remote_unsynced.is_empty());
    }

    #[test]
    fn sync_cycle_drives_transport_and_applies_result() {
        let conn = Connection::open_in_memory().unwrap();
        let engine = engine(&conn);

        let response = crate::wire::SyncResponse {
            base_server_version: -1,
            latest_server_version: 1,
            operations: vec![],
            synced_operations: vec![],
            response_hash: String::new(),
        };
        let response = crate::wire::SyncResponse {
            response_hash: crate::hash::response_hash(-1, 1, &[], &[]),
            ..response
        };
        let transport = ScriptedTransport::new(vec![Ok(response)]);

        engine.sync_cycle(&transport, 50).unwrap();
        assert_eq!(transport.requests().len(), 1);
    }
}
