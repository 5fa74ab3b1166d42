//! Database Facade (C4): the only surface application code talks to.
//!
//! Each method is one `readwrite` transaction over `client_state`, `rows`,
//! and `operations`: read the current row, mint a dot, apply the CRDT
//! operation in memory, persist the resulting row, log the operation as
//! unsynced, and commit.

use std::collections::BTreeMap;

use crate::clock::LogicalClock;
use crate::crdt;
use crate::error::Result;
use crate::model::{ClientState, Context, CrdtOperation, Dot, OrMapRow};
use crate::repository::{Repository, Stores, TxMode};

pub struct Database<'c> {
    repo: Repository<'c>,
}

impl<'c> Database<'c> {
    pub fn open(conn: &'c rusqlite::Connection) -> Result<Self> {
        let repo = Repository::new(conn);
        repo.init_schema()?;
        Ok(Self { repo })
    }

    fn scope(&self) -> Result<crate::repository::ScopedTransaction<'c>> {
        self.repo.transaction(
            Stores::CLIENT_STATE | Stores::ROWS | Stores::OPERATIONS,
            TxMode::ReadWrite,
        )
    }

    pub fn client_state(&self) -> Result<ClientState> {
        let scope = self.repo.transaction(Stores::CLIENT_STATE, TxMode::ReadOnly)?;
        self.repo.get_client_state(&scope)
    }

    pub fn set_cell(
        &self,
        table: &str,
        row_key: &str,
        field: &str,
        value: serde_json::Value,
    ) -> Result<Dot> {
        let scope = self.scope()?;
        let state = self.repo.get_client_state(&scope)?;
        let version = LogicalClock::tick(&self.repo, &scope)?;
        let dot = Dot::new(state.client_id, version);

        let op = CrdtOperation::Set {
            table: table.to_string(),
            row_key: row_key.to_string(),
            field: field.to_string(),
            value,
            dot: dot.clone(),
        };

        let row = self.repo.get_row(&scope, table, row_key)?;
        let row = crdt::apply(row, &op)?;
        self.repo.save_row(&scope, table, row_key, &row)?;
        self.repo.append_operation(&scope, &op, false)?;
        scope.commit()?;
        Ok(dot)
    }

    pub fn set_row(
        &self,
        table: &str,
        row_key: &str,
        fields: BTreeMap<String, serde_json::Value>,
    ) -> Result<Dot> {
        let scope = self.scope()?;
        let state = self.repo.get_client_state(&scope)?;
        let version = LogicalClock::tick(&self.repo, &scope)?;
        let dot = Dot::new(state.client_id, version);

        let op = CrdtOperation::SetRow {
            table: table.to_string(),
            row_key: row_key.to_string(),
            value: fields,
            dot: dot.clone(),
        };

        let row = self.repo.get_row(&scope, table, row_key)?;
        let row = crdt::apply(row, &op)?;
        self.repo.save_row(&scope, table, row_key, &row)?;
        self.repo.append_operation(&scope, &op, false)?;
        scope.commit()?;
        Ok(dot)
    }

    /// `None` when the row has no live fields (never written, or fully
    /// removed and not resurrected).
    pub fn get(&self, table: &str, row_key: &str) -> Result<Option<BTreeMap<String, serde_json::Value>>> {
        let scope = self.repo.transaction(Stores::ROWS, TxMode::ReadOnly)?;
        let row = self.repo.get_row(&scope, table, row_key)?;
        Ok(live_fields(&row))
    }

    pub fn delete_row(&self, table: &str, row_key: &str) -> Result<Dot> {
        let scope = self.scope()?;
        let state = self.repo.get_client_state(&scope)?;
        let version = LogicalClock::tick(&self.repo, &scope)?;
        let dot = Dot::new(state.client_id, version);

        let row = self.repo.get_row(&scope, table, row_key)?;
        let context: Context = row
            .fields
            .values()
            .fold(Context::new(), |mut ctx, field| {
                ctx.entry(field.dot.client_id.clone())
                    .and_modify(|v| {
                        if field.dot.version > *v {
                            *v = field.dot.version;
                        }
                    })
                    .or_insert(field.dot.version);
                ctx
            });

        let op = CrdtOperation::Remove {
            table: table.to_string(),
            row_key: row_key.to_string(),
            dot: dot.clone(),
            context,
        };

        let row = crdt::apply(row, &op)?;
        self.repo.save_row(&scope, table, row_key, &row)?;
        self.repo.append_operation(&scope, &op, false)?;
        scope.commit()?;
        Ok(dot)
    }

    pub fn get_all_rows(
        &self,
        table: &str,
    ) -> Result<Vec<(String, BTreeMap<String, serde_json::Value>)>> {
        let scope = self.repo.transaction(Stores::ROWS, TxMode::ReadOnly)?;
        let rows = self.repo.get_all_rows(&scope, table)?;
        Ok(rows
            .into_iter()
            .filter_map(|(key, row)| live_fields(&row).map(|fields| (key, fields)))
            .collect())
    }
}

fn live_fields(row: &OrMapRow) -> Option<BTreeMap<String, serde_json::Value>> {
    if !row.is_live() {
        return None;
    }
    Some(
        row.fields
            .iter()
            .map(|(k, f)| (k.clone(), f.value.clone()))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;
    use serde_json::json;

    #[test]
    fn set_then_get_round_trips() {
        let conn = Connection::open_in_memory().unwrap();
        let db = Database::open(&conn).unwrap();
        db.set_cell("widgets", "w1", "name", json!("Gadget")).unwrap();
        let row = db.get("widgets", "w1").unwrap().unwrap();
        assert_eq!(row["name"], json!("Gadget"));
    }

    #[test]
    fn delete_then_get_returns_none() {
        let conn = Connection::open_in_memory().unwrap();
        let db = Database::open(&conn).unwrap();
        db.set_cell("widgets", "w1", "name", json!("Gadget")).unwrap();
        db.delete_row("widgets", "w1").unwrap();
        assert!(db.get("widgets", "w1").unwrap().is_none());
    }

    #[test]
    fn set_row_after_delete_resurrects() {
        let conn = Connection::open_in_memory().unwrap();
        let db = Database::open(&conn).unwrap();
        db.set_cell("widgets", "w1", "name", json!("Gadget")).unwrap();
        db.delete_row("widgets", "w1").unwrap();

        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), json!("Widget II"));
        db.set_row("widgets", "w1", fields).unwrap();

        let row = db.get("widgets", "w1").unwrap().unwrap();
        assert_eq!(row["name"], json!("Widget II"));
    }

    #[test]
    fn get_all_rows_skips_deleted_rows() {
        let conn = Connection::open_in_memory().unwrap();
        let db = Database::open(&conn).unwrap();
        db.set_cell("widgets", "w1", "name", json!("A")).unwrap();
        db.set_cell("widgets", "w2", "name", json!("B")).unwrap();
        db.delete_row("widgets", "w2").unwrap();

        let all = db.get_all_rows("widgets").unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, "w1");
    }

    #[test]
    fn local_writes_are_logged_unsynced() {
        let conn = Connection::open_in_memory().unwrap();
        let db = Database::open(&conn).unwrap();
        db.set_cell("widgets", "w1", "name", json!("A")).unwrap();

        let state = db.client_state().unwrap();
        let scope = db
            .repo
            .transaction(Stores::OPERATIONS, TxMode::ReadOnly)
            .unwrap();
        let unsynced = db
            .repo
            .get_unsynced_operations(&scope, &state.client_id, 10)
            .unwrap();
        assert_eq!(unsynced.len(), 1);
    }
}
