//! Pure CRDT merge semantics: `apply(row, op)`.
//!
//! No I/O, no suspension points — the sync engine and facade are the only
//! callers, and both hold a transaction open while this runs.

use std::cmp::Ordering;

use crate::error::{Result, SyncError};
use crate::model::{Context, CrdtOperation, Dot, LwwField, OrMapRow};

/// Apply one operation to a row, returning the resulting row.
///
/// Deterministic and total: running the same operation against the same
/// row twice yields the same row (idempotence), and the result does not
/// depend on map iteration order.
pub fn apply(mut row: OrMapRow, op: &CrdtOperation) -> Result<OrMapRow> {
    validate(op)?;
    match op {
        CrdtOperation::Set {
            field, value, dot, ..
        } => {
            apply_set(&mut row, field, value, dot);
        }
        CrdtOperation::SetRow { value, dot, .. } => {
            for (field, value) in value {
                apply_set(&mut row, field, value, dot);
            }
        }
        CrdtOperation::Remove { dot, context, .. } => {
            apply_remove(&mut row, dot, context);
        }
    }
    Ok(row)
}

fn validate(op: &CrdtOperation) -> Result<()> {
    if op.dot().version < 0 {
        return Err(SyncError::InvalidOperation(format!(
            "negative dot version: {}",
            op.dot().version
        )));
    }
    if let CrdtOperation::Set { field, .. } = op {
        if field.is_empty() {
            return Err(SyncError::InvalidOperation(
                "set operation missing field".into(),
            ));
        }
    }
    Ok(())
}

/// A write is suppressed if a tombstone exists and the dot's version does
/// not exceed the high-water mark the tombstone recorded for that client.
fn is_suppressed(row: &OrMapRow, dot: &Dot) -> bool {
    match &row.tombstone {
        Some(tombstone) => match tombstone.context.get(&dot.client_id) {
            Some(&observed) => dot.version <= observed,
            None => false,
        },
        None => false,
    }
}

fn apply_set(row: &mut OrMapRow, field: &str, value: &serde_json::Value, dot: &Dot) {
    if is_suppressed(row, dot) {
        return;
    }
    match row.fields.get(field) {
        None => {
            row.fields.insert(
                field.to_string(),
                LwwField {
                    value: value.clone(),
                    dot: dot.clone(),
                },
            );
        }
        Some(existing) => match dot.cmp(&existing.dot) {
            Ordering::Greater => {
                row.fields.insert(
                    field.to_string(),
                    LwwField {
                        value: value.clone(),
                        dot: dot.clone(),
                    },
                );
            }
            Ordering::Equal => {
                if compare_values(value, &existing.value) == Ordering::Greater {
                    row.fields.insert(
                        field.to_string(),
                        LwwField {
                            value: value.clone(),
                            dot: dot.clone(),
                        },
                    );
                }
            }
            Ordering::Less => {}
        },
    }
}

fn apply_remove(row: &mut OrMapRow, dot: &Dot, context: &Context) {
    let (final_dot, final_context) = match &row.tombstone {
        Some(existing) => {
            let winning_dot = if dot > &existing.dot {
                dot.clone()
            } else {
                existing.dot.clone()
            };
            let mut merged = existing.context.clone();
            for (client_id, version) in context {
                merged
                    .entry(client_id.clone())
                    .and_modify(|v| {
                        if *version > *v {
                            *v = *version;
                        }
                    })
                    .or_insert(*version);
            }
            (winning_dot, merged)
        }
        None => (dot.clone(), context.clone()),
    };

    // Resurrection: keep any field whose writer's version exceeds what the
    // merged context observed for that writer.
    row.fields.retain(|_, f| match final_context.get(&f.dot.client_id) {
        Some(&observed) => f.dot.version > observed,
        None => true,
    });

    row.tombstone = Some(crate::model::Tombstone {
        dot: final_dot,
        context: final_context,
    });
}

/// Deterministic total order over arbitrary JSON values, used only to break
/// ties between writes sharing an identical dot. Not meant to carry any
/// semantic meaning beyond "stable and total."
fn compare_values(a: &serde_json::Value, b: &serde_json::Value) -> Ordering {
    let a = serde_json::to_string(a).unwrap_or_default();
    let b = serde_json::to_string(b).unwrap_or_default();
    a.cmp(&b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Tombstone;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn set(field: &str, value: serde_json::Value, client: &str, version: i64) -> CrdtOperation {
        CrdtOperation::Set {
            table: "t".into(),
            row_key: "r".into(),
            field: field.into(),
            value,
            dot: Dot::new(client, version),
        }
    }

    fn remove(client: &str, version: i64, context: &[(&str, i64)]) -> CrdtOperation {
        CrdtOperation::Remove {
            table: "t".into(),
            row_key: "r".into(),
            dot: Dot::new(client, version),
            context: context
                .iter()
                .map(|(c, v)| (c.to_string(), *v))
                .collect(),
        }
    }

    #[test]
    fn s1_lww_resolution() {
        let row = OrMapRow::new();
        let row = apply(row, &set("n", json!("A"), "c1", 1)).unwrap();
        let row = apply(row, &set("n", json!("B"), "c1", 2)).unwrap();
        let field = &row.fields["n"];
        assert_eq!(field.value, json!("B"));
        assert_eq!(field.dot, Dot::new("c1", 2));
    }

    #[test]
    fn s2_tie_break_by_client_id() {
        let mut row = OrMapRow::new();
        row.fields.insert(
            "n".into(),
            LwwField {
                value: json!("A"),
                dot: Dot::new("c1", 5),
            },
        );
        let row = apply(row, &set("n", json!("B"), "c2", 5)).unwrap();
        let field = &row.fields["n"];
        assert_eq!(field.value, json!("B"));
        assert_eq!(field.dot, Dot::new("c2", 5));
    }

    #[test]
    fn s3_observed_remove_wins_and_suppresses_replay() {
        let row = OrMapRow::new();
        let row = apply(row, &set("n", json!("A"), "c1", 3)).unwrap();
        let row = apply(row, &remove("c1", 10, &[("c1", 5)])).unwrap();
        // replay of the original (already-observed) write must not resurrect it
        let row = apply(row, &set("n", json!("A"), "c1", 3)).unwrap();

        assert!(!row.fields.contains_key("n"));
        assert_eq!(row.tombstone.as_ref().unwrap().context["c1"], 5);
    }

    #[test]
    fn s4_resurrection_after_remove() {
        let row = OrMapRow::new();
        let row = apply(row, &set("n", json!("A"), "c1", 3)).unwrap();
        let row = apply(row, &remove("c1", 10, &[("c1", 5)])).unwrap();
        let row = apply(row, &set("n", json!("Z"), "c1", 6)).unwrap();

        let field = &row.fields["n"];
        assert_eq!(field.value, json!("Z"));
        assert_eq!(field.dot, Dot::new("c1", 6));
        assert!(row.tombstone.is_some());
    }

    #[test]
    fn s5_concurrent_tombstone_merge() {
        let row = OrMapRow::new();
        let row = apply(row, &remove("c1", 10, &[("c1", 5), ("c2", 2)])).unwrap();
        let row = apply(row, &remove("c2", 9, &[("c1", 4), ("c2", 7)])).unwrap();

        let tombstone = row.tombstone.unwrap();
        assert_eq!(tombstone.dot, Dot::new("c1", 10));
        assert_eq!(tombstone.context["c1"], 5);
        assert_eq!(tombstone.context["c2"], 7);
    }

    #[test]
    fn idempotence_applying_same_set_twice() {
        let row = OrMapRow::new();
        let once = apply(row.clone(), &set("n", json!("A"), "c1", 1)).unwrap();
        let twice = apply(once.clone(), &set("n", json!("A"), "c1", 1)).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn set_row_applies_all_fields_with_shared_dot() {
        let mut value = BTreeMap::new();
        value.insert("a".to_string(), json!(1));
        value.insert("b".to_string(), json!(2));
        let op = CrdtOperation::SetRow {
            table: "t".into(),
            row_key: "r".into(),
            value,
            dot: Dot::new("c1", 1),
        };
        let row = apply(OrMapRow::new(), &op).unwrap();
        assert_eq!(row.fields["a"].value, json!(1));
        assert_eq!(row.fields["b"].value, json!(2));
        assert_eq!(row.fields["a"].dot, row.fields["b"].dot);
    }

    #[test]
    fn negative_version_is_rejected() {
        let row = OrMapRow::new();
        let err = apply(row, &set("n", json!("A"), "c1", -1)).unwrap_err();
        assert!(matches!(err, SyncError::InvalidOperation(_)));
    }

    #[test]
    fn empty_field_name_is_rejected() {
        let row = OrMapRow::new();
        let err = apply(row, &set("", json!("A"), "c1", 1)).unwrap_err();
        assert!(matches!(err, SyncError::InvalidOperation(_)));
    }

    #[test]
    fn remove_without_existing_tombstone_uses_its_own_context() {
        let row = OrMapRow::new();
        let row = apply(row, &remove("c1", 1, &[("c1", 0)])).unwrap();
        let tombstone = row.tombstone.unwrap();
        assert_eq!(tombstone.dot, Dot::new("c1", 1));
        assert_eq!(tombstone.context, Tombstone {
            dot: Dot::new("c1", 1),
            context: [("c1".to_string(), 0)].into_iter().collect(),
        }.context);
    }
}
