//! Bit-exact request/response hashing (§6). Both replica and server must
//! compute identical digests, so every formatting choice here is load-bearing.

use sha2::{Digest, Sha256};

use crate::model::{ClientId, CrdtOperation, Dot};

/// `JSON.stringify`-equivalent: serialize with object keys in the order
/// they were received. Requires `serde_json`'s `preserve_order` feature so
/// that `Value::Object` is backed by an `IndexMap` rather than a `BTreeMap`.
fn canonical_json(value: &serde_json::Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

fn digest_hex(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parts.join("|").as_bytes());
    hex::encode(hasher.finalize())
}

/// Request parts per §6: clientId, lastSeenServerVersion, then per operation
/// rowKey, table, type, value, valueKey, dot.version, dot.clientId.
pub fn request_hash(
    client_id: &ClientId,
    last_seen_server_version: i64,
    operations: &[CrdtOperation],
) -> String {
    let mut parts: Vec<String> = Vec::with_capacity(2 + operations.len() * 6);
    parts.push(client_id.clone());
    parts.push(last_seen_server_version.to_string());

    for op in operations {
        let (value, value_key) = match op {
            CrdtOperation::Set { value, field, .. } => (canonical_json(value), field.clone()),
            CrdtOperation::SetRow { value, .. } => {
                (canonical_json(&serde_json::to_value(value).unwrap_or(serde_json::Value::Null)), "null".to_string())
            }
            CrdtOperation::Remove { .. } => ("null".to_string(), "null".to_string()),
        };
        parts.push(op.row_key().to_string());
        parts.push(op.table().to_string());
        parts.push(op.kind().to_string());
        parts.push(value);
        parts.push(value_key);
        parts.push(op.dot().version.to_string());
        parts.push(op.dot().client_id.clone());
    }

    let refs: Vec<&str> = parts.iter().map(String::as_str).collect();
    digest_hex(&refs)
}

/// Response parts per §6: baseServerVersion, latestServerVersion, then per
/// operation type/table/rowKey/dot.clientId/dot.version plus variant-specific
/// fields, then per synced dot clientId/version.
pub fn response_hash(
    base_server_version: i64,
    latest_server_version: i64,
    operations: &[CrdtOperation],
    synced_operations: &[Dot],
) -> String {
    let mut parts: Vec<String> = Vec::new();
    parts.push(base_server_version.to_string());
    parts.push(latest_server_version.to_string());

    for op in operations {
        parts.push(op.kind().to_string());
        parts.push(op.table().to_string());
        parts.push(op.row_key().to_string());
        parts.push(op.dot().client_id.clone());
        parts.push(op.dot().version.to_string());

        match op {
            CrdtOperation::Set { field, value, .. } => {
                parts.push(field.clone());
                parts.push(canonical_json(value));
            }
            CrdtOperation::SetRow { value, .. } => {
                parts.push("null".to_string());
                parts.push(canonical_json(
                    &serde_json::to_value(value).unwrap_or(serde_json::Value::Null),
                ));
            }
            CrdtOperation::Remove { context, .. } => {
                parts.push("null".to_string());
                parts.push("null".to_string());
                let mut keys: Vec<&String> = context.keys().collect();
                keys.sort();
                for key in keys {
                    parts.push(key.clone());
                    parts.push(context[key].to_string());
                }
            }
        }
    }

    for dot in synced_operations {
        parts.push(dot.client_id.clone());
        parts.push(dot.version.to_string());
    }

    let refs: Vec<&str> = parts.iter().map(String::as_str).collect();
    digest_hex(&refs)
}
