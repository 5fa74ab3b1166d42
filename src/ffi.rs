//! C ABI surface for embedding hosts (Swift/Kotlin/etc.) that cannot link
//! the Rust crate directly. Every entry point takes or returns JSON over a
//! C string; callers free returned strings with `sync_string_free`.

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};

use crate::error::SyncError;
use crate::facade::Database;
use crate::sync::SyncEngine;

/// Opaque handle owning a SQLite connection. The host holds this as an
/// unsafe pointer and passes it back to every other entry point.
pub struct SyncConnHandle {
    conn: rusqlite::Connection,
}

thread_local! {
    static LAST_ERROR: RefCell<(i32, String)> = RefCell::new((0, String::new()));
}

fn set_last_error(code: i32, msg: &str) {
    LAST_ERROR.with(|le| *le.borrow_mut() = (code, msg.to_string()));
}

fn clear_last_error() {
    LAST_ERROR.with(|le| *le.borrow_mut() = (0, String::new()));
}

fn set_sync_error(err: &SyncError) {
    set_last_error(1, &err.to_string());
}

fn ptr_to_str<'a>(ptr: *const c_char) -> Result<&'a str, ()> {
    if ptr.is_null() {
        return Err(());
    }
    unsafe { CStr::from_ptr(ptr).to_str().map_err(|_| ()) }
}

fn to_cstring_ptr(s: &str) -> *mut c_char {
    CString::new(s).map(|cs| cs.into_raw()).unwrap_or(std::ptr::null_mut())
}

/// Free a C string returned by this library.
#[unsafe(no_mangle)]
pub extern "C" fn sync_string_free(s: *mut c_char) {
    if s.is_null() {
        return;
    }
    unsafe {
        let _ = CString::from_raw(s);
    }
}

/// Open a SQLite connection and run schema setup. Path may be a file path
/// or `:memory:`. Returns null on failure.
#[unsafe(no_mangle)]
pub extern "C" fn db_open(path: *const c_char) -> *mut SyncConnHandle {
    let path = match ptr_to_str(path) {
        Ok(s) => s,
        Err(_) => {
            set_last_error(4, "invalid path");
            return std::ptr::null_mut();
        }
    };
    let conn = match rusqlite::Connection::open(path) {
        Ok(conn) => conn,
        Err(e) => {
            set_last_error(1, &format!("sqlite: {e}"));
            return std::ptr::null_mut();
        }
    };
    if let Err(e) = crate::repository::Repository::new(&conn).init_schema() {
        set_sync_error(&e);
        return std::ptr::null_mut();
    }
    clear_last_error();
    Box::into_raw(Box::new(SyncConnHandle { conn }))
}

/// Close a previously opened connection.
#[unsafe(no_mangle)]
pub extern "C" fn db_close(handle: *mut SyncConnHandle) {
    if handle.is_null() {
        return;
    }
    unsafe {
        let _ = Box::from_raw(handle);
    }
}

/// Set a single cell. `value_json` is a JSON-encoded value. Returns the
/// newly assigned dot as JSON, or null on error.
#[unsafe(no_mangle)]
pub extern "C" fn db_set_cell(
    handle: *mut SyncConnHandle,
    table: *const c_char,
    row_key: *const c_char,
    field: *const c_char,
    value_json: *const c_char,
) -> *mut c_char {
    let h = match unsafe { handle.as_ref() } {
        Some(h) => h,
        None => {
            set_last_error(4, "null handle");
            return std::ptr::null_mut();
        }
    };
    let (table, row_key, field, value_json) = match (
        ptr_to_str(table),
        ptr_to_str(row_key),
        ptr_to_str(field),
        ptr_to_str(value_json),
    ) {
        (Ok(a), Ok(b), Ok(c), Ok(d)) => (a, b, c, d),
        _ => {
            set_last_error(4, "invalid argument");
            return std::ptr::null_mut();
        }
    };
    let value: serde_json::Value = match serde_json::from_str(value_json) {
        Ok(v) => v,
        Err(e) => {
            set_last_error(2, &format!("value_json: {e}"));
            return std::ptr::null_mut();
        }
    };
    let db = match Database::open(&h.conn) {
        Ok(db) => db,
        Err(e) => {
            set_sync_error(&e);
            return std::ptr::null_mut();
        }
    };
    match db.set_cell(table, row_key, field, value) {
        Ok(dot) => {
            clear_last_error();
            to_cstring_ptr(&serde_json::to_string(&dot).unwrap_or_default())
        }
        Err(e) => {
            set_sync_error(&e);
            std::ptr::null_mut()
        }
    }
}

/// Set every field of a row atomically. `fields_json` is a JSON object.
#[unsafe(no_mangle)]
pub extern "C" fn db_set_row(
    handle: *mut SyncConnHandle,
    table: *const c_char,
    row_key: *const c_char,
    fields_json: *const c_char,
) -> *mut c_char {
    let h = match unsafe { handle.as_ref() } {
        Some(h) => h,
        None => {
            set_last_error(4, "null handle");
            return std::ptr::null_mut();
        }
    };
    let (table, row_key, fields_json) = match (ptr_to_str(table), ptr_to_str(row_key), ptr_to_str(fields_json)) {
        (Ok(a), Ok(b), Ok(c)) => (a, b, c),
        _ => {
            set_last_error(4, "invalid argument");
            return std::ptr::null_mut();
        }
    };
    let fields: std::collections::BTreeMap<String, serde_json::Value> = match serde_json::from_str(fields_json) {
        Ok(v) => v,
        Err(e) => {
            set_last_error(2, &format!("fields_json: {e}"));
            return std::ptr::null_mut();
        }
    };
    let db = match Database::open(&h.conn) {
        Ok(db) => db,
        Err(e) => {
            set_sync_error(&e);
            return std::ptr::null_mut();
        }
    };
    match db.set_row(table, row_key, fields) {
        Ok(dot) => {
            clear_last_error();
            to_cstring_ptr(&serde_json::to_string(&dot).unwrap_or_default())
        }
        Err(e) => {
            set_sync_error(&e);
            std::ptr::null_mut()
        }
    }
}

/// Read a row. Returns a JSON object of its live fields, the literal
/// string `"null"` if the row has none, or null on error.
#[unsafe(no_mangle)]
pub extern "C" fn db_get(
    handle: *mut SyncConnHandle,
    table: *const c_char,
    row_key: *const c_char,
) -> *mut c_char {
    let h = match unsafe { handle.as_ref() } {
        Some(h) => h,
        None => {
            set_last_error(4, "null handle");
            return std::ptr::null_mut();
        }
    };
    let (table, row_key) = match (ptr_to_str(table), ptr_to_str(row_key)) {
        (Ok(a), Ok(b)) => (a, b),
        _ => {
            set_last_error(4, "invalid argument");
            return std::ptr::null_mut();
        }
    };
    let db = match Database::open(&h.conn) {
        Ok(db) => db,
        Err(e) => {
            set_sync_error(&e);
            return std::ptr::null_mut();
        }
    };
    match db.get(table, row_key) {
        Ok(Some(fields)) => {
            clear_last_error();
            to_cstring_ptr(&serde_json::to_string(&fields).unwrap_or_default())
        }
        Ok(None) => {
            clear_last_error();
            to_cstring_ptr("null")
        }
        Err(e) => {
            set_sync_error(&e);
            std::ptr::null_mut()
        }
    }
}

/// Remove a row. Returns the dot assigned to the removal as JSON.
#[unsafe(no_mangle)]
pub extern "C" fn db_delete_row(
    handle: *mut SyncConnHandle,
    table: *const c_char,
    row_key: *const c_char,
) -> *mut c_char {
    let h = match unsafe { handle.as_ref() } {
        Some(h) => h,
        None => {
            set_last_error(4, "null handle");
            return std::ptr::null_mut();
        }
    };
    let (table, row_key) = match (ptr_to_str(table), ptr_to_str(row_key)) {
        (Ok(a), Ok(b)) => (a, b),
        _ => {
            set_last_error(4, "invalid argument");
            return std::ptr::null_mut();
        }
    };
    let db = match Database::open(&h.conn) {
        Ok(db) => db,
        Err(e) => {
            set_sync_error(&e);
            return std::ptr::null_mut();
        }
    };
    match db.delete_row(table, row_key) {
        Ok(dot) => {
            clear_last_error();
            to_cstring_ptr(&serde_json::to_string(&dot).unwrap_or_default())
        }
        Err(e) => {
            set_sync_error(&e);
            std::ptr::null_mut()
        }
    }
}

/// Read every live row of a table as a JSON object keyed by row key.
#[unsafe(no_mangle)]
pub extern "C" fn db_get_all_rows_json(handle: *mut SyncConnHandle, table: *const c_char) -> *mut c_char {
    let h = match unsafe { handle.as_ref() } {
        Some(h) => h,
        None => {
            set_last_error(4, "null handle");
            return std::ptr::null_mut();
        }
    };
    let table = match ptr_to_str(table) {
        Ok(s) => s,
        Err(_) => {
            set_last_error(4, "invalid table");
            return std::ptr::null_mut();
        }
    };
    let db = match Database::open(&h.conn) {
        Ok(db) => db,
        Err(e) => {
            set_sync_error(&e);
            return std::ptr::null_mut();
        }
    };
    match db.get_all_rows(table) {
        Ok(rows) => {
            let map: std::collections::BTreeMap<_, _> = rows.into_iter().collect();
            clear_last_error();
            to_cstring_ptr(&serde_json::to_string(&map).unwrap_or_default())
        }
        Err(e) => {
            set_sync_error(&e);
            std::ptr::null_mut()
        }
    }
}

/// Build a hashed sync request carrying up to `batch_limit` unsynced
/// operations, as JSON.
#[unsafe(no_mangle)]
pub extern "C" fn db_build_sync_request_json(handle: *mut SyncConnHandle, batch_limit: i64) -> *mut c_char {
    let h = match unsafe { handle.as_ref() } {
        Some(h) => h,
        None => {
            set_last_error(4, "null handle");
            return std::ptr::null_mut();
        }
    };
    let engine = match SyncEngine::new(&h.conn) {
        Ok(e) => e,
        Err(e) => {
            set_sync_error(&e);
            return std::ptr::null_mut();
        }
    };
    match engine.build_request(batch_limit) {
        Ok(req) => {
            clear_last_error();
            to_cstring_ptr(&serde_json::to_string(&req).unwrap_or_default())
        }
        Err(e) => {
            set_sync_error(&e);
            std::ptr::null_mut()
        }
    }
}

/// Validate and merge a server's JSON-encoded sync response. Returns 0 on
/// success; any failure leaves local state exactly as it was.
#[unsafe(no_mangle)]
pub extern "C" fn db_apply_sync_response_json(handle: *mut SyncConnHandle, response_json: *const c_char) -> c_int {
    let h = match unsafe { handle.as_ref() } {
        Some(h) => h,
        None => {
            set_last_error(4, "null handle");
            return 2;
        }
    };
    let response_json = match ptr_to_str(response_json) {
        Ok(s) => s,
        Err(_) => {
            set_last_error(4, "invalid response_json");
            return 3;
        }
    };
    let response: crate::wire::SyncResponse = match serde_json::from_str(response_json) {
        Ok(v) => v,
        Err(e) => {
            set_last_error(2, &format!("response_json: {e}"));
            return 3;
        }
    };
    let engine = match SyncEngine::new(&h.conn) {
        Ok(e) => e,
        Err(e) => {
            set_sync_error(&e);
            return 1;
        }
    };
    match engine.apply_response(&response) {
        Ok(crate::sync::SyncOutcome::Applied) => {
            clear_last_error();
            0
        }
        Ok(crate::sync::SyncOutcome::Stale) => {
            clear_last_error();
            2
        }
        Err(e) => {
            set_sync_error(&e);
            1
        }
    }
}

/// Return the last error code for the current thread.
#[unsafe(no_mangle)]
pub extern "C" fn sync_last_error_code() -> c_int {
    LAST_ERROR.with(|le| le.borrow().0)
}

/// Return the last error message for the current thread as a newly
/// allocated C string. Caller must free with `sync_string_free`.
#[unsafe(no_mangle)]
pub extern "C" fn sync_last_error_message() -> *mut c_char {
    to_cstring_ptr(&LAST_ERROR.with(|le| le.borrow().1.clone()))
}
