//! Logical Clock (C1): a persisted, monotonic per-replica integer.
//!
//! `tick` is the only operation that assigns a dot to a local write and must
//! strictly increase. `sync` absorbs a server-observed version into the
//! clock without itself counting as a local write — a replica that only
//! ever receives never advances past what it has actually written.

use crate::error::Result;
use crate::repository::{Repository, ScopedTransaction};

pub struct LogicalClock;

impl LogicalClock {
    /// Assign the next local version. Starts at 0 (the persisted value
    /// begins at -1).
    pub fn tick(repo: &Repository<'_>, scope: &ScopedTransaction<'_>) -> Result<i64> {
        let current = repo.get_logical_clock(scope)?;
        let next = current + 1;
        repo.set_logical_clock(scope, next)?;
        Ok(next)
    }

    /// Max-merge a remote-observed version into the clock. Never decreases
    /// the clock and never increases it past `remote_version`.
    pub fn sync(repo: &Repository<'_>, scope: &ScopedTransaction<'_>, remote_version: i64) -> Result<i64> {
        let current = repo.get_logical_clock(scope)?;
        let next = current.max(remote_version);
        if next != current {
            repo.set_logical_clock(scope, next)?;
        }
        Ok(next)
    }
}
