pub mod clock;
pub mod crdt;
pub mod error;
pub mod facade;
pub mod ffi;
pub mod hash;
pub mod model;
pub mod repository;
pub mod sync;
pub mod transport;
pub mod wire;

pub use error::{Result, SyncError};
pub use facade::Database;
pub use model::{ClientState, Context, CrdtOperation, Dot, LwwField, OrMapRow, Tombstone};
pub use repository::{Repository, ScopedTransaction, Stores, TxMode};
pub use sync::SyncEngine;
pub use transport::SyncTransport;
pub use wire::{SyncRequest, SyncResponse};
