pub mod backend;
pub mod memory;
pub mod snapshot;
pub mod store;

pub use backend::RowStorage;
pub use memory::MemoryRowStorage;
pub use snapshot::{
    PendingTxRecord, SnapshotError, SnapshotHeader, StoreContents, decode_snapshot,
    encode_snapshot,
};
pub use store::{StoreError, VersionedRowStore};
