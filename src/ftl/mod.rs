//! Block-level flash translation: who owns which block, which blocks are
//! dead, and how that survives a restart.

mod manager;
mod snapshot;

pub use manager::{BlockCounts, BlockManager, BlockState};
pub use snapshot::{BlockBitmap, Snapshot, SnapshotError};
