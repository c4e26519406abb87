//! The error taxonomy shared by the bus, command, and block-management layers.
//!
//! The split matters: hardware-reported program/erase failures are *not*
//! errors (they come back as `Ok(false)` and the block manager retires the
//! block), while everything here is either caller misuse, resource
//! exhaustion, or the machine underneath us misbehaving.

use std::time::Duration;

use thiserror::Error;

use crate::ftl::BlockState;

#[derive(Debug, Error)]
pub enum Error {
    /// A chip-select index past the configured chip count.
    #[error("chip select {cs} out of range ({num_cs} present)")]
    ChipOutOfRange { cs: usize, num_cs: usize },

    #[error("block {block} out of range ({blocks_per_cs} blocks per chip select)")]
    BlockOutOfRange { block: u32, blocks_per_cs: u32 },

    #[error("page {page} out of range ({pages_per_block} pages per block)")]
    PageOutOfRange { page: u32, pages_per_block: u32 },

    /// Payload length does not match what the operation moves.
    #[error("payload is {got} bytes, expected {expected}")]
    PageSizeMismatch { got: usize, expected: usize },

    /// The ready/busy line never signalled completion. Distinct from a failed
    /// operation: the device did not answer at all.
    #[error("device did not signal ready within {0:?}")]
    DeviceTimeout(Duration),

    /// Nothing on the bus answered the identify command with the expected ID.
    #[error("no NAND chip detected")]
    NoChip,

    /// Every eligible block is allocated or bad.
    #[error("no free block available")]
    AllocationExhausted,

    /// Operation requires the block to be in a different state.
    #[error("block {block} on chip select {cs} is {actual}, expected {expected}")]
    InvalidState {
        cs: usize,
        block: u32,
        actual: BlockState,
        expected: BlockState,
    },

    /// A snapshot write failed. (Unreadable snapshots are not errors; the
    /// block manager recovers from those with a rebuild.)
    #[error("snapshot: {0}")]
    Snapshot(#[from] crate::ftl::SnapshotError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[cfg(target_os = "linux")]
    #[error("gpio: {0}")]
    Gpio(#[from] gpiocdev::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
