//! Flash translation for raw parallel NAND chips.
//!
//! Raw NAND is a hostile storage medium: it must be erased (a whole block at
//! a time) before it can be programmed, programming can only clear bits, and
//! blocks die -- some at the factory, more over the device's life. This
//! crate turns that into something a storage front-end can use: allocatable,
//! individually programmable and readable blocks, with allocation and
//! bad-block state that survives restarts.
//!
//! The layers, bottom up:
//!
//! - [`bus`]: the driver capability boundary (chip-enable, command, address,
//!   data, ready/busy), with a file-backed simulator and a Linux GPIO
//!   bit-bang implementation behind it.
//! - [`cmd`]: the command layer, sequencing identify/read/program/erase as
//!   command-address-data-status phases and interpreting the status
//!   register.
//! - [`ftl`]: the block manager -- allocation, bad-block retirement, and the
//!   durable snapshot of both.
//! - [`codec`]: page scrambling and integrity CRC for the data that rides on
//!   top.

pub mod bus;
pub mod chip;
pub mod cmd;
pub mod codec;
pub mod error;
pub mod ftl;

pub use error::Error;

#[cfg(test)]
pub(crate) mod testutil {
    use std::path::PathBuf;

    /// A fresh per-test scratch directory. Wiped on entry so stale state
    /// from an earlier run can't leak in.
    pub(crate) fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("nand-gadget-{}-{tag}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
