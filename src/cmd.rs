//! The NAND command layer: turns logical operations (identify, read page,
//! program page, erase block) into ordered command/address/data/status phases
//! on a [`NandBus`], and interprets the status register afterwards.
//!
//! Hardware-reported program/erase failures are expected events over a
//! chip's lifetime -- they mean "this block just went bad" -- so they come
//! back as `Ok(false)`, never as errors. Errors are reserved for caller
//! misuse (out-of-range indices, wrong payload size) and for a device that
//! stops answering.

use std::time::Duration;

use bitflags::bitflags;

use crate::bus::NandBus;
use crate::chip::{NandConfig, ID_BYTES};
use crate::error::{Error, Result};

/// Command opcodes for the parallel NAND command set.
pub mod opcode {
    pub const READ_ID: u8 = 0x90;
    pub const STATUS_READ: u8 = 0x70;
    pub const READ_FIRST: u8 = 0x00;
    pub const READ_SECOND: u8 = 0x30;
    pub const PROGRAM_FIRST: u8 = 0x80;
    pub const PROGRAM_SECOND: u8 = 0x10;
    pub const ERASE_FIRST: u8 = 0x60;
    pub const ERASE_SECOND: u8 = 0xD0;
    pub const RESET: u8 = 0xFF;
}

bitflags! {
    /// Status-register contents.
    ///
    /// | Bit | Meaning                | Value                      |
    /// | --- | ---------------------- | -------------------------- |
    /// | 0   | Chip status            | Pass: 0, Fail: 1           |
    /// | 1   | Cache program status   | Pass: 0, Fail: 1           |
    /// | 5   | Page buffer ready/busy | Ready: 1, Busy: 0          |
    /// | 6   | Data cache ready/busy  | Ready: 1, Busy: 0          |
    /// | 7   | Write protect          | Off: 1, Protected: 0       |
    #[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
    pub struct Status: u8 {
        const PROGRAM_ERASE_FAIL = 0b0000_0001;
        const CACHE_PROGRAM_FAIL = 0b0000_0010;
        const PAGE_BUFFER_READY  = 0b0010_0000;
        const DATA_CACHE_READY   = 0b0100_0000;
        const WRITE_PROTECT_OFF  = 0b1000_0000;
    }
}

impl Status {
    /// Did the last program/erase pass?
    pub fn passed(&self) -> bool {
        !self.contains(Status::PROGRAM_ERASE_FAIL)
    }

    pub fn write_protected(&self) -> bool {
        !self.contains(Status::WRITE_PROTECT_OFF)
    }
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Sequences raw NAND operations, one chip select at a time.
pub struct NandCommander<B: NandBus> {
    bus: B,
    config: NandConfig,
    timeout: Duration,
}

impl<B: NandBus> NandCommander<B> {
    pub fn new(bus: B, config: NandConfig) -> Self {
        Self {
            bus,
            config,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Override the per-operation ready deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn config(&self) -> &NandConfig {
        &self.config
    }

    /// Access to the bus underneath, for capabilities (like write protect)
    /// that aren't tied to one operation.
    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    fn check_cs(&self, cs: usize) -> Result<()> {
        if cs >= self.config.num_cs {
            return Err(Error::ChipOutOfRange {
                cs,
                num_cs: self.config.num_cs,
            });
        }
        Ok(())
    }

    /// Wait for ready, releasing the chip first if the wait fails so the bus
    /// is never left with a chip-enable asserted.
    fn wait_ready(&mut self) -> Result<()> {
        if let Err(e) = self.bus.wait_ready(self.timeout) {
            let _ = self.bus.deselect();
            return Err(e);
        }
        Ok(())
    }

    /// Reset one chip and wait for it to come ready again.
    pub fn reset(&mut self, cs: usize) -> Result<()> {
        self.check_cs(cs)?;
        self.bus.select(cs)?;
        self.bus.cmd(opcode::RESET)?;
        self.wait_ready()?;
        self.bus.deselect()?;
        log::trace!("reset: cs={cs}");
        Ok(())
    }

    /// Read the chip's ID bytes. What they mean is the caller's problem;
    /// this just clocks them in.
    pub fn read_id(&mut self, cs: usize) -> Result<[u8; ID_BYTES]> {
        self.check_cs(cs)?;

        let mut id = [0u8; ID_BYTES];
        self.bus.select(cs)?;
        self.bus.cmd(opcode::READ_ID)?;
        self.bus.address(&[0x00])?;
        self.bus.data_in(&mut id)?;
        self.bus.deselect()?;

        log::trace!("read_id: cs={cs} id={id:02x?}");
        Ok(id)
    }

    /// Read the status register.
    pub fn read_status(&mut self, cs: usize) -> Result<Status> {
        self.check_cs(cs)?;

        let mut status = [0u8; 1];
        self.bus.select(cs)?;
        self.bus.cmd(opcode::STATUS_READ)?;
        self.bus.data_in(&mut status)?;
        self.bus.deselect()?;

        Ok(Status::from_bits_truncate(status[0]))
    }

    /// Read part of a page starting at column `col`. `Ok(None)` when the
    /// address is outside the configured geometry.
    pub fn read_page_slice(
        &mut self,
        cs: usize,
        block: u32,
        page: u32,
        col: u16,
        len: usize,
    ) -> Result<Option<Vec<u8>>> {
        self.check_cs(cs)?;
        if !self.config.contains(block, page) {
            return Ok(None);
        }

        let addr = self.config.page_address(block, page, col);
        self.bus.select(cs)?;
        self.bus.cmd(opcode::READ_FIRST)?;
        self.bus.address(&addr)?;
        self.bus.cmd(opcode::READ_SECOND)?;
        self.wait_ready()?;

        let mut data = vec![0u8; len];
        self.bus.data_in(&mut data)?;
        self.bus.deselect()?;
        Ok(Some(data))
    }

    /// Read one full page (data + spare). `Ok(None)` when the address is
    /// outside the configured geometry.
    pub fn read_page(&mut self, cs: usize, block: u32, page: u32) -> Result<Option<Vec<u8>>> {
        self.read_page_slice(cs, block, page, 0, self.config.page_total_bytes())
    }

    /// Erase a whole block. `Ok(false)` iff the chip reports the erase
    /// failed.
    pub fn erase_block(&mut self, cs: usize, block: u32) -> Result<bool> {
        self.check_cs(cs)?;
        if block >= self.config.blocks_per_cs {
            return Err(Error::BlockOutOfRange {
                block,
                blocks_per_cs: self.config.blocks_per_cs,
            });
        }

        let addr = self.config.block_address(block);
        self.bus.select(cs)?;
        self.bus.cmd(opcode::ERASE_FIRST)?;
        self.bus.address(&addr)?;
        self.bus.cmd(opcode::ERASE_SECOND)?;
        self.wait_ready()?;
        self.bus.deselect()?;

        let status = self.read_status(cs)?;
        let ok = status.passed();
        log::trace!("erase_block: cs={cs} block={block} ok={ok} status={status:?}");
        Ok(ok)
    }

    /// Program one full page. `data` must be exactly data + spare bytes.
    /// `Ok(false)` iff the chip reports the program failed.
    pub fn program_page(&mut self, cs: usize, block: u32, page: u32, data: &[u8]) -> Result<bool> {
        self.check_cs(cs)?;
        if block >= self.config.blocks_per_cs {
            return Err(Error::BlockOutOfRange {
                block,
                blocks_per_cs: self.config.blocks_per_cs,
            });
        }
        if page >= self.config.pages_per_block {
            return Err(Error::PageOutOfRange {
                page,
                pages_per_block: self.config.pages_per_block,
            });
        }
        if data.len() != self.config.page_total_bytes() {
            return Err(Error::PageSizeMismatch {
                got: data.len(),
                expected: self.config.page_total_bytes(),
            });
        }

        let addr = self.config.page_address(block, page, 0);
        self.bus.select(cs)?;
        self.bus.cmd(opcode::PROGRAM_FIRST)?;
        self.bus.address(&addr)?;
        self.bus.data_out(data)?;
        self.bus.cmd(opcode::PROGRAM_SECOND)?;
        self.wait_ready()?;
        self.bus.deselect()?;

        let status = self.read_status(cs)?;
        let ok = status.passed();
        log::trace!("program_page: cs={cs} block={block} page={page} ok={ok} status={status:?}");
        Ok(ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SimBus;
    use crate::testutil::scratch_dir;

    const CONFIG: NandConfig = NandConfig {
        num_cs: 2,
        blocks_per_cs: 8,
        pages_per_block: 4,
        page_data_bytes: 64,
        page_spare_bytes: 8,
        id_expect: [0x98, 0xF1, 0x80, 0x15, 0x72],
    };

    fn commander(tag: &str) -> NandCommander<SimBus> {
        let bus = SimBus::open(scratch_dir(tag), CONFIG).unwrap();
        NandCommander::new(bus, CONFIG)
    }

    #[test]
    fn test_read_id() -> anyhow::Result<()> {
        let mut cmd = commander("cmd-id");
        cmd.bus_mut().set_present(1);

        assert_eq!(cmd.read_id(0)?, CONFIG.id_expect);
        assert_eq!(cmd.read_id(1)?, [0u8; ID_BYTES]);
        assert!(matches!(
            cmd.read_id(2),
            Err(Error::ChipOutOfRange { cs: 2, .. })
        ));
        Ok(())
    }

    #[test]
    fn test_program_then_read_round_trip() -> anyhow::Result<()> {
        let mut cmd = commander("cmd-roundtrip");

        let data: Vec<u8> = (0..CONFIG.page_total_bytes())
            .map(|i| (i * 7) as u8)
            .collect();
        assert!(cmd.erase_block(0, 3)?);
        assert!(cmd.program_page(0, 3, 2, &data)?);
        assert_eq!(cmd.read_page(0, 3, 2)?, Some(data));

        // Untouched neighbor page is still erased
        let blank = cmd.read_page(0, 3, 1)?.unwrap();
        assert!(blank.iter().all(|&b| b == 0xFF));
        Ok(())
    }

    #[test]
    fn test_erase_restores_all_ones() -> anyhow::Result<()> {
        let mut cmd = commander("cmd-erase");

        let data = vec![0x00u8; CONFIG.page_total_bytes()];
        assert!(cmd.program_page(1, 5, 0, &data)?);
        assert!(cmd.erase_block(1, 5)?);
        let content = cmd.read_page(1, 5, 0)?.unwrap();
        assert!(content.iter().all(|&b| b == 0xFF));
        Ok(())
    }

    #[test]
    fn test_out_of_range_read_is_absent() -> anyhow::Result<()> {
        let mut cmd = commander("cmd-absent");
        assert_eq!(cmd.read_page(0, CONFIG.blocks_per_cs, 0)?, None);
        assert_eq!(cmd.read_page(0, 0, CONFIG.pages_per_block)?, None);
        Ok(())
    }

    #[test]
    fn test_misuse_is_an_error() {
        let mut cmd = commander("cmd-misuse");

        assert!(matches!(
            cmd.program_page(0, 0, 0, &[0u8; 3]),
            Err(Error::PageSizeMismatch { got: 3, .. })
        ));
        assert!(matches!(
            cmd.erase_block(0, CONFIG.blocks_per_cs),
            Err(Error::BlockOutOfRange { .. })
        ));
        assert!(matches!(
            cmd.program_page(9, 0, 0, &[]),
            Err(Error::ChipOutOfRange { .. })
        ));
    }

    #[test]
    fn test_reported_failure_is_not_an_error() -> anyhow::Result<()> {
        let mut cmd = commander("cmd-fail");
        cmd.bus_mut().inject_program_failure(0, 2);
        cmd.bus_mut().inject_erase_failure(0, 6);

        let data = vec![0xA5u8; CONFIG.page_total_bytes()];
        assert!(!cmd.program_page(0, 2, 0, &data)?);
        assert!(!cmd.erase_block(0, 6)?);

        // The failure is per-block; the rest of the chip still works.
        assert!(cmd.program_page(0, 3, 0, &data)?);
        Ok(())
    }

    #[test]
    fn test_wedged_device_times_out() {
        let mut cmd = commander("cmd-hang").with_timeout(Duration::from_millis(10));
        cmd.bus_mut().inject_busy_hang();

        assert!(matches!(
            cmd.erase_block(0, 0),
            Err(Error::DeviceTimeout(_))
        ));
    }

    #[test]
    fn test_write_protect_blocks_program() -> anyhow::Result<()> {
        let mut cmd = commander("cmd-wp");
        cmd.bus_mut().write_protect(true)?;

        let data = vec![0x00u8; CONFIG.page_total_bytes()];
        assert!(!cmd.program_page(0, 0, 0, &data)?);
        assert!(cmd.read_status(0)?.write_protected());

        cmd.bus_mut().write_protect(false)?;
        assert!(cmd.program_page(0, 0, 0, &data)?);
        Ok(())
    }
}
