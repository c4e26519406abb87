//! The driver capability boundary: everything the command layer needs from a
//! NAND bus, plus the file-backed simulator that stands in for real hardware.
//!
//! The command layer only ever speaks in phases (command byte, address cycles,
//! data in/out, ready wait), so a bus implementation does not need to know
//! what a page or a block is -- with the one exception of the simulator,
//! which has to play the part of the chip on the other end of the bus.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::time::Duration;

use crate::chip::{NandConfig, ID_BYTES};
use crate::cmd::{opcode, Status};
use crate::error::{Error, Result};

#[cfg(target_os = "linux")]
pub mod gpio;

/// One parallel NAND bus with up to `num_cs` chips hanging off it.
///
/// All operations are blocking and run to completion; the only bounded wait
/// is `wait_ready`, which must give up (with [`Error::DeviceTimeout`]) rather
/// than spin forever on a wedged chip.
pub trait NandBus {
    /// Drive the chip-enable line for `cs` active (and all others inactive).
    fn select(&mut self, cs: usize) -> Result<()>;

    /// Release all chip-enable lines.
    fn deselect(&mut self) -> Result<()>;

    /// Drive the write-protect line. Program and erase are refused by the
    /// chip while protection is on.
    fn write_protect(&mut self, enable: bool) -> Result<()>;

    /// Latch one command byte.
    fn cmd(&mut self, opcode: u8) -> Result<()>;

    /// Latch address cycles, in bus order.
    fn address(&mut self, cycles: &[u8]) -> Result<()>;

    /// Clock a payload out to the chip.
    fn data_out(&mut self, data: &[u8]) -> Result<()>;

    /// Clock `buf.len()` bytes in from the chip.
    fn data_in(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Block until the ready/busy line reports ready, or the deadline passes.
    fn wait_ready(&mut self, timeout: Duration) -> Result<()>;
}

/// A simulated NAND bus, backed by one flat image file per chip select.
///
/// The simulator keeps honest NAND semantics so that the layers above cannot
/// get away with anything a real chip would refuse: erase fills the block
/// with all-ones, and programming can only clear bits (the payload is ANDed
/// into the existing page content). It also emulates the command protocol
/// itself -- commands are latched and executed on the confirming opcode, and
/// results are reported through the simulated status register.
pub struct SimBus {
    config: NandConfig,
    images: Vec<fs::File>,

    /// How many chip selects answer the identify command. Defaults to all of
    /// them; lowered by tests exercising the probe path.
    present: usize,

    write_protected: bool,

    selected: Option<usize>,
    latched: Option<u8>,
    addr: Vec<u8>,
    payload: Vec<u8>,
    out: Vec<u8>,
    out_pos: usize,

    /// Sticky pass/fail of the last program/erase, per chip select.
    failed: Vec<bool>,

    fail_program: HashSet<(usize, u32)>,
    fail_erase: HashSet<(usize, u32)>,
    hang: bool,
}

impl SimBus {
    /// Open (creating and 0xFF-filling if necessary) the per-chip image files
    /// under `dir`.
    pub fn open<P: AsRef<Path>>(dir: P, config: NandConfig) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let capacity = config.cs_bytes();
        let mut images = Vec::with_capacity(config.num_cs);
        for cs in 0..config.num_cs {
            let path = dir.join(format!("cs{cs:02}.bin"));
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)?;

            if file.metadata()?.len() != capacity {
                log::debug!("sim: initializing {} ({capacity} bytes)", path.display());
                file.set_len(capacity)?;
                let chunk = vec![0xFFu8; 64 * 1024];
                let mut offset = 0u64;
                while offset < capacity {
                    let len = std::cmp::min(chunk.len() as u64, capacity - offset) as usize;
                    file.write_all_at(&chunk[..len], offset)?;
                    offset += len as u64;
                }
            }

            images.push(file);
        }

        Ok(Self {
            present: config.num_cs,
            images,
            write_protected: false,
            selected: None,
            latched: None,
            addr: Vec::new(),
            payload: Vec::new(),
            out: Vec::new(),
            out_pos: 0,
            failed: vec![false; config.num_cs],
            fail_program: HashSet::new(),
            fail_erase: HashSet::new(),
            hang: false,
            config,
        })
    }

    /// Pretend only the first `n` chip selects are populated.
    pub fn set_present(&mut self, n: usize) {
        self.present = n.min(self.config.num_cs);
    }

    /// Make every program of (cs, block) report failure, as a block that has
    /// worn out would.
    pub fn inject_program_failure(&mut self, cs: usize, block: u32) {
        self.fail_program.insert((cs, block));
    }

    /// Make every erase of (cs, block) report failure.
    pub fn inject_erase_failure(&mut self, cs: usize, block: u32) {
        self.fail_erase.insert((cs, block));
    }

    /// Wedge the ready/busy line: every subsequent wait times out.
    pub fn inject_busy_hang(&mut self) {
        self.hang = true;
    }

    /// Stamp the factory bad-block marker (a non-0xFF byte 0 of page 0) onto
    /// a block, as it would leave the production line.
    pub fn mark_factory_bad(&mut self, cs: usize, block: u32) -> Result<()> {
        let offset = self.page_offset(block, 0);
        self.images[cs].write_all_at(&[0x00], offset)?;
        Ok(())
    }

    fn page_offset(&self, block: u32, page: u32) -> u64 {
        u64::from(self.config.row(block, page)) * self.config.page_total_bytes() as u64
    }

    fn status_byte(&self) -> u8 {
        let mut status = Status::PAGE_BUFFER_READY | Status::DATA_CACHE_READY;
        if !self.write_protected {
            status |= Status::WRITE_PROTECT_OFF;
        }
        if let Some(cs) = self.selected {
            if self.failed[cs] {
                status |= Status::PROGRAM_ERASE_FAIL;
            }
        }
        status.bits()
    }

    /// Decode the 4 latched address cycles of a read/program.
    fn page_args(&self) -> Option<(u32, u32, usize)> {
        let [c0, c1, r0, r1]: [u8; 4] = self.addr.as_slice().try_into().ok()?;
        let col = usize::from(u16::from_le_bytes([c0, c1]));
        let row = u32::from(u16::from_le_bytes([r0, r1]));
        Some((
            row / self.config.pages_per_block,
            row % self.config.pages_per_block,
            col,
        ))
    }

    fn execute_read(&mut self) -> Result<()> {
        self.out.clear();
        self.out_pos = 0;

        let Some(cs) = self.selected else {
            return Ok(());
        };
        let Some((block, page, col)) = self.page_args() else {
            return Ok(());
        };
        if !self.config.contains(block, page) || col >= self.config.page_total_bytes() {
            return Ok(());
        }

        let mut content = vec![0u8; self.config.page_total_bytes()];
        self.images[cs].read_exact_at(&mut content, self.page_offset(block, page))?;
        self.out = content.split_off(col);
        Ok(())
    }

    fn execute_program(&mut self) -> Result<()> {
        let Some(cs) = self.selected else {
            return Ok(());
        };
        let Some((block, page, col)) = self.page_args() else {
            return Ok(());
        };

        if self.write_protected
            || !self.config.contains(block, page)
            || self.fail_program.contains(&(cs, block))
        {
            self.failed[cs] = true;
            return Ok(());
        }

        // Program can only clear bits: AND the payload into what's there.
        let mut content = vec![0u8; self.config.page_total_bytes()];
        let offset = self.page_offset(block, page);
        self.images[cs].read_exact_at(&mut content, offset)?;
        for (dst, src) in content[col..].iter_mut().zip(&self.payload) {
            *dst &= src;
        }
        self.images[cs].write_all_at(&content, offset)?;

        self.failed[cs] = false;
        Ok(())
    }

    fn execute_erase(&mut self) -> Result<()> {
        let Some(cs) = self.selected else {
            return Ok(());
        };
        let [r0, r1] = self.addr.as_slice().try_into().unwrap_or([0xFF, 0xFF]);
        let block = u32::from(u16::from_le_bytes([r0, r1])) / self.config.pages_per_block;

        if self.write_protected
            || block >= self.config.blocks_per_cs
            || self.fail_erase.contains(&(cs, block))
        {
            self.failed[cs] = true;
            return Ok(());
        }

        let blank = vec![0xFFu8; self.config.block_bytes() as usize];
        self.images[cs].write_all_at(&blank, self.page_offset(block, 0))?;

        self.failed[cs] = false;
        Ok(())
    }
}

impl NandBus for SimBus {
    fn select(&mut self, cs: usize) -> Result<()> {
        if cs >= self.config.num_cs {
            return Err(Error::ChipOutOfRange {
                cs,
                num_cs: self.config.num_cs,
            });
        }
        self.selected = Some(cs);
        Ok(())
    }

    fn deselect(&mut self) -> Result<()> {
        self.selected = None;
        Ok(())
    }

    fn write_protect(&mut self, enable: bool) -> Result<()> {
        self.write_protected = enable;
        Ok(())
    }

    fn cmd(&mut self, opcode: u8) -> Result<()> {
        match opcode {
            opcode::READ_ID | opcode::READ_FIRST | opcode::ERASE_FIRST => {
                self.latched = Some(opcode);
                self.addr.clear();
            }
            opcode::PROGRAM_FIRST => {
                self.latched = Some(opcode);
                self.addr.clear();
                self.payload.clear();
            }
            opcode::STATUS_READ => {
                self.out = vec![self.status_byte()];
                self.out_pos = 0;
            }
            opcode::READ_SECOND => self.execute_read()?,
            opcode::PROGRAM_SECOND => self.execute_program()?,
            opcode::ERASE_SECOND => self.execute_erase()?,
            opcode::RESET => {
                self.latched = None;
                self.addr.clear();
                self.payload.clear();
                self.out.clear();
                if let Some(cs) = self.selected {
                    self.failed[cs] = false;
                }
            }
            // Reserved opcodes are ignored, as a real chip ignores them.
            _ => {}
        }
        Ok(())
    }

    fn address(&mut self, cycles: &[u8]) -> Result<()> {
        self.addr.extend_from_slice(cycles);

        // The identify command produces output as soon as its single device
        // address cycle lands.
        if self.latched == Some(opcode::READ_ID) && !self.addr.is_empty() {
            self.out = match self.selected {
                Some(cs) if cs < self.present => self.config.id_expect.to_vec(),
                _ => vec![0u8; ID_BYTES],
            };
            self.out_pos = 0;
        }
        Ok(())
    }

    fn data_out(&mut self, data: &[u8]) -> Result<()> {
        if self.latched == Some(opcode::PROGRAM_FIRST) {
            self.payload.extend_from_slice(data);
        }
        Ok(())
    }

    fn data_in(&mut self, buf: &mut [u8]) -> Result<()> {
        for byte in buf.iter_mut() {
            // Past the end of the output buffer the bus floats high.
            *byte = self.out.get(self.out_pos).copied().unwrap_or(0xFF);
            self.out_pos += 1;
        }
        Ok(())
    }

    fn wait_ready(&mut self, timeout: Duration) -> Result<()> {
        // The simulator completes operations synchronously, so the only way
        // to be busy is to have been wedged on purpose.
        if self.hang {
            return Err(Error::DeviceTimeout(timeout));
        }
        Ok(())
    }
}

#[cfg(test)]
const TEST_CONFIG: NandConfig = NandConfig {
    num_cs: 2,
    blocks_per_cs: 8,
    pages_per_block: 4,
    page_data_bytes: 64,
    page_spare_bytes: 8,
    id_expect: [0x98, 0xF1, 0x80, 0x15, 0x72],
};

#[test]
fn test_image_creation() -> anyhow::Result<()> {
    let dir = crate::testutil::scratch_dir("bus-image");
    let bus = SimBus::open(&dir, TEST_CONFIG)?;
    drop(bus);

    for cs in 0..TEST_CONFIG.num_cs {
        let image = fs::read(dir.join(format!("cs{cs:02}.bin")))?;
        assert_eq!(image.len() as u64, TEST_CONFIG.cs_bytes());
        assert!(image.iter().all(|&b| b == 0xFF));
    }
    Ok(())
}

#[test]
fn test_program_only_clears_bits() -> anyhow::Result<()> {
    let dir = crate::testutil::scratch_dir("bus-and");
    let mut bus = SimBus::open(&dir, TEST_CONFIG)?;
    let page = TEST_CONFIG.page_total_bytes();

    // Drive the program sequence by hand, twice, with complementary patterns.
    for pattern in [0xF5u8, 0x5F] {
        bus.select(0)?;
        bus.cmd(opcode::PROGRAM_FIRST)?;
        bus.address(&TEST_CONFIG.page_address(2, 1, 0))?;
        bus.data_out(&vec![pattern; page])?;
        bus.cmd(opcode::PROGRAM_SECOND)?;
        bus.wait_ready(Duration::from_secs(1))?;
        bus.deselect()?;
    }

    bus.select(0)?;
    bus.cmd(opcode::READ_FIRST)?;
    bus.address(&TEST_CONFIG.page_address(2, 1, 0))?;
    bus.cmd(opcode::READ_SECOND)?;
    bus.wait_ready(Duration::from_secs(1))?;
    let mut content = vec![0u8; page];
    bus.data_in(&mut content)?;
    bus.deselect()?;

    assert!(content.iter().all(|&b| b == 0xF5 & 0x5F));
    Ok(())
}

#[test]
fn test_factory_marker() -> anyhow::Result<()> {
    let dir = crate::testutil::scratch_dir("bus-marker");
    let mut bus = SimBus::open(&dir, TEST_CONFIG)?;
    bus.mark_factory_bad(1, 3)?;

    bus.select(1)?;
    bus.cmd(opcode::READ_FIRST)?;
    bus.address(&TEST_CONFIG.page_address(3, 0, 0))?;
    bus.cmd(opcode::READ_SECOND)?;
    bus.wait_ready(Duration::from_secs(1))?;
    let mut marker = [0xFFu8; 1];
    bus.data_in(&mut marker)?;
    bus.deselect()?;

    assert_ne!(marker[0], 0xFF);
    Ok(())
}
