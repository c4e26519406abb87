//! Block allocation and bad-block bookkeeping on top of the command layer.
//!
//! The manager owns the only record -- in memory and on disk -- of which
//! blocks are usable, free, or handed out. Every state-changing operation
//! rewrites the snapshot before reporting success, so a restart can never
//! re-allocate a block that is already in use, or forget one that just went
//! bad.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::bus::NandBus;
use crate::chip::NandConfig;
use crate::cmd::NandCommander;
use crate::error::{Error, Result};
use crate::ftl::snapshot::{BlockBitmap, Snapshot};

/// What the allocator knows about one block.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BlockState {
    /// Usable and not handed out.
    Free,
    /// Handed out by `alloc` and not yet released.
    Allocated,
    /// Failed at the factory or at runtime. Terminal: a bad block never
    /// becomes anything else.
    Bad,
}

impl fmt::Display for BlockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BlockState::Free => "free",
            BlockState::Allocated => "allocated",
            BlockState::Bad => "bad",
        })
    }
}

/// Per-chip-select block totals, for diagnostics and capacity reporting.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BlockCounts {
    pub free: u32,
    pub allocated: u32,
    pub bad: u32,
}

pub struct BlockManager<B: NandBus> {
    cmd: NandCommander<B>,
    snapshot_path: PathBuf,

    /// Chip selects that answered the identify probe; indices past this are
    /// out of range even if configured.
    num_cs: usize,

    bad: Vec<BlockBitmap>,
    allocated: Vec<BlockBitmap>,
}

impl<B: NandBus> BlockManager<B> {
    /// Bring up the block layer: probe the chips, then restore state from
    /// the snapshot -- or, when the snapshot is missing or untrustworthy,
    /// rebuild it with a full factory-marker scan. The freshly-restored
    /// state is persisted before this returns.
    pub fn open<P: AsRef<Path>>(mut cmd: NandCommander<B>, snapshot_path: P) -> Result<Self> {
        let num_cs = Self::probe(&mut cmd)?;
        let config = *cmd.config();

        let mut manager = Self {
            cmd,
            snapshot_path: snapshot_path.as_ref().to_path_buf(),
            num_cs,
            bad: Vec::new(),
            allocated: Vec::new(),
        };

        match Snapshot::load(&manager.snapshot_path, num_cs, config.blocks_per_cs) {
            Ok((bad, allocated)) => {
                log::debug!(
                    "block state restored from {}",
                    manager.snapshot_path.display()
                );
                manager.bad = bad;
                manager.allocated = allocated;
            }
            Err(e) => {
                log::warn!("rebuilding block state from media: {e}");
                manager.scan()?;
            }
        }

        manager.persist()?;
        Ok(manager)
    }

    /// Count the chips that answer the identify command with the expected
    /// ID. Chips are assumed to be populated from chip select 0 upward, so
    /// the count stops at the first miss.
    fn probe(cmd: &mut NandCommander<B>) -> Result<usize> {
        let config = *cmd.config();
        let mut num_cs = 0;
        for cs in 0..config.num_cs {
            cmd.reset(cs)?;
            let id = cmd.read_id(cs)?;
            if id != config.id_expect {
                log::debug!("probe: cs={cs} answered {id:02x?}, stopping");
                break;
            }
            num_cs += 1;
        }

        if num_cs == 0 {
            return Err(Error::NoChip);
        }
        log::info!("probe: {num_cs} chip(s) present");
        Ok(num_cs)
    }

    /// Read every block's factory bad-block marker (byte 0 of page 0;
    /// anything but 0xFF means the block left the factory bad) and start
    /// everything else out free.
    fn scan(&mut self) -> Result<()> {
        let config = *self.cmd.config();
        self.bad = vec![BlockBitmap::new(config.blocks_per_cs); self.num_cs];
        self.allocated = vec![BlockBitmap::new(config.blocks_per_cs); self.num_cs];

        let rpt = howudoin::new()
            .label("Scanning for bad blocks")
            .set_len(u64::from(config.blocks_per_cs) * self.num_cs as u64);

        for cs in 0..self.num_cs {
            for block in 0..config.blocks_per_cs {
                let marker = self
                    .cmd
                    .read_page_slice(cs, block, 0, 0, 1)?
                    .expect("scan addresses are in range");
                if marker[0] != 0xFF {
                    log::debug!("scan: cs={cs} block={block} factory bad marker");
                    self.bad[cs].set(block, true);
                }
                rpt.inc();
            }
        }

        rpt.close();
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        Snapshot::new(&self.bad, &self.allocated).save(&self.snapshot_path)?;
        Ok(())
    }

    pub fn config(&self) -> &NandConfig {
        self.cmd.config()
    }

    /// Number of chip selects that actually answered the probe.
    pub fn num_cs(&self) -> usize {
        self.num_cs
    }

    fn check_cs(&self, cs: usize) -> Result<()> {
        if cs >= self.num_cs {
            return Err(Error::ChipOutOfRange {
                cs,
                num_cs: self.num_cs,
            });
        }
        Ok(())
    }

    fn check_block(&self, cs: usize, block: u32) -> Result<()> {
        self.check_cs(cs)?;
        let blocks_per_cs = self.config().blocks_per_cs;
        if block >= blocks_per_cs {
            return Err(Error::BlockOutOfRange {
                block,
                blocks_per_cs,
            });
        }
        Ok(())
    }

    /// What state is (cs, block) in? `None` when out of range.
    pub fn state(&self, cs: usize, block: u32) -> Option<BlockState> {
        if cs >= self.num_cs || block >= self.config().blocks_per_cs {
            return None;
        }
        Some(if self.bad[cs].get(block) {
            BlockState::Bad
        } else if self.allocated[cs].get(block) {
            BlockState::Allocated
        } else {
            BlockState::Free
        })
    }

    /// Block totals for one chip select.
    pub fn counts(&self, cs: usize) -> Result<BlockCounts> {
        self.check_cs(cs)?;
        let bad = self.bad[cs].count_set();
        // A runtime-failed block may still carry its allocated bit; count it
        // only as bad.
        let allocated = (0..self.config().blocks_per_cs)
            .filter(|&b| !self.bad[cs].get(b) && self.allocated[cs].get(b))
            .count() as u32;
        Ok(BlockCounts {
            free: self.config().blocks_per_cs - bad - allocated,
            allocated,
            bad,
        })
    }

    /// Hand out the first block that is neither bad nor already allocated,
    /// searching `cs` alone when given, otherwise every chip select in
    /// ascending order. The choice is persisted before it is returned.
    pub fn alloc(&mut self, cs: Option<usize>) -> Result<(usize, u32)> {
        let eligible = match cs {
            Some(cs) => {
                self.check_cs(cs)?;
                cs..cs + 1
            }
            None => 0..self.num_cs,
        };

        for cs in eligible {
            for block in 0..self.config().blocks_per_cs {
                if self.bad[cs].get(block) || self.allocated[cs].get(block) {
                    continue;
                }
                self.allocated[cs].set(block, true);
                self.persist()?;
                log::debug!("alloc: cs={cs} block={block}");
                return Ok((cs, block));
            }
        }

        Err(Error::AllocationExhausted)
    }

    /// Give an allocated block back to the free pool.
    pub fn release(&mut self, cs: usize, block: u32) -> Result<()> {
        self.check_block(cs, block)?;
        match self.state(cs, block) {
            Some(BlockState::Allocated) => {}
            Some(actual) => {
                return Err(Error::InvalidState {
                    cs,
                    block,
                    actual,
                    expected: BlockState::Allocated,
                })
            }
            None => unreachable!("bounds checked above"),
        }

        self.allocated[cs].set(block, false);
        self.persist()?;
        log::debug!("release: cs={cs} block={block}");
        Ok(())
    }

    /// Read one page of an allocated block. `Ok(None)` -- without touching
    /// the hardware -- when any index is out of range or the block is not
    /// allocated. Never persists.
    pub fn read(&mut self, cs: usize, block: u32, page: u32) -> Result<Option<Vec<u8>>> {
        if self.state(cs, block) != Some(BlockState::Allocated)
            || page >= self.config().pages_per_block
        {
            return Ok(None);
        }
        self.cmd.read_page(cs, block, page)
    }

    /// Program one page of an allocated block. `Ok(false)` means the chip
    /// reported a program failure; the block has already been retired and
    /// the caller should allocate a replacement.
    pub fn program(&mut self, cs: usize, block: u32, page: u32, data: &[u8]) -> Result<bool> {
        self.check_block(cs, block)?;
        self.require_allocated(cs, block)?;

        let ok = self.cmd.program_page(cs, block, page, data)?;
        if !ok {
            self.retire(cs, block)?;
        }
        Ok(ok)
    }

    /// Erase an allocated block (NAND requires this before its pages can be
    /// reprogrammed). Same failure handling as [`Self::program`].
    pub fn erase(&mut self, cs: usize, block: u32) -> Result<bool> {
        self.check_block(cs, block)?;
        self.require_allocated(cs, block)?;

        let ok = self.cmd.erase_block(cs, block)?;
        if !ok {
            self.retire(cs, block)?;
        }
        Ok(ok)
    }

    fn require_allocated(&self, cs: usize, block: u32) -> Result<()> {
        match self.state(cs, block) {
            Some(BlockState::Allocated) => Ok(()),
            Some(actual) => Err(Error::InvalidState {
                cs,
                block,
                actual,
                expected: BlockState::Allocated,
            }),
            None => unreachable!("bounds checked by callers"),
        }
    }

    /// Mark a block bad forever and make it durable.
    fn retire(&mut self, cs: usize, block: u32) -> Result<()> {
        log::warn!("cs={cs} block={block} reported failure, marking bad");
        self.bad[cs].set(block, true);
        self.allocated[cs].set(block, false);
        self.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SimBus;
    use crate::testutil::scratch_dir;

    use std::path::PathBuf;

    const CONFIG: NandConfig = NandConfig {
        num_cs: 2,
        blocks_per_cs: 8,
        pages_per_block: 4,
        page_data_bytes: 64,
        page_spare_bytes: 8,
        id_expect: [0x98, 0xF1, 0x80, 0x15, 0x72],
    };

    fn setup(tag: &str) -> (PathBuf, SimBus) {
        let dir = scratch_dir(tag);
        let bus = SimBus::open(&dir, CONFIG).unwrap();
        (dir, bus)
    }

    fn open(dir: &Path, bus: SimBus) -> BlockManager<SimBus> {
        BlockManager::open(NandCommander::new(bus, CONFIG), dir.join("state.bin")).unwrap()
    }

    fn full_page(fill: u8) -> Vec<u8> {
        vec![fill; CONFIG.page_total_bytes()]
    }

    // Scenario: fresh media, single user. First allocation is (0, 0) and a
    // program/read round trip returns the exact pattern.
    #[test]
    fn test_alloc_program_read_round_trip() -> anyhow::Result<()> {
        let (dir, bus) = setup("mgr-roundtrip");
        let mut mgr = open(&dir, bus);

        let (cs, block) = mgr.alloc(None)?;
        assert_eq!((cs, block), (0, 0));
        assert_eq!(mgr.state(cs, block), Some(BlockState::Allocated));

        assert!(mgr.erase(cs, block)?);
        let data = full_page(0xA5);
        assert!(mgr.program(cs, block, 0, &data)?);
        assert_eq!(mgr.read(cs, block, 0)?, Some(data));
        Ok(())
    }

    // Scenario: a block fails during program. It must be retired, durably,
    // and never handed out again.
    #[test]
    fn test_program_failure_retires_block() -> anyhow::Result<()> {
        let (dir, mut bus) = setup("mgr-retire");
        bus.inject_program_failure(0, 0);
        let mut mgr = open(&dir, bus);

        assert_eq!(mgr.alloc(None)?, (0, 0));
        assert!(mgr.erase(0, 0)?);
        assert!(!mgr.program(0, 0, 0, &full_page(0x11))?);
        assert_eq!(mgr.state(0, 0), Some(BlockState::Bad));

        // The replacement is the next block up, never block 0 again
        assert_eq!(mgr.alloc(None)?, (0, 1));

        // ...even after a restart from the persisted snapshot
        let bus = SimBus::open(&dir, CONFIG)?;
        let mgr = open(&dir, bus);
        assert_eq!(mgr.state(0, 0), Some(BlockState::Bad));
        assert_eq!(mgr.state(0, 1), Some(BlockState::Allocated));
        Ok(())
    }

    // Scenario: one chip select runs dry. Pinned allocation fails, free
    // allocation spills over to the next chip.
    #[test]
    fn test_exhaustion_and_spill_over() -> anyhow::Result<()> {
        let (dir, bus) = setup("mgr-exhaustion");
        let mut mgr = open(&dir, bus);

        for expect in 0..CONFIG.blocks_per_cs {
            assert_eq!(mgr.alloc(Some(0))?, (0, expect));
        }
        assert!(matches!(mgr.alloc(Some(0)), Err(Error::AllocationExhausted)));
        assert_eq!(mgr.alloc(None)?, (1, 0));

        // Fill the other chip too and the well is truly dry
        for _ in 1..CONFIG.blocks_per_cs {
            mgr.alloc(Some(1))?;
        }
        assert!(matches!(mgr.alloc(None), Err(Error::AllocationExhausted)));
        Ok(())
    }

    // Scenario: the snapshot file is deleted. The next open rescans the
    // factory markers and starts a fresh, consistent snapshot.
    #[test]
    fn test_snapshot_loss_triggers_rescan() -> anyhow::Result<()> {
        let (dir, mut bus) = setup("mgr-rescan");
        bus.mark_factory_bad(0, 3)?;
        bus.mark_factory_bad(1, 7)?;

        let mut mgr = open(&dir, bus);
        assert_eq!(mgr.state(0, 3), Some(BlockState::Bad));
        assert_eq!(mgr.state(1, 7), Some(BlockState::Bad));
        mgr.alloc(None)?;

        let snapshot = dir.join("state.bin");
        assert!(snapshot.exists());
        std::fs::remove_file(&snapshot)?;

        let bus = SimBus::open(&dir, CONFIG)?;
        let mgr = open(&dir, bus);
        // Factory markers are rediscovered; runtime allocation state is not
        // reconstructible from media and starts over empty.
        assert_eq!(mgr.state(0, 3), Some(BlockState::Bad));
        assert_eq!(mgr.state(1, 7), Some(BlockState::Bad));
        assert_eq!(mgr.state(0, 0), Some(BlockState::Free));
        assert!(snapshot.exists());
        Ok(())
    }

    #[test]
    fn test_alloc_skips_factory_bad_blocks() -> anyhow::Result<()> {
        let (dir, mut bus) = setup("mgr-skip-bad");
        bus.mark_factory_bad(0, 0)?;
        bus.mark_factory_bad(0, 1)?;

        let mut mgr = open(&dir, bus);
        assert_eq!(mgr.alloc(None)?, (0, 2));
        Ok(())
    }

    #[test]
    fn test_alloc_never_repeats() -> anyhow::Result<()> {
        let (dir, bus) = setup("mgr-unique");
        let mut mgr = open(&dir, bus);

        let mut seen = std::collections::HashSet::new();
        loop {
            match mgr.alloc(None) {
                Ok(pair) => assert!(seen.insert(pair), "duplicate allocation {pair:?}"),
                Err(Error::AllocationExhausted) => break,
                Err(e) => return Err(e.into()),
            }
        }
        assert_eq!(seen.len(), 2 * CONFIG.blocks_per_cs as usize);
        Ok(())
    }

    #[test]
    fn test_operations_require_allocated_state() -> anyhow::Result<()> {
        let (dir, bus) = setup("mgr-state");
        let mut mgr = open(&dir, bus);

        // Nothing allocated yet: program is refused without touching
        // hardware or the snapshot...
        let before = std::fs::read(dir.join("state.bin"))?;
        assert!(matches!(
            mgr.program(0, 0, 0, &full_page(0x33)),
            Err(Error::InvalidState { .. })
        ));
        assert!(matches!(mgr.erase(0, 0), Err(Error::InvalidState { .. })));
        assert_eq!(before, std::fs::read(dir.join("state.bin"))?);

        // ...and read is simply absent
        assert_eq!(mgr.read(0, 0, 0)?, None);

        // Out-of-range indices are caller bugs for program, absent for read
        assert!(matches!(
            mgr.program(0, CONFIG.blocks_per_cs, 0, &full_page(0)),
            Err(Error::BlockOutOfRange { .. })
        ));
        assert_eq!(mgr.read(5, 0, 0)?, None);
        assert_eq!(mgr.read(0, 0, CONFIG.pages_per_block)?, None);
        Ok(())
    }

    #[test]
    fn test_release_returns_block_to_pool() -> anyhow::Result<()> {
        let (dir, bus) = setup("mgr-release");
        let mut mgr = open(&dir, bus);

        let (cs, block) = mgr.alloc(None)?;
        mgr.release(cs, block)?;
        assert_eq!(mgr.state(cs, block), Some(BlockState::Free));

        // Released blocks are eligible again (first-fit finds it first)
        assert_eq!(mgr.alloc(None)?, (cs, block));

        // Double release and releasing a bad block are both refused
        mgr.release(cs, block)?;
        assert!(matches!(
            mgr.release(cs, block),
            Err(Error::InvalidState { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_allocation_is_durable_immediately() -> anyhow::Result<()> {
        let (dir, bus) = setup("mgr-durable");
        let mut mgr = open(&dir, bus);
        let (cs, block) = mgr.alloc(None)?;

        // The on-disk snapshot already knows, before any further call
        let (bad, allocated) = Snapshot::load(&dir.join("state.bin"), 2, CONFIG.blocks_per_cs)?;
        assert!(allocated[cs].get(block));
        assert_eq!(bad[cs].count_set(), 0);
        Ok(())
    }

    #[test]
    fn test_probe_respects_missing_chips() -> anyhow::Result<()> {
        let (dir, mut bus) = setup("mgr-probe");
        bus.set_present(1);

        let mut mgr = open(&dir, bus);
        assert_eq!(mgr.num_cs(), 1);
        assert!(matches!(
            mgr.alloc(Some(1)),
            Err(Error::ChipOutOfRange { .. })
        ));

        let (dir, mut bus) = setup("mgr-probe-none");
        bus.set_present(0);
        let result = BlockManager::open(NandCommander::new(bus, CONFIG), dir.join("state.bin"));
        assert!(matches!(result, Err(Error::NoChip)));
        Ok(())
    }

    #[test]
    fn test_counts() -> anyhow::Result<()> {
        let (dir, mut bus) = setup("mgr-counts");
        bus.mark_factory_bad(0, 6)?;
        let mut mgr = open(&dir, bus);

        mgr.alloc(Some(0))?;
        mgr.alloc(Some(0))?;
        let counts = mgr.counts(0)?;
        assert_eq!(
            counts,
            BlockCounts {
                free: CONFIG.blocks_per_cs - 3,
                allocated: 2,
                bad: 1
            }
        );
        assert_eq!(mgr.counts(1)?.free, CONFIG.blocks_per_cs);
        Ok(())
    }
}
