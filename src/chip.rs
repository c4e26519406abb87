//! NAND chip geometry, identity, and address-cycle encoding.

use std::str::FromStr;

/// Number of bytes clocked out by the identify command.
pub const ID_BYTES: usize = 5;

/// A pub-fields struct describing the NAND chips on the bus: how many chip
/// selects are populated, the per-chip layout, and the ID bytes a healthy chip
/// answers with.
///
/// Built once at startup and handed by value to the command layer and block
/// manager; nothing mutates it afterwards.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NandConfig {
    pub num_cs: usize,
    pub blocks_per_cs: u32,
    pub pages_per_block: u32,

    /// Usable data bytes per page.
    pub page_data_bytes: usize,

    /// Extra spare-area bytes per page (markers, page CRC).
    pub page_spare_bytes: usize,

    /// Expected identify response.
    ///
    /// | Byte | Meaning                |
    /// | ---- | ---------------------- |
    /// | 0    | Maker code             |
    /// | 1    | Device code            |
    /// | 2    | Chip number, cell type |
    /// | 3    | Page size, block size  |
    /// | 4    | District number        |
    pub id_expect: [u8; ID_BYTES],
}

/// Two TC58NVG0S3HTA00 dies on a shared 8-bit bus, one chip-enable each.
impl Default for NandConfig {
    fn default() -> Self {
        Self {
            num_cs: 2,
            blocks_per_cs: 1024,
            pages_per_block: 64,
            page_data_bytes: 2048,
            page_spare_bytes: 128,
            id_expect: [0x98, 0xF1, 0x80, 0x15, 0x72],
        }
    }
}

impl NandConfig {
    /// Data + spare: the unit `program`/`read` moves over the bus.
    pub fn page_total_bytes(&self) -> usize {
        self.page_data_bytes + self.page_spare_bytes
    }

    /// Bytes per eraseblock.
    pub fn block_bytes(&self) -> u64 {
        self.page_total_bytes() as u64 * u64::from(self.pages_per_block)
    }

    /// Bytes per chip select (the size of one simulator image).
    pub fn cs_bytes(&self) -> u64 {
        self.block_bytes() * u64::from(self.blocks_per_cs)
    }

    /// Is (block, page) inside this chip?
    pub fn contains(&self, block: u32, page: u32) -> bool {
        block < self.blocks_per_cs && page < self.pages_per_block
    }

    /// The row address of a page: pages are numbered consecutively across the
    /// whole chip, `pages_per_block` to a block.
    pub fn row(&self, block: u32, page: u32) -> u32 {
        block * self.pages_per_block + page
    }

    /// Address cycles for a page read/program:
    ///
    /// | Cycle | Data      |
    /// | ----- | --------- |
    /// | 0     | COL[7:0]  |
    /// | 1     | COL[15:8] |
    /// | 2     | ROW[7:0]  |
    /// | 3     | ROW[15:8] |
    pub fn page_address(&self, block: u32, page: u32, col: u16) -> [u8; 4] {
        let row = self.row(block, page);
        [col as u8, (col >> 8) as u8, row as u8, (row >> 8) as u8]
    }

    /// Address cycles for a block erase: the row address alone, two cycles.
    /// The in-block page bits are don't-care to the chip.
    pub fn block_address(&self, block: u32) -> [u8; 2] {
        let row = self.row(block, 0);
        [row as u8, (row >> 8) as u8]
    }
}

/// Parse strings like "CSxBLOCKSxPAGESxDATAxSPARE", e.g. "2x1024x64x2048x128"
impl FromStr for NandConfig {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let [num_cs, blocks, pages, data, spare]: [&str; 5] = s
            .split('x')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #x#x#x#x#"))?;

        Ok(NandConfig {
            num_cs: num_cs.parse()?,
            blocks_per_cs: blocks.parse()?,
            pages_per_block: pages.parse()?,
            page_data_bytes: data.parse()?,
            page_spare_bytes: spare.parse()?,
            ..Default::default()
        })
    }
}

#[test]
fn test_address_cycles() {
    let config = NandConfig::default();

    // Page 0 of block 0: all-zero cycles
    assert_eq!(config.page_address(0, 0, 0), [0, 0, 0, 0]);

    // Block 1 starts at row 64 on a 64-page chip
    assert_eq!(config.page_address(1, 0, 0), [0, 0, 0x40, 0x00]);
    assert_eq!(config.block_address(1), [0x40, 0x00]);

    // Column crosses its low byte; row crosses its low byte
    assert_eq!(config.page_address(5, 3, 0x0103), [0x03, 0x01, 0x43, 0x01]);
    assert_eq!(config.row(1023, 63), 65535);
}

#[test]
fn test_parse() -> anyhow::Result<()> {
    let config: NandConfig = "2x1024x64x2048x128".parse()?;
    assert_eq!(config, NandConfig::default());
    assert_eq!(config.page_total_bytes(), 2176);
    assert_eq!(config.cs_bytes(), 142_606_336);

    assert!("1x2x3".parse::<NandConfig>().is_err());
    assert!("axbxcxdxe".parse::<NandConfig>().is_err());
    Ok(())
}

#[test]
fn test_bounds() {
    let config = NandConfig::default();
    assert!(config.contains(1023, 63));
    assert!(!config.contains(1024, 0));
    assert!(!config.contains(0, 64));
}
