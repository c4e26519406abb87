//! The durable record of per-chip-select block state, and the bit arrays it
//! carries.
//!
//! The snapshot is the sole source of truth for allocation across restarts,
//! so the format is deliberately paranoid: magic, explicit version, explicit
//! geometry, and a trailing CRC over everything else. Anything that doesn't
//! check out is reported as a distinct [`SnapshotError`] and the block
//! manager falls back to a full media scan rather than trusting a misread.

use std::fs;
use std::path::Path;

use crc::{Crc, CRC_32_ISO_HDLC};
use deku::prelude::*;
use thiserror::Error;

const SNAPSHOT_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

const SNAPSHOT_MAGIC: [u8; 4] = *b"NBMS";
const SNAPSHOT_VERSION: u8 = 1;

const WORD_BITS: u32 = 32;

/// One bit per block on one chip select.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BlockBitmap {
    words: Vec<u32>,
    bits: u32,
}

impl BlockBitmap {
    pub fn new(bits: u32) -> Self {
        Self {
            words: vec![0; Self::words_for(bits) as usize],
            bits,
        }
    }

    /// Number of backing words needed for `bits` bits.
    pub fn words_for(bits: u32) -> u32 {
        bits.div_ceil(WORD_BITS)
    }

    /// Rebuild from persisted words. The word count must match the geometry.
    pub fn from_words(words: Vec<u32>, bits: u32) -> Self {
        assert_eq!(words.len(), Self::words_for(bits) as usize);
        Self { words, bits }
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn get(&self, idx: u32) -> bool {
        assert!(idx < self.bits);
        self.words[(idx / WORD_BITS) as usize] & (1 << (idx % WORD_BITS)) != 0
    }

    pub fn set(&mut self, idx: u32, value: bool) {
        assert!(idx < self.bits);
        let word = &mut self.words[(idx / WORD_BITS) as usize];
        if value {
            *word |= 1 << (idx % WORD_BITS);
        } else {
            *word &= !(1 << (idx % WORD_BITS));
        }
    }

    pub fn count_set(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }
}

/// Everything that makes a snapshot untrustworthy. All of these send the
/// block manager down the rebuild path; none of them are fatal.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot not readable: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot does not parse: {0}")]
    Format(#[from] DekuError),

    #[error("snapshot magic not recognized")]
    Magic,

    #[error("snapshot version {0} not supported")]
    Version(u8),

    #[error("snapshot crc mismatch (stored {stored:08x}, computed {computed:08x})")]
    Crc { stored: u32, computed: u32 },

    #[error("snapshot covers {snapshot} chip selects, {expected} expected")]
    ChipCount { snapshot: usize, expected: usize },

    #[error("snapshot geometry mismatch ({snapshot} words per chip select, {expected} expected)")]
    Geometry { snapshot: u32, expected: u32 },
}

/// The on-disk snapshot layout, all little-endian.
#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct Snapshot {
    magic: [u8; 4],
    version: u8,
    num_cs: u8,
    words_per_cs: u32,

    /// `num_cs * words_per_cs`, stored explicitly so the array lengths below
    /// are part of the schema rather than derived at parse time.
    words_total: u32,

    #[deku(count = "words_total")]
    bad: Vec<u32>,
    #[deku(count = "words_total")]
    allocated: Vec<u32>,

    /// CRC32 of every preceding byte.
    crc: u32,
}

impl Snapshot {
    /// Capture the current bitmaps. `bad` and `allocated` must be parallel
    /// per-chip-select arrays of identical geometry.
    pub fn new(bad: &[BlockBitmap], allocated: &[BlockBitmap]) -> Self {
        assert_eq!(bad.len(), allocated.len());
        let words_per_cs = bad.first().map_or(0, |b| b.words().len() as u32);

        let flatten =
            |maps: &[BlockBitmap]| maps.iter().flat_map(|m| m.words().iter().copied()).collect();

        let mut snapshot = Self {
            magic: SNAPSHOT_MAGIC,
            version: SNAPSHOT_VERSION,
            num_cs: bad.len() as u8,
            words_per_cs,
            words_total: bad.len() as u32 * words_per_cs,
            bad: flatten(bad),
            allocated: flatten(allocated),
            crc: 0,
        };
        snapshot.crc = snapshot.compute_crc();
        snapshot
    }

    fn compute_crc(&self) -> u32 {
        let bytes = self.to_bytes().unwrap();
        SNAPSHOT_CRC.checksum(&bytes[..bytes.len() - std::mem::size_of::<u32>()])
    }

    /// Load and validate a snapshot against the live configuration, handing
    /// back the (bad, allocated) bitmaps.
    pub fn load(
        path: &Path,
        num_cs: usize,
        blocks_per_cs: u32,
    ) -> Result<(Vec<BlockBitmap>, Vec<BlockBitmap>), SnapshotError> {
        let bytes = fs::read(path)?;
        let (_, snapshot) = Snapshot::from_bytes((&bytes, 0))?;

        if snapshot.magic != SNAPSHOT_MAGIC {
            return Err(SnapshotError::Magic);
        }
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::Version(snapshot.version));
        }
        let computed = snapshot.compute_crc();
        if snapshot.crc != computed {
            return Err(SnapshotError::Crc {
                stored: snapshot.crc,
                computed,
            });
        }
        if usize::from(snapshot.num_cs) != num_cs {
            return Err(SnapshotError::ChipCount {
                snapshot: snapshot.num_cs.into(),
                expected: num_cs,
            });
        }
        let expected_words = BlockBitmap::words_for(blocks_per_cs);
        if snapshot.words_per_cs != expected_words
            || snapshot.words_total != snapshot.num_cs as u32 * snapshot.words_per_cs
        {
            return Err(SnapshotError::Geometry {
                snapshot: snapshot.words_per_cs,
                expected: expected_words,
            });
        }

        let unflatten = |words: &[u32]| {
            words
                .chunks(expected_words as usize)
                .map(|chunk| BlockBitmap::from_words(chunk.to_vec(), blocks_per_cs))
                .collect()
        };
        Ok((unflatten(&snapshot.bad), unflatten(&snapshot.allocated)))
    }

    /// Durably write the snapshot: temp file, fsync, then rename over the
    /// previous generation so a crash leaves either the old or the new
    /// snapshot, never a torn one.
    pub fn save(&self, path: &Path) -> Result<(), SnapshotError> {
        let bytes = self.to_bytes()?;

        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            std::io::Write::write_all(&mut file, &bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::scratch_dir;

    fn sample_bitmaps() -> (Vec<BlockBitmap>, Vec<BlockBitmap>) {
        let mut bad = vec![BlockBitmap::new(40); 2];
        let mut allocated = vec![BlockBitmap::new(40); 2];
        bad[0].set(3, true);
        bad[1].set(39, true);
        allocated[0].set(0, true);
        allocated[0].set(17, true);
        allocated[1].set(12, true);
        (bad, allocated)
    }

    #[test]
    fn test_bitmap() {
        let mut map = BlockBitmap::new(70);
        assert_eq!(map.words().len(), 3);
        assert_eq!(map.count_set(), 0);

        for idx in [0, 31, 32, 69] {
            assert!(!map.get(idx));
            map.set(idx, true);
            assert!(map.get(idx));
        }
        assert_eq!(map.count_set(), 4);

        map.set(32, false);
        assert!(!map.get(32));
        assert_eq!(map.count_set(), 3);
    }

    #[test]
    fn test_round_trip() -> anyhow::Result<()> {
        let path = scratch_dir("snapshot-roundtrip").join("state.bin");
        let (bad, allocated) = sample_bitmaps();

        Snapshot::new(&bad, &allocated).save(&path)?;
        let (bad2, allocated2) = Snapshot::load(&path, 2, 40)?;

        assert_eq!(bad, bad2);
        assert_eq!(allocated, allocated2);
        Ok(())
    }

    #[test]
    fn test_missing_file() {
        let path = scratch_dir("snapshot-missing").join("state.bin");
        assert!(matches!(
            Snapshot::load(&path, 2, 40),
            Err(SnapshotError::Io(_))
        ));
    }

    #[test]
    fn test_corruption_is_detected() -> anyhow::Result<()> {
        let path = scratch_dir("snapshot-corrupt").join("state.bin");
        let (bad, allocated) = sample_bitmaps();
        Snapshot::new(&bad, &allocated).save(&path)?;

        let mut bytes = fs::read(&path)?;
        let flip = bytes.len() / 2;
        bytes[flip] ^= 0x10;
        fs::write(&path, &bytes)?;

        assert!(matches!(
            Snapshot::load(&path, 2, 40),
            Err(SnapshotError::Crc { .. })
        ));

        // Truncation doesn't even parse
        fs::write(&path, &bytes[..8])?;
        assert!(matches!(
            Snapshot::load(&path, 2, 40),
            Err(SnapshotError::Format(_))
        ));
        Ok(())
    }

    #[test]
    fn test_config_mismatch_is_rejected() -> anyhow::Result<()> {
        let path = scratch_dir("snapshot-mismatch").join("state.bin");
        let (bad, allocated) = sample_bitmaps();
        Snapshot::new(&bad, &allocated).save(&path)?;

        assert!(matches!(
            Snapshot::load(&path, 1, 40),
            Err(SnapshotError::ChipCount {
                snapshot: 2,
                expected: 1
            })
        ));
        assert!(matches!(
            Snapshot::load(&path, 2, 4000),
            Err(SnapshotError::Geometry { .. })
        ));
        Ok(())
    }
}
