//! Page encoding: scrambling plus an integrity CRC tucked into the spare
//! area.
//!
//! NAND cells dislike long runs of identical bits, so the data area is
//! whitened with an LFSR keystream before it goes to the chip. The CRC32 of
//! the *unscrambled* data lands in the first four spare bytes; the rest of
//! the spare area stays erased. Byte 0 of page 0 doubles as the factory
//! bad-block marker, which lives in the data area on this chip family and is
//! therefore never clobbered by the spare layout.

use crc::{Crc, CRC_32_ISO_HDLC};

use crate::chip::NandConfig;
use crate::error::{Error, Result};

const PAGE_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

const DEFAULT_SCRAMBLE_SEED: u8 = 0xA5;

/// 8-bit Galois LFSR keystream generator.
pub struct Lfsr8 {
    state: u8,
    seed: u8,
}

impl Lfsr8 {
    pub fn new(seed: u8) -> Self {
        Self { state: 1, seed }
    }

    pub fn next(&mut self) -> u8 {
        let feedback = if self.state & 1 != 0 { self.seed } else { 0 };
        self.state = (self.state >> 1) ^ feedback;
        self.state
    }
}

/// Encoder/decoder between a page's data area and its on-chip form.
#[derive(Debug, Copy, Clone)]
pub struct PageCodec {
    config: NandConfig,
    scramble_seed: u8,
}

impl PageCodec {
    pub fn new(config: NandConfig) -> Self {
        Self {
            config,
            scramble_seed: DEFAULT_SCRAMBLE_SEED,
        }
    }

    pub fn with_seed(mut self, seed: u8) -> Self {
        self.scramble_seed = seed;
        self
    }

    fn keystream(&self, data: &[u8]) -> Vec<u8> {
        let mut lfsr = Lfsr8::new(self.scramble_seed);
        data.iter().map(|&b| lfsr.next() ^ b).collect()
    }

    /// Encode a data area into a full page image ready for `program`.
    pub fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() != self.config.page_data_bytes {
            return Err(Error::PageSizeMismatch {
                got: data.len(),
                expected: self.config.page_data_bytes,
            });
        }

        let crc = PAGE_CRC.checksum(data);

        let mut page = self.keystream(data);
        page.resize(self.config.page_total_bytes(), 0xFF);
        page[self.config.page_data_bytes..][..4].copy_from_slice(&crc.to_le_bytes());
        Ok(page)
    }

    /// Decode a full page image back into its data area. `Ok(None)` when the
    /// CRC does not hold, which is also what an erased (never-programmed)
    /// page decodes to.
    pub fn decode(&self, page: &[u8]) -> Result<Option<Vec<u8>>> {
        if page.len() != self.config.page_total_bytes() {
            return Err(Error::PageSizeMismatch {
                got: page.len(),
                expected: self.config.page_total_bytes(),
            });
        }

        let data = self.keystream(&page[..self.config.page_data_bytes]);
        let stored = u32::from_le_bytes(
            page[self.config.page_data_bytes..][..4]
                .try_into()
                .unwrap(),
        );

        if PAGE_CRC.checksum(&data) != stored {
            return Ok(None);
        }
        Ok(Some(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: NandConfig = NandConfig {
        num_cs: 1,
        blocks_per_cs: 4,
        pages_per_block: 4,
        page_data_bytes: 64,
        page_spare_bytes: 8,
        id_expect: [0x98, 0xF1, 0x80, 0x15, 0x72],
    };

    #[test]
    fn test_round_trip() -> anyhow::Result<()> {
        let codec = PageCodec::new(CONFIG);
        let data: Vec<u8> = (0..CONFIG.page_data_bytes).map(|i| (i * 2) as u8).collect();

        let page = codec.encode(&data)?;
        assert_eq!(page.len(), CONFIG.page_total_bytes());
        // Scrambling must actually change the bytes
        assert_ne!(&page[..data.len()], data.as_slice());

        assert_eq!(codec.decode(&page)?, Some(data));
        Ok(())
    }

    #[test]
    fn test_corruption_is_detected() -> anyhow::Result<()> {
        let codec = PageCodec::new(CONFIG);
        let mut page = codec.encode(&vec![0x42; CONFIG.page_data_bytes])?;

        page[17] ^= 0x04;
        assert_eq!(codec.decode(&page)?, None);
        Ok(())
    }

    #[test]
    fn test_erased_page_is_absent() -> anyhow::Result<()> {
        let codec = PageCodec::new(CONFIG);
        let erased = vec![0xFFu8; CONFIG.page_total_bytes()];
        assert_eq!(codec.decode(&erased)?, None);
        Ok(())
    }

    #[test]
    fn test_wrong_length_is_misuse() {
        let codec = PageCodec::new(CONFIG);
        assert!(codec.encode(&[0u8; 3]).is_err());
        assert!(codec.decode(&[0u8; 3]).is_err());
    }

    #[test]
    fn test_keystream_is_deterministic() {
        let stream = |seed| {
            let mut lfsr = Lfsr8::new(seed);
            (0..32).map(|_| lfsr.next()).collect::<Vec<u8>>()
        };

        assert_eq!(stream(0xA5), stream(0xA5));
        assert_ne!(stream(0xA5), stream(0xB7));
        // The generator must keep moving, or "scrambling" is a constant mask
        let s = stream(DEFAULT_SCRAMBLE_SEED);
        assert!(s.windows(2).any(|w| w[0] != w[1]));
    }
}
