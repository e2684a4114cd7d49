//! File checksums used in EOF PDUs and the optional PDU CRC.
use core::fmt::Debug;

use crc::{Crc, Digest, CRC_16_IBM_3740, CRC_32_ISCSI, CRC_32_ISO_HDLC};

use crate::pdu::ChecksumType;

/// [crc::Crc] instance using [crc::CRC_32_ISO_HDLC].
///
/// SANA registry entry: <https://sanaregistry.org/r/checksum_identifiers/records/4>,
/// Entry in CRC catalogue: <https://reveng.sourceforge.io/crc-catalogue/all.htm#crc.cat.crc-32>
pub static CRC_32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
/// [crc::Crc] instance using [crc::CRC_32_ISCSI].
///
/// SANA registry entry: <https://sanaregistry.org/r/checksum_identifiers/records/3>,
/// Entry in CRC catalogue: <https://reveng.sourceforge.io/crc-catalogue/all.htm#crc.cat.crc-32-iscsi>
pub static CRC_32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);
/// CRC-16/CCITT-FALSE, the optional trailer of a PDU with the CRC flag set.
pub static CRC_16_CCITT_FALSE: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// CFDP modular checksum: the sum of the file interpreted as big-endian 32-bit words aligned to
/// file offset zero.
///
/// Each byte contributes according to its file offset, so segments may be added in any order as
/// long as every byte is added exactly once.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ModularChecksum {
    sum: u32,
}

impl ModularChecksum {
    pub fn update(&mut self, offset: u64, data: &[u8]) {
        for (idx, byte) in data.iter().enumerate() {
            let shift = 24 - 8 * ((offset + idx as u64) % 4) as u32;
            self.sum = self.sum.wrapping_add((*byte as u32) << shift);
        }
    }

    #[inline]
    pub fn value(&self) -> u32 {
        self.sum
    }
}

/// Checksum which is fed segment by segment.
///
/// The CRC variants require the data in file order. The modular variant does not.
pub enum RunningChecksum {
    Modular(ModularChecksum),
    Crc(Digest<'static, u32>),
    Null,
}

impl Debug for RunningChecksum {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RunningChecksum::Modular(m) => write!(f, "Modular({:#010x})", m.value()),
            RunningChecksum::Crc(_) => write!(f, "Crc"),
            RunningChecksum::Null => write!(f, "Null"),
        }
    }
}

impl RunningChecksum {
    /// Returns [None] for checksum types this crate can not calculate.
    pub fn new(checksum_type: ChecksumType) -> Option<Self> {
        Some(match checksum_type {
            ChecksumType::Modular => RunningChecksum::Modular(ModularChecksum::default()),
            ChecksumType::Crc32 => RunningChecksum::Crc(CRC_32.digest()),
            ChecksumType::Crc32C => RunningChecksum::Crc(CRC_32C.digest()),
            ChecksumType::NullChecksum => RunningChecksum::Null,
            ChecksumType::Crc32Proximity1 => return None,
        })
    }

    pub fn update(&mut self, offset: u64, data: &[u8]) {
        match self {
            RunningChecksum::Modular(m) => m.update(offset, data),
            RunningChecksum::Crc(digest) => digest.update(data),
            RunningChecksum::Null => (),
        }
    }

    pub fn finalize(self) -> u32 {
        match self {
            RunningChecksum::Modular(m) => m.value(),
            RunningChecksum::Crc(digest) => digest.finalize(),
            RunningChecksum::Null => 0,
        }
    }
}

/// Checksum of a complete in-memory block starting at file offset zero.
pub fn calculate_checksum(checksum_type: ChecksumType, data: &[u8]) -> Option<u32> {
    let mut checksum = RunningChecksum::new(checksum_type)?;
    checksum.update(0, data);
    Some(checksum.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modular_aligned_words() {
        let mut checksum = ModularChecksum::default();
        checksum.update(0, &[0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02]);
        assert_eq!(checksum.value(), 3);
    }

    #[test]
    fn test_modular_pads_last_word() {
        let mut checksum = ModularChecksum::default();
        checksum.update(0, &[0x01, 0x02, 0x03, 0x04, 0x05]);
        assert_eq!(checksum.value(), 0x0102_0304 + 0x0500_0000);
    }

    #[test]
    fn test_modular_out_of_order() {
        let data: [u8; 11] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11];
        let mut in_order = ModularChecksum::default();
        in_order.update(0, &data);
        let mut shuffled = ModularChecksum::default();
        shuffled.update(7, &data[7..]);
        shuffled.update(0, &data[0..3]);
        shuffled.update(3, &data[3..7]);
        assert_eq!(in_order, shuffled);
    }

    #[test]
    fn test_modular_wraps() {
        let mut checksum = ModularChecksum::default();
        checksum.update(0, &[0xff; 8]);
        assert_eq!(checksum.value(), 0xffff_fffe);
    }

    #[test]
    fn test_crc32_matches_reference() {
        // Check value from the CRC catalogue.
        assert_eq!(
            calculate_checksum(ChecksumType::Crc32, b"123456789"),
            Some(0xcbf4_3926)
        );
        assert_eq!(
            calculate_checksum(ChecksumType::Crc32C, b"123456789"),
            Some(0xe306_9283)
        );
    }

    #[test]
    fn test_crc_streaming() {
        let mut checksum = RunningChecksum::new(ChecksumType::Crc32).unwrap();
        checksum.update(0, b"1234");
        checksum.update(4, b"56789");
        assert_eq!(checksum.finalize(), 0xcbf4_3926);
    }

    #[test]
    fn test_null_and_unsupported() {
        assert_eq!(calculate_checksum(ChecksumType::NullChecksum, b"abc"), Some(0));
        assert!(RunningChecksum::new(ChecksumType::Crc32Proximity1).is_none());
    }

    #[test]
    fn test_pdu_crc_check_value() {
        assert_eq!(CRC_16_CCITT_FALSE.checksum(b"123456789"), 0x29b1);
    }
}
