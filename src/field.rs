//! Bit-field primitives for the packed bytes of the CFDP wire format.
//!
//! Every sub-byte field of a PDU is described by a [BitField] constant (shift and width). Encoding
//! and decoding code never does manual masking, it only calls [BitField::get] and
//! [BitField::set] on the byte the field lives in.

/// A field of `width` bits which starts `shift` bits above the least significant bit of a byte.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BitField {
    shift: u8,
    width: u8,
}

impl BitField {
    pub const fn new(shift: u8, width: u8) -> Self {
        assert!(width >= 1 && shift + width <= 8);
        Self { shift, width }
    }

    #[inline]
    pub const fn mask(&self) -> u8 {
        (((1u16 << self.width) - 1) as u8) << self.shift
    }

    #[inline]
    pub const fn max_value(&self) -> u8 {
        ((1u16 << self.width) - 1) as u8
    }

    /// Extract the field value from `byte`.
    #[inline]
    pub const fn get(&self, byte: u8) -> u8 {
        (byte & self.mask()) >> self.shift
    }

    /// Replace the field inside `byte`. Bits of `value` outside the field width are discarded.
    #[inline]
    pub fn set(&self, byte: &mut u8, value: u8) {
        *byte = (*byte & !self.mask()) | ((value << self.shift) & self.mask());
    }

    #[inline]
    pub const fn get_flag(&self, byte: u8) -> bool {
        self.get(byte) != 0
    }

    #[inline]
    pub fn set_flag(&self, byte: &mut u8, flag: bool) {
        self.set(byte, flag as u8);
    }
}

// Fixed header, first byte.
pub const HDR_VERSION: BitField = BitField::new(5, 3);
pub const HDR_PDU_TYPE: BitField = BitField::new(4, 1);
pub const HDR_DIRECTION: BitField = BitField::new(3, 1);
pub const HDR_TRANS_MODE: BitField = BitField::new(2, 1);
pub const HDR_CRC_FLAG: BitField = BitField::new(1, 1);
pub const HDR_LARGE_FILE: BitField = BitField::new(0, 1);

// Fixed header, fourth byte.
pub const HDR_SEG_CTRL: BitField = BitField::new(7, 1);
pub const HDR_EID_LEN: BitField = BitField::new(4, 3);
pub const HDR_SEG_METADATA: BitField = BitField::new(3, 1);
pub const HDR_TSN_LEN: BitField = BitField::new(0, 3);

// Condition code nibble shared by EOF, FIN and ACK.
pub const CONDITION_CODE: BitField = BitField::new(4, 4);

// FIN flags byte.
pub const FIN_DELIVERY_CODE: BitField = BitField::new(2, 1);
pub const FIN_FILE_STATUS: BitField = BitField::new(0, 2);

// ACK bytes.
pub const ACK_DIRECTIVE_CODE: BitField = BitField::new(4, 4);
pub const ACK_SUBTYPE_CODE: BitField = BitField::new(0, 4);
pub const ACK_TXN_STATUS: BitField = BitField::new(0, 2);

// Metadata flags byte.
pub const MD_CLOSURE_REQUESTED: BitField = BitField::new(6, 1);
pub const MD_CHECKSUM_TYPE: BitField = BitField::new(0, 4);

// File data segment metadata byte.
pub const FD_CONTINUATION_STATE: BitField = BitField::new(6, 2);
pub const FD_SEGMENT_COUNT: BitField = BitField::new(0, 6);
