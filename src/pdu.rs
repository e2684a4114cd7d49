//! Normalized in-memory representation of CFDP packet data units (PDUs).
//!
//! The types in this module are plain fielded records with host byte order values. They are in
//! 1:1 semantic correspondence with the bit-packed wire layouts, and the [crate::codec] module is
//! the only place which translates between the two.
//!
//! Decoded PDUs borrow file names, opaque TLV payloads and file segment data directly from the
//! buffer they were decoded from. Nothing is copied, so a [LogicalPdu] is only valid as long as
//! that buffer.
use derive_new::new;
use num_enum::{IntoPrimitive, TryFromPrimitive};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{codec::encoded_size, EntityId, TransactionId, TransactionSeq};

/// Value of the 3-bit version field for CFDP version 2 (CCSDS 727.0-B-5).
pub const CFDP_VERSION_2: u8 = 0b001;

/// Maximum number of segment requests carried by one NAK PDU.
pub const NAK_MAX_SEGMENTS: usize = 58;
/// Maximum number of segment requests in the segment metadata of a file data PDU.
pub const FD_MAX_SEGMENTS: usize = 63;
/// Maximum number of TLVs decoded from a single FIN or Metadata PDU.
pub const MAX_TLV: usize = 4;

/// Fixed part of the PDU header without the variable-width entity IDs and sequence number.
pub const FIXED_HEADER_LEN: usize = 4;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum PduType {
    #[default]
    FileDirective = 0,
    FileData = 1,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Direction {
    #[default]
    TowardsReceiver = 0,
    TowardsSender = 1,
}

/// Class 2 transfers are acknowledged, class 1 transfers are unacknowledged.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum TransmissionMode {
    Acknowledged = 0,
    #[default]
    Unacknowledged = 1,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum CrcFlag {
    #[default]
    NoCrc = 0,
    WithCrc = 1,
}

impl From<bool> for CrcFlag {
    fn from(value: bool) -> Self {
        if value {
            CrcFlag::WithCrc
        } else {
            CrcFlag::NoCrc
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum LargeFileFlag {
    #[default]
    Normal = 0,
    Large = 1,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum SegmentationControl {
    #[default]
    NoRecordBoundaryPreservation = 0,
    WithRecordBoundaryPreservation = 1,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum SegmentMetadataFlag {
    #[default]
    NotPresent = 0,
    Present = 1,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum FileDirectiveType {
    EofPdu = 0x04,
    FinishedPdu = 0x05,
    AckPdu = 0x06,
    MetadataPdu = 0x07,
    NakPdu = 0x08,
    PromptPdu = 0x09,
    KeepAlivePdu = 0x0c,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ConditionCode {
    #[default]
    NoError = 0b0000,
    PositiveAckLimitReached = 0b0001,
    KeepAliveLimitReached = 0b0010,
    InvalidTransmissionMode = 0b0011,
    FilestoreRejection = 0b0100,
    FileChecksumFailure = 0b0101,
    FileSizeError = 0b0110,
    NakLimitReached = 0b0111,
    InactivityDetected = 0b1000,
    InvalidFileStructure = 0b1001,
    CheckLimitReached = 0b1010,
    UnsupportedChecksumType = 0b1011,
    SuspendRequestReceived = 0b1110,
    CancelRequestReceived = 0b1111,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum DeliveryCode {
    #[default]
    Complete = 0,
    Incomplete = 1,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum FileStatus {
    DiscardDeliberately = 0b00,
    DiscardedFsRejection = 0b01,
    Retained = 0b10,
    #[default]
    Unreported = 0b11,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum TransactionStatus {
    #[default]
    Undefined = 0b00,
    Active = 0b01,
    Terminated = 0b10,
    Unrecognized = 0b11,
}

/// SANA checksum identifiers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ChecksumType {
    #[default]
    Modular = 0,
    Crc32Proximity1 = 1,
    Crc32C = 2,
    Crc32 = 3,
    NullChecksum = 15,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum TlvType {
    FilestoreRequest = 0x00,
    FilestoreResponse = 0x01,
    MsgToUser = 0x02,
    FaultHandler = 0x04,
    FlowLabel = 0x05,
    EntityId = 0x06,
}

/// Logical PDU header.
///
/// `eid_length` and `tsn_length` are the byte widths (1 to 8) of the entity IDs and the
/// sequence number. `header_encoded_length` and `data_encoded_length` are filled in by the codec.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PduHeader {
    pub version: u8,
    pub pdu_type: PduType,
    pub direction: Direction,
    pub trans_mode: TransmissionMode,
    pub crc_flag: CrcFlag,
    pub large_file_flag: LargeFileFlag,
    pub seg_ctrl: SegmentationControl,
    pub seg_metadata_flag: SegmentMetadataFlag,
    pub eid_length: u8,
    pub tsn_length: u8,
    pub header_encoded_length: u16,
    pub data_encoded_length: u16,
    pub source_eid: EntityId,
    pub destination_eid: EntityId,
    pub sequence_num: TransactionSeq,
}

impl PduHeader {
    /// Create a header with the smallest field widths able to hold the passed IDs. Both entity
    /// IDs share one width on the wire, so the larger of the two sizes is used.
    pub fn new(
        pdu_type: PduType,
        direction: Direction,
        trans_mode: TransmissionMode,
        source_eid: EntityId,
        destination_eid: EntityId,
        sequence_num: TransactionSeq,
    ) -> Self {
        Self {
            version: CFDP_VERSION_2,
            pdu_type,
            direction,
            trans_mode,
            crc_flag: CrcFlag::NoCrc,
            large_file_flag: LargeFileFlag::Normal,
            seg_ctrl: SegmentationControl::NoRecordBoundaryPreservation,
            seg_metadata_flag: SegmentMetadataFlag::NotPresent,
            eid_length: core::cmp::max(encoded_size(source_eid), encoded_size(destination_eid)),
            tsn_length: encoded_size(sequence_num),
            header_encoded_length: 0,
            data_encoded_length: 0,
            source_eid,
            destination_eid,
            sequence_num,
        }
    }

    #[inline]
    pub fn transaction_id(&self) -> TransactionId {
        TransactionId::new(self.source_eid, self.sequence_num)
    }

    /// Encoded length of the complete header for the current field widths.
    #[inline]
    pub fn len_for_widths(&self) -> usize {
        FIXED_HEADER_LEN + 2 * self.eid_length as usize + self.tsn_length as usize
    }
}

/// Length-value item, used for file names.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Lv<'a> {
    pub value: &'a [u8],
}

impl<'a> Lv<'a> {
    pub const fn new(value: &'a [u8]) -> Self {
        Self { value }
    }

    pub const fn new_from_str(value: &'a str) -> Self {
        Self {
            value: value.as_bytes(),
        }
    }

    #[inline]
    pub fn as_str(&self) -> Option<&'a str> {
        core::str::from_utf8(self.value).ok()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

/// TLV payload. Only entity ID TLVs are interpreted, every other type is kept as a slice into
/// the buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TlvValue<'a> {
    EntityId(EntityId),
    Opaque(&'a [u8]),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, new)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Tlv<'a> {
    pub tlv_type: u8,
    pub value: TlvValue<'a>,
}

impl Tlv<'_> {
    pub fn new_entity_id(eid: EntityId) -> Self {
        Self {
            tlv_type: TlvType::EntityId as u8,
            value: TlvValue::EntityId(eid),
        }
    }

    #[inline]
    pub fn tlv_type(&self) -> Option<TlvType> {
        TlvType::try_from(self.tlv_type).ok()
    }
}

pub type TlvList<'a> = SmallVec<[Tlv<'a>; MAX_TLV]>;

/// Segment request with an inclusive start and exclusive end offset. The request (0, 0) asks
/// for the Metadata PDU.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, new)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SegmentRequest {
    pub offset_start: u64,
    pub offset_end: u64,
}

impl SegmentRequest {
    pub const METADATA: SegmentRequest = SegmentRequest {
        offset_start: 0,
        offset_end: 0,
    };

    #[inline]
    pub fn is_metadata_request(&self) -> bool {
        *self == Self::METADATA
    }
}

pub type SegmentList = SmallVec<[SegmentRequest; NAK_MAX_SEGMENTS]>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eof<'a> {
    pub condition_code: ConditionCode,
    pub crc: u32,
    pub size: u64,
    pub fault_location: Option<Tlv<'a>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fin<'a> {
    pub condition_code: ConditionCode,
    pub delivery_code: DeliveryCode,
    pub file_status: FileStatus,
    pub tlv_list: TlvList<'a>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Ack {
    pub ack_directive: FileDirectiveType,
    pub ack_subtype: u8,
    pub condition_code: ConditionCode,
    pub txn_status: TransactionStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata<'a> {
    pub closure_requested: bool,
    pub checksum_type: u8,
    pub size: u64,
    pub source_filename: Lv<'a>,
    pub dest_filename: Lv<'a>,
    pub options: TlvList<'a>,
}

impl Metadata<'_> {
    /// Checksum type, if it is one of the known SANA identifiers.
    #[inline]
    pub fn checksum(&self) -> Option<ChecksumType> {
        ChecksumType::try_from(self.checksum_type).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Nak {
    pub scope_start: u64,
    pub scope_end: u64,
    pub segment_requests: SegmentList,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileData<'a> {
    /// Record continuation state, only meaningful with segment metadata present.
    pub continuation_state: u8,
    pub segment_list: SegmentList,
    pub offset: u64,
    pub data: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectiveBody<'a> {
    Eof(Eof<'a>),
    Fin(Fin<'a>),
    Ack(Ack),
    Metadata(Metadata<'a>),
    Nak(Nak),
    Prompt { keep_alive_response: bool },
    KeepAlive { progress: u64 },
}

impl DirectiveBody<'_> {
    pub fn directive_type(&self) -> FileDirectiveType {
        match self {
            DirectiveBody::Eof(_) => FileDirectiveType::EofPdu,
            DirectiveBody::Fin(_) => FileDirectiveType::FinishedPdu,
            DirectiveBody::Ack(_) => FileDirectiveType::AckPdu,
            DirectiveBody::Metadata(_) => FileDirectiveType::MetadataPdu,
            DirectiveBody::Nak(_) => FileDirectiveType::NakPdu,
            DirectiveBody::Prompt { .. } => FileDirectiveType::PromptPdu,
            DirectiveBody::KeepAlive { .. } => FileDirectiveType::KeepAlivePdu,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PduBody<'a> {
    Directive(DirectiveBody<'a>),
    FileData(FileData<'a>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalPdu<'a> {
    pub header: PduHeader,
    pub body: PduBody<'a>,
}

impl<'a> LogicalPdu<'a> {
    /// Create a directive PDU. The header PDU type is forced to match the body.
    pub fn new_directive(mut header: PduHeader, body: DirectiveBody<'a>) -> Self {
        header.pdu_type = PduType::FileDirective;
        Self {
            header,
            body: PduBody::Directive(body),
        }
    }

    /// Create a file data PDU. The segment metadata flag follows the segment list.
    pub fn new_file_data(mut header: PduHeader, file_data: FileData<'a>) -> Self {
        header.pdu_type = PduType::FileData;
        header.seg_metadata_flag = if file_data.segment_list.is_empty() {
            SegmentMetadataFlag::NotPresent
        } else {
            SegmentMetadataFlag::Present
        };
        Self {
            header,
            body: PduBody::FileData(file_data),
        }
    }

    #[inline]
    pub fn directive_type(&self) -> Option<FileDirectiveType> {
        match &self.body {
            PduBody::Directive(body) => Some(body.directive_type()),
            PduBody::FileData(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_widths() {
        let header = PduHeader::new(
            PduType::FileDirective,
            Direction::TowardsReceiver,
            TransmissionMode::Acknowledged,
            25,
            0x1_0000,
            300,
        );
        assert_eq!(header.eid_length, 3);
        assert_eq!(header.tsn_length, 2);
        assert_eq!(header.len_for_widths(), 4 + 6 + 2);
        assert_eq!(header.transaction_id(), TransactionId::new(25, 300));
    }

    #[test]
    fn test_enum_conversions() {
        assert_eq!(
            ConditionCode::try_from(0b1111).unwrap(),
            ConditionCode::CancelRequestReceived
        );
        assert!(ConditionCode::try_from(12).is_err());
        assert_eq!(u8::from(FileDirectiveType::KeepAlivePdu), 0x0c);
        assert!(ChecksumType::try_from(4).is_err());
        assert_eq!(CrcFlag::from(true), CrcFlag::WithCrc);
    }

    #[test]
    fn test_file_data_sets_segment_flag() {
        let header = PduHeader::new(
            PduType::FileDirective,
            Direction::TowardsReceiver,
            TransmissionMode::Unacknowledged,
            1,
            2,
            3,
        );
        let mut fd = FileData::default();
        let pdu = LogicalPdu::new_file_data(header, fd.clone());
        assert_eq!(pdu.header.pdu_type, PduType::FileData);
        assert_eq!(pdu.header.seg_metadata_flag, SegmentMetadataFlag::NotPresent);
        fd.segment_list.push(SegmentRequest::new(0, 10));
        let pdu = LogicalPdu::new_file_data(header, fd);
        assert_eq!(pdu.header.seg_metadata_flag, SegmentMetadataFlag::Present);
        assert!(pdu.directive_type().is_none());
    }

    #[test]
    fn test_lv_str() {
        let lv = Lv::new_from_str("hello.txt");
        assert_eq!(lv.as_str(), Some("hello.txt"));
        assert!(!lv.is_empty());
        assert!(Lv::new(&[0xff, 0xfe]).as_str().is_none());
    }
}
