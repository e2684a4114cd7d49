//! # PDU Codec
//!
//! Translates between the bit-packed network representation of CFDP PDUs and the logical
//! records of the [crate::pdu] module.
//!
//! Both directions work on a [CodecState] which tracks a cursor and a limit over a fixed byte
//! buffer. Every encode or decode step first reserves the bytes it needs. If a reservation would
//! overrun the limit, the state becomes invalid and the step does nothing. Invalidation latches:
//! no later step on the same state has any effect. This allows writing the encoding and decoding
//! of each PDU type as a straight-line sequence of steps, with a single validity check at the
//! end ([CodecState::is_ok]).
//!
//! Header encoding happens in two phases. [Encoder::encode_header_without_size] writes the
//! header with a zero length field, and [Encoder::encode_header_final_size] patches the data
//! field length once the body is complete. This patch is the only backwards write of the codec.
//!
//! The high level entry points are [encode_pdu] and [decode_pdu].
use crate::{
    checksum::CRC_16_CCITT_FALSE,
    field::{self, BitField},
    pdu::{
        Ack, ConditionCode, CrcFlag, DeliveryCode, Direction, DirectiveBody, Eof, FileData,
        FileDirectiveType, FileStatus, Fin, LargeFileFlag, LogicalPdu, Lv, Metadata, Nak, PduBody,
        PduHeader, PduType, SegmentList, SegmentMetadataFlag, SegmentRequest, SegmentationControl,
        Tlv, TlvList, TlvType, TlvValue, TransactionStatus, TransmissionMode, FD_MAX_SEGMENTS,
        MAX_TLV, NAK_MAX_SEGMENTS,
    },
};

/// Length of the optional CRC trailer of a PDU.
pub const PDU_CRC_LEN: usize = 2;

/// Minimal number of bytes (1 to 8) required to hold `value`.
///
/// Each added byte multiplies the representable range by 256, starting at 2^8 for one byte.
#[inline]
pub const fn encoded_size(value: u64) -> u8 {
    let bits = 64 - value.leading_zeros();
    if bits <= 8 {
        1
    } else {
        bits.div_ceil(8) as u8
    }
}

/// Cursor, limit and validity of one encode or decode pass.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CodecState {
    is_valid: bool,
    next_offset: usize,
    max_size: usize,
}

impl CodecState {
    pub const fn new(max_size: usize) -> Self {
        Self {
            is_valid: true,
            next_offset: 0,
            max_size,
        }
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        self.is_valid
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.next_offset
    }

    #[inline]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.max_size.saturating_sub(self.next_offset)
    }

    #[inline]
    pub fn set_invalid(&mut self) {
        self.is_valid = false;
    }

    /// Lower the limit, for example to the length declared in a decoded header. The limit can
    /// never grow, and lowering it below the cursor invalidates the state.
    pub fn restrict(&mut self, max_size: usize) {
        if max_size < self.next_offset {
            self.is_valid = false;
        }
        if max_size < self.max_size {
            self.max_size = max_size;
        }
    }

    /// Checked reservation of `len` bytes. Returns the start offset of the reserved region.
    fn reserve(&mut self, len: usize) -> Option<usize> {
        if !self.is_valid {
            return None;
        }
        match self.next_offset.checked_add(len) {
            Some(end) if end <= self.max_size => {
                let start = self.next_offset;
                self.next_offset = end;
                Some(start)
            }
            _ => {
                self.is_valid = false;
                None
            }
        }
    }
}

#[inline]
fn valid_width(width: u8) -> bool {
    (1..=8).contains(&width)
}

/// Serializes logical PDUs into a caller supplied buffer.
#[derive(Debug)]
pub struct Encoder<'buf> {
    state: CodecState,
    buf: &'buf mut [u8],
}

impl<'buf> Encoder<'buf> {
    pub fn new(buf: &'buf mut [u8]) -> Self {
        let len = buf.len();
        Self {
            state: CodecState::new(len),
            buf,
        }
    }

    #[inline]
    pub fn state(&self) -> &CodecState {
        &self.state
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        self.state.is_ok()
    }

    /// Reserve `len` bytes and hand them out for writing.
    pub fn reserve(&mut self, len: usize) -> Option<&mut [u8]> {
        let start = self.state.reserve(len)?;
        Some(&mut self.buf[start..start + len])
    }

    pub fn put_u8(&mut self, value: u8) {
        if let Some(dest) = self.reserve(1) {
            dest[0] = value;
        }
    }

    pub fn put_u16(&mut self, value: u16) {
        if let Some(dest) = self.reserve(2) {
            dest.copy_from_slice(&value.to_be_bytes());
        }
    }

    pub fn put_u32(&mut self, value: u32) {
        if let Some(dest) = self.reserve(4) {
            dest.copy_from_slice(&value.to_be_bytes());
        }
    }

    /// Write a 32-bit file size or offset field. Values above [u32::MAX] require the large file
    /// extension and invalidate the state.
    pub fn put_file_size(&mut self, value: u64) {
        match u32::try_from(value) {
            Ok(value) => self.put_u32(value),
            Err(_) => self.state.set_invalid(),
        }
    }

    /// Integer Codec: write `value` in network byte order using exactly `width` bytes.
    pub fn put_integer(&mut self, value: u64, width: u8) {
        if !valid_width(width) || encoded_size(value) > width {
            self.state.set_invalid();
            return;
        }
        if let Some(dest) = self.reserve(width as usize) {
            dest.copy_from_slice(&value.to_be_bytes()[8 - width as usize..]);
        }
    }

    pub fn put_bytes(&mut self, data: &[u8]) {
        if let Some(dest) = self.reserve(data.len()) {
            dest.copy_from_slice(data);
        }
    }

    pub fn encode_lv(&mut self, lv: &Lv) {
        match u8::try_from(lv.value.len()) {
            Ok(len) => {
                self.put_u8(len);
                self.put_bytes(lv.value);
            }
            Err(_) => self.state.set_invalid(),
        }
    }

    pub fn encode_tlv(&mut self, tlv: &Tlv) {
        self.put_u8(tlv.tlv_type);
        match tlv.value {
            TlvValue::EntityId(eid) => {
                let width = encoded_size(eid);
                self.put_u8(width);
                self.put_integer(eid, width);
            }
            TlvValue::Opaque(data) => match u8::try_from(data.len()) {
                Ok(len) => {
                    self.put_u8(len);
                    self.put_bytes(data);
                }
                Err(_) => self.state.set_invalid(),
            },
        }
    }

    pub fn encode_segment_request(&mut self, request: &SegmentRequest) {
        self.put_file_size(request.offset_start);
        self.put_file_size(request.offset_end);
    }

    /// First header phase. The header must be the first item in the buffer. Fills in the
    /// `header_encoded_length` of the passed header.
    pub fn encode_header_without_size(&mut self, header: &mut PduHeader) {
        if !valid_width(header.eid_length) || !valid_width(header.tsn_length) {
            self.state.set_invalid();
            return;
        }
        let mut flags = 0;
        field::HDR_VERSION.set(&mut flags, header.version);
        field::HDR_PDU_TYPE.set(&mut flags, header.pdu_type as u8);
        field::HDR_DIRECTION.set(&mut flags, header.direction as u8);
        field::HDR_TRANS_MODE.set(&mut flags, header.trans_mode as u8);
        field::HDR_CRC_FLAG.set(&mut flags, header.crc_flag as u8);
        field::HDR_LARGE_FILE.set(&mut flags, header.large_file_flag as u8);
        self.put_u8(flags);
        // Data field length, patched by the second phase.
        self.put_u16(0);
        let mut lengths = 0;
        field::HDR_SEG_CTRL.set(&mut lengths, header.seg_ctrl as u8);
        field::HDR_EID_LEN.set(&mut lengths, header.eid_length - 1);
        field::HDR_SEG_METADATA.set(&mut lengths, header.seg_metadata_flag as u8);
        field::HDR_TSN_LEN.set(&mut lengths, header.tsn_length - 1);
        self.put_u8(lengths);
        self.put_integer(header.source_eid, header.eid_length);
        self.put_integer(header.sequence_num, header.tsn_length);
        self.put_integer(header.destination_eid, header.eid_length);
        header.header_encoded_length = self.state.position() as u16;
    }

    /// Second header phase: patch the data field length now that the body is complete, then
    /// append the CRC trailer if the header requests one. Returns the total PDU length.
    pub fn encode_header_final_size(&mut self, header: &mut PduHeader) -> Option<usize> {
        let crc_len = if header.crc_flag == CrcFlag::WithCrc {
            PDU_CRC_LEN
        } else {
            0
        };
        if !self.is_ok() || self.state.position() < header.header_encoded_length as usize {
            self.state.set_invalid();
            return None;
        }
        let data_len = self.state.position() - header.header_encoded_length as usize + crc_len;
        let data_len = match u16::try_from(data_len) {
            Ok(len) => len,
            Err(_) => {
                self.state.set_invalid();
                return None;
            }
        };
        // Make sure the trailer fits before touching the length field.
        if self.state.remaining() < crc_len {
            self.state.set_invalid();
            return None;
        }
        self.buf[1..3].copy_from_slice(&data_len.to_be_bytes());
        header.data_encoded_length = data_len;
        if crc_len > 0 {
            let crc = CRC_16_CCITT_FALSE.checksum(&self.buf[0..self.state.position()]);
            self.put_u16(crc);
        }
        if self.is_ok() {
            Some(self.state.position())
        } else {
            None
        }
    }

    pub fn encode_directive_code(&mut self, directive: FileDirectiveType) {
        self.put_u8(directive as u8);
    }

    pub fn encode_eof(&mut self, eof: &Eof) {
        let mut cc = 0;
        field::CONDITION_CODE.set(&mut cc, eof.condition_code as u8);
        self.put_u8(cc);
        self.put_u32(eof.crc);
        self.put_file_size(eof.size);
        if let Some(tlv) = &eof.fault_location {
            self.encode_tlv(tlv);
        }
    }

    pub fn encode_fin(&mut self, fin: &Fin) {
        let mut flags = 0;
        field::CONDITION_CODE.set(&mut flags, fin.condition_code as u8);
        field::FIN_DELIVERY_CODE.set(&mut flags, fin.delivery_code as u8);
        field::FIN_FILE_STATUS.set(&mut flags, fin.file_status as u8);
        self.put_u8(flags);
        for tlv in &fin.tlv_list {
            self.encode_tlv(tlv);
        }
    }

    pub fn encode_ack(&mut self, ack: &Ack) {
        let mut codes = 0;
        field::ACK_DIRECTIVE_CODE.set(&mut codes, ack.ack_directive as u8);
        field::ACK_SUBTYPE_CODE.set(&mut codes, ack.ack_subtype);
        self.put_u8(codes);
        let mut status = 0;
        field::CONDITION_CODE.set(&mut status, ack.condition_code as u8);
        field::ACK_TXN_STATUS.set(&mut status, ack.txn_status as u8);
        self.put_u8(status);
    }

    pub fn encode_metadata(&mut self, md: &Metadata) {
        let mut flags = 0;
        field::MD_CLOSURE_REQUESTED.set_flag(&mut flags, md.closure_requested);
        field::MD_CHECKSUM_TYPE.set(&mut flags, md.checksum_type);
        self.put_u8(flags);
        self.put_file_size(md.size);
        self.encode_lv(&md.source_filename);
        self.encode_lv(&md.dest_filename);
        for tlv in &md.options {
            self.encode_tlv(tlv);
        }
    }

    pub fn encode_nak(&mut self, nak: &Nak) {
        if nak.segment_requests.len() > NAK_MAX_SEGMENTS {
            self.state.set_invalid();
            return;
        }
        self.put_file_size(nak.scope_start);
        self.put_file_size(nak.scope_end);
        for request in &nak.segment_requests {
            self.encode_segment_request(request);
        }
    }

    /// File data header: optional segment metadata and the offset. The payload is appended by
    /// the caller, either with [Self::put_bytes] or by filling [Self::reserve] directly.
    pub fn encode_file_data_header(&mut self, seg_metadata: SegmentMetadataFlag, fd: &FileData) {
        if seg_metadata == SegmentMetadataFlag::Present {
            if fd.segment_list.len() > FD_MAX_SEGMENTS {
                self.state.set_invalid();
                return;
            }
            let mut meta = 0;
            field::FD_CONTINUATION_STATE.set(&mut meta, fd.continuation_state);
            field::FD_SEGMENT_COUNT.set(&mut meta, fd.segment_list.len() as u8);
            self.put_u8(meta);
            for request in &fd.segment_list {
                self.encode_segment_request(request);
            }
        }
        self.put_file_size(fd.offset);
    }
}

/// Encode a complete PDU into `buf`. Returns the PDU length or [None] if the buffer is too small
/// or a field can not be represented.
pub fn encode_pdu(buf: &mut [u8], pdu: &mut LogicalPdu) -> Option<usize> {
    let mut encoder = Encoder::new(buf);
    encoder.encode_header_without_size(&mut pdu.header);
    match &pdu.body {
        PduBody::Directive(body) => {
            encoder.encode_directive_code(body.directive_type());
            match body {
                DirectiveBody::Eof(eof) => encoder.encode_eof(eof),
                DirectiveBody::Fin(fin) => encoder.encode_fin(fin),
                DirectiveBody::Ack(ack) => encoder.encode_ack(ack),
                DirectiveBody::Metadata(md) => encoder.encode_metadata(md),
                DirectiveBody::Nak(nak) => encoder.encode_nak(nak),
                DirectiveBody::Prompt {
                    keep_alive_response,
                } => encoder.put_u8((*keep_alive_response as u8) << 7),
                DirectiveBody::KeepAlive { progress } => encoder.put_file_size(*progress),
            }
        }
        PduBody::FileData(fd) => {
            encoder.encode_file_data_header(pdu.header.seg_metadata_flag, fd);
            encoder.put_bytes(fd.data);
        }
    }
    encoder.encode_header_final_size(&mut pdu.header)
}

/// Deserializes logical PDUs from a byte buffer. Decoded items borrow from the buffer.
#[derive(Debug)]
pub struct Decoder<'buf> {
    state: CodecState,
    buf: &'buf [u8],
}

impl<'buf> Decoder<'buf> {
    pub fn new(buf: &'buf [u8]) -> Self {
        Self {
            state: CodecState::new(buf.len()),
            buf,
        }
    }

    #[inline]
    pub fn state(&self) -> &CodecState {
        &self.state
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        self.state.is_ok()
    }

    pub fn take(&mut self, len: usize) -> Option<&'buf [u8]> {
        let start = self.state.reserve(len)?;
        Some(&self.buf[start..start + len])
    }

    /// Consume everything up to the current limit.
    pub fn take_remaining(&mut self) -> &'buf [u8] {
        let remaining = self.state.remaining();
        self.take(remaining).unwrap_or(&[])
    }

    pub fn get_u8(&mut self) -> u8 {
        self.take(1).map(|b| b[0]).unwrap_or(0)
    }

    pub fn get_u16(&mut self) -> u16 {
        self.take(2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .unwrap_or(0)
    }

    pub fn get_u32(&mut self) -> u32 {
        self.take(4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            .unwrap_or(0)
    }

    /// Integer Codec: read a `width` byte network order integer.
    pub fn get_integer(&mut self, width: u8) -> u64 {
        if !valid_width(width) {
            self.state.set_invalid();
            return 0;
        }
        self.take(width as usize)
            .map(|bytes| bytes.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64))
            .unwrap_or(0)
    }

    /// Convert a raw field value into an enumeration, invalidating the state for unknown values.
    fn get_enum<T: TryFrom<u8> + Default>(&mut self, raw: u8) -> T {
        match T::try_from(raw) {
            Ok(value) => value,
            Err(_) => {
                self.state.set_invalid();
                T::default()
            }
        }
    }

    fn get_field_enum<T: TryFrom<u8> + Default>(&mut self, field: BitField, byte: u8) -> T {
        self.get_enum(field.get(byte))
    }

    pub fn decode_lv(&mut self) -> Lv<'buf> {
        let len = self.get_u8() as usize;
        Lv::new(self.take(len).unwrap_or(&[]))
    }

    pub fn decode_tlv(&mut self) -> Tlv<'buf> {
        let tlv_type = self.get_u8();
        let len = self.get_u8();
        let value = if tlv_type == TlvType::EntityId as u8 {
            TlvValue::EntityId(self.get_integer(len))
        } else {
            TlvValue::Opaque(self.take(len as usize).unwrap_or(&[]))
        };
        Tlv::new(tlv_type, value)
    }

    /// Decode TLVs until the limit is reached. More than [MAX_TLV] items invalidate the state.
    pub fn decode_tlv_list(&mut self) -> TlvList<'buf> {
        let mut list = TlvList::new();
        while self.is_ok() && self.state.remaining() > 0 {
            if list.len() == MAX_TLV {
                self.state.set_invalid();
                break;
            }
            let tlv = self.decode_tlv();
            if self.is_ok() {
                list.push(tlv);
            }
        }
        list
    }

    pub fn decode_segment_request(&mut self) -> SegmentRequest {
        let start = self.get_u32() as u64;
        let end = self.get_u32() as u64;
        SegmentRequest::new(start, end)
    }

    /// Decode segment requests until the limit is reached or `max_count` were read. More than
    /// `capacity` requests invalidate the state.
    fn decode_segment_list(&mut self, max_count: Option<usize>, capacity: usize) -> SegmentList {
        let mut list = SegmentList::new();
        while self.is_ok() && self.state.remaining() > 0 {
            if max_count.is_some_and(|max| list.len() >= max) {
                break;
            }
            if list.len() == capacity {
                self.state.set_invalid();
                break;
            }
            let request = self.decode_segment_request();
            if self.is_ok() {
                list.push(request);
            }
        }
        if max_count.is_some_and(|max| list.len() < max) {
            self.state.set_invalid();
        }
        list
    }

    pub fn decode_header(&mut self) -> PduHeader {
        let flags = self.get_u8();
        let data_len = self.get_u16();
        let lengths = self.get_u8();
        let eid_length = field::HDR_EID_LEN.get(lengths) + 1;
        let tsn_length = field::HDR_TSN_LEN.get(lengths) + 1;
        let source_eid = self.get_integer(eid_length);
        let sequence_num = self.get_integer(tsn_length);
        let destination_eid = self.get_integer(eid_length);
        PduHeader {
            version: field::HDR_VERSION.get(flags),
            pdu_type: self.get_field_enum::<PduType>(field::HDR_PDU_TYPE, flags),
            direction: self.get_field_enum::<Direction>(field::HDR_DIRECTION, flags),
            trans_mode: self.get_field_enum::<TransmissionMode>(field::HDR_TRANS_MODE, flags),
            crc_flag: self.get_field_enum::<CrcFlag>(field::HDR_CRC_FLAG, flags),
            large_file_flag: self.get_field_enum::<LargeFileFlag>(field::HDR_LARGE_FILE, flags),
            seg_ctrl: self.get_field_enum::<SegmentationControl>(field::HDR_SEG_CTRL, lengths),
            seg_metadata_flag: self
                .get_field_enum::<SegmentMetadataFlag>(field::HDR_SEG_METADATA, lengths),
            eid_length,
            tsn_length,
            header_encoded_length: self.state.position() as u16,
            data_encoded_length: data_len,
            source_eid,
            destination_eid,
            sequence_num,
        }
    }

    pub fn decode_eof(&mut self) -> Eof<'buf> {
        let cc = self.get_u8();
        let condition_code = self.get_field_enum::<ConditionCode>(field::CONDITION_CODE, cc);
        let crc = self.get_u32();
        let size = self.get_u32() as u64;
        let fault_location = if self.is_ok() && self.state.remaining() > 0 {
            Some(self.decode_tlv())
        } else {
            None
        };
        Eof {
            condition_code,
            crc,
            size,
            fault_location,
        }
    }

    pub fn decode_fin(&mut self) -> Fin<'buf> {
        let flags = self.get_u8();
        Fin {
            condition_code: self.get_field_enum::<ConditionCode>(field::CONDITION_CODE, flags),
            delivery_code: self.get_field_enum::<DeliveryCode>(field::FIN_DELIVERY_CODE, flags),
            file_status: self.get_field_enum::<FileStatus>(field::FIN_FILE_STATUS, flags),
            tlv_list: self.decode_tlv_list(),
        }
    }

    pub fn decode_ack(&mut self) -> Option<Ack> {
        let codes = self.get_u8();
        let status = self.get_u8();
        let ack_directive =
            match FileDirectiveType::try_from(field::ACK_DIRECTIVE_CODE.get(codes)) {
                Ok(directive) => directive,
                Err(_) => {
                    self.state.set_invalid();
                    return None;
                }
            };
        Some(Ack {
            ack_directive,
            ack_subtype: field::ACK_SUBTYPE_CODE.get(codes),
            condition_code: self.get_field_enum::<ConditionCode>(field::CONDITION_CODE, status),
            txn_status: self.get_field_enum::<TransactionStatus>(field::ACK_TXN_STATUS, status),
        })
    }

    pub fn decode_metadata(&mut self) -> Metadata<'buf> {
        let flags = self.get_u8();
        let size = self.get_u32() as u64;
        let source_filename = self.decode_lv();
        let dest_filename = self.decode_lv();
        Metadata {
            closure_requested: field::MD_CLOSURE_REQUESTED.get_flag(flags),
            checksum_type: field::MD_CHECKSUM_TYPE.get(flags),
            size,
            source_filename,
            dest_filename,
            options: self.decode_tlv_list(),
        }
    }

    pub fn decode_nak(&mut self) -> Nak {
        let scope_start = self.get_u32() as u64;
        let scope_end = self.get_u32() as u64;
        Nak {
            scope_start,
            scope_end,
            segment_requests: self.decode_segment_list(None, NAK_MAX_SEGMENTS),
        }
    }

    /// File data PDUs carry no payload length. Whatever remains up to the limit is the data.
    pub fn decode_file_data(&mut self, seg_metadata: SegmentMetadataFlag) -> FileData<'buf> {
        let mut fd = FileData::default();
        if seg_metadata == SegmentMetadataFlag::Present {
            let meta = self.get_u8();
            fd.continuation_state = field::FD_CONTINUATION_STATE.get(meta);
            let count = field::FD_SEGMENT_COUNT.get(meta) as usize;
            fd.segment_list = self.decode_segment_list(Some(count), FD_MAX_SEGMENTS);
        }
        fd.offset = self.get_u32() as u64;
        fd.data = self.take_remaining();
        fd
    }
}

/// Decode a complete PDU.
///
/// The data field length of the header is untrusted: it must fit inside `raw`, which carries the
/// PDU boundary of the transport. Trailing bytes after the declared length are ignored. If the
/// CRC flag is set, the trailer is verified and excluded from the body. Large file PDUs are not
/// supported and rejected.
///
/// Returns [None] if the PDU is malformed in any way. Partially decoded content is never
/// returned.
pub fn decode_pdu(raw: &[u8]) -> Option<LogicalPdu<'_>> {
    let mut decoder = Decoder::new(raw);
    let header = decoder.decode_header();
    if !decoder.is_ok() || header.large_file_flag == LargeFileFlag::Large {
        return None;
    }
    let total_len = header.header_encoded_length as usize + header.data_encoded_length as usize;
    if total_len > raw.len() {
        return None;
    }
    let mut body_end = total_len;
    if header.crc_flag == CrcFlag::WithCrc {
        if header.data_encoded_length as usize <= PDU_CRC_LEN {
            return None;
        }
        body_end -= PDU_CRC_LEN;
        let expected = u16::from_be_bytes([raw[body_end], raw[body_end + 1]]);
        if CRC_16_CCITT_FALSE.checksum(&raw[0..body_end]) != expected {
            return None;
        }
    }
    decoder.state.restrict(body_end);
    let body = match header.pdu_type {
        PduType::FileDirective => {
            let code = decoder.get_u8();
            let directive = FileDirectiveType::try_from(code).ok()?;
            PduBody::Directive(match directive {
                FileDirectiveType::EofPdu => DirectiveBody::Eof(decoder.decode_eof()),
                FileDirectiveType::FinishedPdu => DirectiveBody::Fin(decoder.decode_fin()),
                FileDirectiveType::AckPdu => DirectiveBody::Ack(decoder.decode_ack()?),
                FileDirectiveType::MetadataPdu => {
                    DirectiveBody::Metadata(decoder.decode_metadata())
                }
                FileDirectiveType::NakPdu => DirectiveBody::Nak(decoder.decode_nak()),
                FileDirectiveType::PromptPdu => {
                    let flags = decoder.get_u8();
                    DirectiveBody::Prompt {
                        keep_alive_response: flags & 0x80 != 0,
                    }
                }
                FileDirectiveType::KeepAlivePdu => DirectiveBody::KeepAlive {
                    progress: decoder.get_u32() as u64,
                },
            })
        }
        PduType::FileData => PduBody::FileData(decoder.decode_file_data(header.seg_metadata_flag)),
    };
    if !decoder.is_ok() {
        return None;
    }
    Some(LogicalPdu { header, body })
}
