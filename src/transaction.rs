//! # Transaction Module
//!
//! A [Transaction] owns one file transfer. Its protocol state is the tagged [TxnState]: the
//! send states `S1`/`S2` and receive states `R1`/`R2` carry the data of their direction. Fields
//! common to both directions live in [TxnCore]. The protocol logic itself lives in
//! [crate::source] and [crate::dest].
//!
//! Every entry point of the state machines takes a [TxnCtx], which bundles the collaborators of
//! the channel the transaction belongs to: filestore, PDU sender, event reporter, counters,
//! configuration and the shared output buffer.
use alloc::string::String;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{
    checksum::RunningChecksum,
    chunk::ChunkList,
    codec::encode_pdu,
    config::ChannelConfig,
    event::{ChannelCounters, EventId, EventReporter},
    filestore::VirtualFilestore,
    pdu::{
        ChecksumType, ConditionCode, CrcFlag, DeliveryCode, Direction, FileDirectiveType,
        FileStatus, LogicalPdu, PduHeader, PduType, TransmissionMode,
    },
    time::TickTimer,
    EntityId, GenericSendError, PduSender, TransactionId,
};

/// Maximum number of ranges tracked per transaction and direction.
pub const MAX_CHUNKS_PER_TXN: usize = 64;

/// Final or current status of a transaction. The values 0 to 15 are the CFDP condition codes,
/// the values above are local failure reasons which have no condition code of their own.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum TxnStatus {
    #[default]
    NoError = 0,
    PositiveAckLimitReached = 1,
    KeepAliveLimitReached = 2,
    InvalidTransmissionMode = 3,
    FilestoreRejection = 4,
    FileChecksumFailure = 5,
    FileSizeError = 6,
    NakLimitReached = 7,
    InactivityDetected = 8,
    InvalidFileStructure = 9,
    CheckLimitReached = 10,
    UnsupportedChecksumType = 11,
    SuspendRequestReceived = 14,
    CancelRequestReceived = 15,
    ProtocolError = 16,
    AckLimitNoFin = 17,
    AckLimitNoEof = 18,
    NakResponseError = 19,
    SendEofFailure = 20,
    EarlyFin = 21,
}

impl TxnStatus {
    #[inline]
    pub fn is_error(&self) -> bool {
        *self != TxnStatus::NoError
    }

    /// Condition code reported in EOF and FIN PDUs for this status.
    pub fn condition_code(&self) -> ConditionCode {
        match self {
            TxnStatus::NoError => ConditionCode::NoError,
            TxnStatus::PositiveAckLimitReached
            | TxnStatus::AckLimitNoFin
            | TxnStatus::AckLimitNoEof => ConditionCode::PositiveAckLimitReached,
            TxnStatus::KeepAliveLimitReached => ConditionCode::KeepAliveLimitReached,
            TxnStatus::InvalidTransmissionMode => ConditionCode::InvalidTransmissionMode,
            TxnStatus::FilestoreRejection => ConditionCode::FilestoreRejection,
            TxnStatus::FileChecksumFailure => ConditionCode::FileChecksumFailure,
            TxnStatus::FileSizeError => ConditionCode::FileSizeError,
            TxnStatus::NakLimitReached => ConditionCode::NakLimitReached,
            TxnStatus::InactivityDetected => ConditionCode::InactivityDetected,
            TxnStatus::InvalidFileStructure => ConditionCode::InvalidFileStructure,
            TxnStatus::CheckLimitReached => ConditionCode::CheckLimitReached,
            TxnStatus::UnsupportedChecksumType => ConditionCode::UnsupportedChecksumType,
            TxnStatus::SuspendRequestReceived => ConditionCode::SuspendRequestReceived,
            TxnStatus::CancelRequestReceived
            | TxnStatus::ProtocolError
            | TxnStatus::NakResponseError
            | TxnStatus::SendEofFailure
            | TxnStatus::EarlyFin => ConditionCode::CancelRequestReceived,
        }
    }
}

impl From<ConditionCode> for TxnStatus {
    fn from(value: ConditionCode) -> Self {
        match value {
            ConditionCode::NoError => TxnStatus::NoError,
            ConditionCode::PositiveAckLimitReached => TxnStatus::PositiveAckLimitReached,
            ConditionCode::KeepAliveLimitReached => TxnStatus::KeepAliveLimitReached,
            ConditionCode::InvalidTransmissionMode => TxnStatus::InvalidTransmissionMode,
            ConditionCode::FilestoreRejection => TxnStatus::FilestoreRejection,
            ConditionCode::FileChecksumFailure => TxnStatus::FileChecksumFailure,
            ConditionCode::FileSizeError => TxnStatus::FileSizeError,
            ConditionCode::NakLimitReached => TxnStatus::NakLimitReached,
            ConditionCode::InactivityDetected => TxnStatus::InactivityDetected,
            ConditionCode::InvalidFileStructure => TxnStatus::InvalidFileStructure,
            ConditionCode::CheckLimitReached => TxnStatus::CheckLimitReached,
            ConditionCode::UnsupportedChecksumType => TxnStatus::UnsupportedChecksumType,
            ConditionCode::SuspendRequestReceived => TxnStatus::SuspendRequestReceived,
            ConditionCode::CancelRequestReceived => TxnStatus::CancelRequestReceived,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxnDirection {
    Send,
    Receive,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxSubState {
    Metadata,
    FileData,
    Eof,
    WaitForEofAck,
    WaitForFin,
    SendFinAck,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RxSubState {
    FileData,
    /// EOF received. Gaps are NAKed, the checksum is verified and the FIN is sent from here.
    Eof,
    WaitForFinAck,
}

/// Close-out information of a received or pending FIN PDU.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FinInfo {
    pub condition_code: ConditionCode,
    pub delivery_code: DeliveryCode,
    pub file_status: FileStatus,
}

/// Contents of a received EOF PDU.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EofInfo {
    pub condition_code: ConditionCode,
    pub checksum: u32,
    pub size: u64,
}

#[derive(Debug)]
pub struct SendData {
    pub sub_state: TxSubState,
    pub src_path: String,
    pub dst_path: String,
    pub file_size: u64,
    /// Next offset of the sequential file data pass.
    pub offset: u64,
    pub started: bool,
    pub checksum_type: ChecksumType,
    pub checksum: Option<RunningChecksum>,
    pub checksum_value: Option<u32>,
    /// Ranges requested by NAKs which were not retransmitted yet.
    pub retransmit: ChunkList,
    pub metadata_resend: bool,
    pub eof_resend: bool,
    pub ack_retries: u8,
    pub fin: Option<FinInfo>,
}

impl SendData {
    pub fn new(src_path: &str, dst_path: &str, checksum_type: ChecksumType) -> Self {
        Self {
            sub_state: TxSubState::Metadata,
            src_path: String::from(src_path),
            dst_path: String::from(dst_path),
            file_size: 0,
            offset: 0,
            started: false,
            checksum_type,
            checksum: None,
            checksum_value: None,
            retransmit: ChunkList::new(MAX_CHUNKS_PER_TXN),
            metadata_resend: false,
            eof_resend: false,
            ack_retries: 0,
            fin: None,
        }
    }
}

#[derive(Debug)]
pub struct RecvData {
    pub sub_state: RxSubState,
    pub md_received: bool,
    pub src_path: String,
    /// Path the data is written to. The temporary file path until Metadata arrives.
    pub dst_path: String,
    pub temp_file: bool,
    pub file_created: bool,
    pub md_size: Option<u64>,
    pub eof: Option<EofInfo>,
    pub received: ChunkList,
    pub checksum_type: ChecksumType,
    pub checksum: Option<RunningChecksum>,
    /// Progress of the checksum calculation over the completed file.
    pub checksum_offset: u64,
    pub checksum_verified: bool,
    pub eof_ack_pending: bool,
    pub nak_pending: bool,
    pub nak_retries: u8,
    pub fin: Option<FinInfo>,
    pub fin_pending: bool,
    pub ack_retries: u8,
}

impl RecvData {
    pub fn new() -> Self {
        Self {
            sub_state: RxSubState::FileData,
            md_received: false,
            src_path: String::new(),
            dst_path: String::new(),
            temp_file: false,
            file_created: false,
            md_size: None,
            eof: None,
            received: ChunkList::new(MAX_CHUNKS_PER_TXN),
            checksum_type: ChecksumType::default(),
            checksum: None,
            checksum_offset: 0,
            checksum_verified: false,
            eof_ack_pending: false,
            nak_pending: false,
            nak_retries: 0,
            fin: None,
            fin_pending: false,
            ack_retries: 0,
        }
    }
}

impl Default for RecvData {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub enum TxnState {
    S1(SendData),
    S2(SendData),
    R1(RecvData),
    R2(RecvData),
    /// Absorbs all further PDUs of a failed reception until the inactivity timer expires. Keeps
    /// what was known about the reception for the history.
    Drop(RecvData),
}

impl TxnState {
    pub fn send_data(&self) -> Option<&SendData> {
        match self {
            TxnState::S1(data) | TxnState::S2(data) => Some(data),
            _ => None,
        }
    }

    pub fn recv_data(&self) -> Option<&RecvData> {
        match self {
            TxnState::R1(data) | TxnState::R2(data) | TxnState::Drop(data) => Some(data),
            _ => None,
        }
    }
}

/// Playback slot a transaction was started from.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PlaybackRef {
    Commanded(usize),
    Poll(usize),
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TxnFlags {
    pub suspended: bool,
    pub cancel_requested: bool,
    pub done: bool,
}

/// State shared by both directions. Kept apart from [TxnState] so the state machines can borrow
/// it next to the direction specific data.
#[derive(Debug)]
pub struct TxnCore {
    pub id: TransactionId,
    pub peer_eid: EntityId,
    pub direction: TxnDirection,
    pub class: TransmissionMode,
    pub priority: u8,
    pub keep: bool,
    pub status: TxnStatus,
    pub flags: TxnFlags,
    /// ACK timer of the sender and the FIN sender, NAK timer of a class 2 receiver.
    pub retry_timer: Option<TickTimer>,
    pub inactivity_timer: TickTimer,
    pub playback: Option<PlaybackRef>,
}

impl TxnCore {
    pub fn new(
        id: TransactionId,
        peer_eid: EntityId,
        direction: TxnDirection,
        class: TransmissionMode,
        priority: u8,
        inactivity_timer: TickTimer,
    ) -> Self {
        Self {
            id,
            peer_eid,
            direction,
            class,
            priority,
            keep: true,
            status: TxnStatus::NoError,
            flags: TxnFlags::default(),
            retry_timer: None,
            inactivity_timer,
            playback: None,
        }
    }

    /// Record a failure. The first error sticks, later ones are ignored.
    pub fn set_status(&mut self, status: TxnStatus) {
        if !self.status.is_error() {
            self.status = status;
        }
    }

    #[inline]
    pub fn complete(&mut self) {
        self.flags.done = true;
        self.retry_timer = None;
    }

    #[inline]
    pub fn is_acknowledged(&self) -> bool {
        self.class == TransmissionMode::Acknowledged
    }

    /// Header for a PDU of this transaction. The source entity of the transaction is always the
    /// header source, independent of which side sends the PDU.
    pub fn pdu_header(&self, ctx: &TxnCtx, pdu_type: PduType) -> PduHeader {
        let (direction, destination) = match self.direction {
            TxnDirection::Send => (Direction::TowardsReceiver, self.peer_eid),
            TxnDirection::Receive => (Direction::TowardsSender, ctx.params.local_eid),
        };
        let mut header = PduHeader::new(
            pdu_type,
            direction,
            self.class,
            self.id.source_id(),
            destination,
            self.id.seq_num(),
        );
        header.crc_flag = CrcFlag::from(ctx.cfg.crc_on_transmission);
        header
    }
}

#[derive(Debug)]
pub struct Transaction {
    pub(crate) core: TxnCore,
    pub(crate) state: TxnState,
}

impl Transaction {
    pub fn new(core: TxnCore, state: TxnState) -> Self {
        Self { core, state }
    }

    #[inline]
    pub fn id(&self) -> TransactionId {
        self.core.id
    }

    #[inline]
    pub fn peer_eid(&self) -> EntityId {
        self.core.peer_eid
    }

    #[inline]
    pub fn direction(&self) -> TxnDirection {
        self.core.direction
    }

    #[inline]
    pub fn class(&self) -> TransmissionMode {
        self.core.class
    }

    #[inline]
    pub fn priority(&self) -> u8 {
        self.core.priority
    }

    #[inline]
    pub fn state(&self) -> &TxnState {
        &self.state
    }

    #[inline]
    pub fn status(&self) -> TxnStatus {
        self.core.status
    }

    #[inline]
    pub fn flags(&self) -> TxnFlags {
        self.core.flags
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.core.flags.done
    }

    pub fn tx_sub_state(&self) -> Option<TxSubState> {
        self.state.send_data().map(|data| data.sub_state)
    }

    pub fn rx_sub_state(&self) -> Option<RxSubState> {
        self.state.recv_data().map(|data| data.sub_state)
    }
}

/// Entry of the history ring of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HistoryEntry {
    pub id: TransactionId,
    pub direction: TxnDirection,
    pub peer_eid: EntityId,
    pub src_filename: String,
    pub dst_filename: String,
    pub status: TxnStatus,
    pub file_size: u64,
    pub keep: bool,
}

impl HistoryEntry {
    pub fn from_transaction(txn: &Transaction) -> Self {
        let (src, dst, size) = match &txn.state {
            TxnState::S1(data) | TxnState::S2(data) => {
                (data.src_path.clone(), data.dst_path.clone(), data.file_size)
            }
            TxnState::R1(data) | TxnState::R2(data) | TxnState::Drop(data) => (
                data.src_path.clone(),
                data.dst_path.clone(),
                data.md_size
                    .or(data.eof.map(|eof| eof.size))
                    .unwrap_or_default(),
            ),
        };
        Self {
            id: txn.core.id,
            direction: txn.core.direction,
            peer_eid: txn.core.peer_eid,
            src_filename: src,
            dst_filename: dst,
            status: txn.core.status,
            file_size: size,
            keep: txn.core.keep,
        }
    }
}

/// Engine wide parameters which are copied into every processing context.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EngineParams {
    pub local_eid: EntityId,
    pub ticks_per_second: u32,
    pub rx_crc_calc_bytes_per_wakeup: u32,
    pub max_pdu_size: usize,
}

/// Reason a PDU was not handed to the transport.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SendBlocked {
    /// Transport throttled or its queue is full. Try again in a later cycle.
    Throttled,
    /// Encoding or the transport failed.
    Failed,
}

/// Result of one processing step of a transaction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Progress {
    /// One PDU was sent. Calling again may send more.
    Sent,
    /// Nothing to send right now.
    Idle,
    /// The transport is throttled. Nothing else is sent on the channel in this cycle.
    Blocked,
}

pub struct TxnCtx<'a> {
    pub vfs: &'a dyn VirtualFilestore,
    pub sender: &'a dyn PduSender,
    pub events: EventReporter<'a>,
    pub counters: &'a mut ChannelCounters,
    pub cfg: &'a ChannelConfig,
    pub channel: u8,
    pub params: EngineParams,
    pub tmp_dir: &'a str,
    pub out_buf: &'a mut [u8],
    pub io_buf: &'a mut [u8],
}

impl TxnCtx<'_> {
    #[inline]
    pub fn report(&mut self, id: EventId, txn: TransactionId) {
        self.events.report_txn(id, self.channel, txn);
    }

    #[inline]
    pub fn timer(&self, seconds: u32) -> TickTimer {
        TickTimer::from_seconds(seconds, self.params.ticks_per_second)
    }

    #[inline]
    pub fn is_throttled(&self) -> bool {
        self.sender.throttled(self.channel)
    }

    /// Encode a PDU into the output buffer and hand it to the transport.
    pub fn send_pdu(&mut self, pdu: &mut LogicalPdu) -> Result<(), SendBlocked> {
        if self.is_throttled() {
            return Err(SendBlocked::Throttled);
        }
        let txn_id = pdu.header.transaction_id();
        let directive = pdu.directive_type();
        let pdu_type = pdu.header.pdu_type;
        match encode_pdu(self.out_buf, pdu) {
            Some(len) => self.transmit(txn_id, pdu_type, directive, len, 0),
            None => {
                self.report(EventId::PduSendFailed, txn_id);
                Err(SendBlocked::Failed)
            }
        }
    }

    /// Hand the first `len` bytes of the output buffer to the transport.
    pub fn transmit(
        &mut self,
        txn_id: TransactionId,
        pdu_type: PduType,
        directive: Option<FileDirectiveType>,
        len: usize,
        file_data_len: usize,
    ) -> Result<(), SendBlocked> {
        match self
            .sender
            .send_pdu(self.channel, pdu_type, directive, &self.out_buf[..len])
        {
            Ok(()) => {
                self.counters.sent.pdu += 1;
                self.counters.sent.file_data_bytes += file_data_len as u64;
                Ok(())
            }
            Err(GenericSendError::QueueFull(_)) => Err(SendBlocked::Throttled),
            Err(e) => {
                log::warn!("sending PDU for transaction {} failed: {}", txn_id, e);
                self.report(EventId::PduSendFailed, txn_id);
                Err(SendBlocked::Failed)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{string::String, vec, vec::Vec};

    use super::*;
    use crate::{
        config::ChannelConfig,
        event::{tests::RecordingHook, ChannelCounters, EventReporter},
        filestore::NativeFilestore,
        tests::TestPduSender,
    };

    /// Owns everything a [TxnCtx] borrows.
    pub(crate) struct CtxOwner {
        pub vfs: NativeFilestore,
        pub sender: TestPduSender,
        pub hook: RecordingHook,
        pub counters: ChannelCounters,
        pub cfg: ChannelConfig,
        pub params: EngineParams,
        pub tmp_dir: String,
        pub out_buf: Vec<u8>,
        pub io_buf: Vec<u8>,
    }

    impl CtxOwner {
        pub fn new(local_eid: EntityId, tmp_dir: &str) -> Self {
            Self {
                vfs: NativeFilestore::default(),
                sender: TestPduSender::default(),
                hook: RecordingHook::default(),
                counters: ChannelCounters::default(),
                cfg: ChannelConfig {
                    ack_timer_s: 1,
                    nak_timer_s: 1,
                    inactivity_timer_s: 3,
                    ..Default::default()
                },
                params: EngineParams {
                    local_eid,
                    ticks_per_second: 1,
                    rx_crc_calc_bytes_per_wakeup: 1024,
                    max_pdu_size: 512,
                },
                tmp_dir: String::from(tmp_dir),
                out_buf: vec![0; 512],
                io_buf: vec![0; 512],
            }
        }

        pub fn ctx(&mut self) -> TxnCtx<'_> {
            TxnCtx {
                vfs: &self.vfs,
                sender: &self.sender,
                events: EventReporter::new(&mut self.hook),
                counters: &mut self.counters,
                cfg: &self.cfg,
                channel: 0,
                params: self.params,
                tmp_dir: &self.tmp_dir,
                out_buf: &mut self.out_buf,
                io_buf: &mut self.io_buf,
            }
        }
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            TxnStatus::AckLimitNoEof.condition_code(),
            ConditionCode::PositiveAckLimitReached
        );
        assert_eq!(
            TxnStatus::AckLimitNoFin.condition_code(),
            ConditionCode::PositiveAckLimitReached
        );
        assert_eq!(
            TxnStatus::NakResponseError.condition_code(),
            ConditionCode::CancelRequestReceived
        );
        assert_eq!(
            TxnStatus::from(ConditionCode::FileChecksumFailure),
            TxnStatus::FileChecksumFailure
        );
        assert_eq!(TxnStatus::NakLimitReached as u8, 7);
        assert_eq!(TxnStatus::EarlyFin as u8, 21);
    }

    pub(crate) fn send_txn(class: TransmissionMode, seq: u64) -> Transaction {
        let state = match class {
            TransmissionMode::Acknowledged => {
                TxnState::S2(SendData::new("a", "b", ChecksumType::Modular))
            }
            TransmissionMode::Unacknowledged => {
                TxnState::S1(SendData::new("a", "b", ChecksumType::Modular))
            }
        };
        Transaction::new(
            TxnCore::new(
                TransactionId::new(25, seq),
                23,
                TxnDirection::Send,
                class,
                0,
                TickTimer::new(3),
            ),
            state,
        )
    }

    #[test]
    fn test_first_error_sticks() {
        let mut txn = send_txn(TransmissionMode::Acknowledged, 1);
        assert!(!txn.status().is_error());
        txn.core.set_status(TxnStatus::InactivityDetected);
        txn.core.set_status(TxnStatus::NakLimitReached);
        assert_eq!(txn.status(), TxnStatus::InactivityDetected);
    }

    #[test]
    fn test_header_direction() {
        let mut owner = CtxOwner::new(25, "/tmp");
        let ctx = owner.ctx();
        let txn = send_txn(TransmissionMode::Acknowledged, 3);
        let header = txn.core.pdu_header(&ctx, PduType::FileData);
        assert_eq!(header.direction, Direction::TowardsReceiver);
        assert_eq!(header.trans_mode, TransmissionMode::Acknowledged);
        assert_eq!(header.source_eid, 25);
        assert_eq!(header.destination_eid, 23);

        let core = TxnCore::new(
            TransactionId::new(23, 9),
            23,
            TxnDirection::Receive,
            TransmissionMode::Unacknowledged,
            0,
            TickTimer::new(10),
        );
        let header = core.pdu_header(&ctx, PduType::FileDirective);
        assert_eq!(header.direction, Direction::TowardsSender);
        assert_eq!(header.trans_mode, TransmissionMode::Unacknowledged);
        assert_eq!(header.source_eid, 23);
        assert_eq!(header.destination_eid, 25);
    }

    #[test]
    fn test_history_entry() {
        let mut txn = send_txn(TransmissionMode::Unacknowledged, 4);
        txn.core.set_status(TxnStatus::FilestoreRejection);
        let entry = HistoryEntry::from_transaction(&txn);
        assert_eq!(entry.id, TransactionId::new(25, 4));
        assert_eq!(entry.direction, TxnDirection::Send);
        assert_eq!(entry.src_filename, "a");
        assert_eq!(entry.dst_filename, "b");
        assert_eq!(entry.status, TxnStatus::FilestoreRejection);
    }

    #[test]
    fn test_throttled_send_is_blocked() {
        let mut owner = CtxOwner::new(25, "/tmp");
        owner.sender.set_throttled(true);
        let mut ctx = owner.ctx();
        let txn = send_txn(TransmissionMode::Unacknowledged, 3);
        let mut pdu = LogicalPdu::new_directive(
            txn.core.pdu_header(&ctx, PduType::FileDirective),
            crate::pdu::DirectiveBody::KeepAlive { progress: 0 },
        );
        assert_eq!(ctx.send_pdu(&mut pdu), Err(SendBlocked::Throttled));
        assert_eq!(ctx.counters.sent.pdu, 0);
        assert!(owner.sender.queue_empty());
    }
}
