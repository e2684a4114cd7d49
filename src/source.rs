//! # Sending Side
//!
//! Processing of outgoing file transactions. A transaction starts in the pending queue of its
//! channel and is driven by three entry points which the channel calls:
//!
//! * [step] sends at most one PDU. The channel calls it repeatedly for flow control and stops
//!   as soon as the transport is throttled or the per-cycle PDU budget is used up.
//! * [tick] advances the timers once per cycle.
//! * [recv] handles a PDU addressed to this transaction.
//!
//! A [step] performs the following in order for a fresh transaction:
//!
//! 1. Open the source file and generate the Metadata PDU.
//! 2. Generate one File Data PDU per step until the whole file was sent. The payload of each PDU
//!    is limited by the configured chunk size and the space left in the PDU buffer.
//! 3. Generate the EOF PDU. A class 1 transaction is complete afterwards.
//!
//! A class 2 transaction continues with:
//!
//! 4. Wait for the ACK of the EOF. The EOF is re-sent on each ACK timer expiry until the ACK
//!    limit is reached.
//! 5. Wait for the Finished PDU. NAKs received in the meantime queue retransmissions of the
//!    requested ranges, which take priority over everything else.
//! 6. Acknowledge the Finished PDU.
use crate::{
    checksum::RunningChecksum,
    codec::{Encoder, PDU_CRC_LEN},
    filestore::FilestoreError,
    event::EventId,
    pdu::{
        Ack, ChecksumType, ConditionCode, CrcFlag, DirectiveBody, Eof, FileData,
        FileDirectiveType, Fin, LogicalPdu, Lv, Metadata, Nak, PduBody, PduType,
        SegmentMetadataFlag, Tlv, TransactionStatus, TransmissionMode,
    },
    time::CountdownProvider,
    transaction::{
        FinInfo, Progress, SendBlocked, SendData, Transaction, TxSubState, TxnCore, TxnCtx,
        TxnState, TxnStatus,
    },
};

/// File size limit of the small file format.
pub const MAX_FILE_SIZE: u64 = u32::MAX as u64;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SourceError {
    #[error("transport did not accept the PDU: {0:?}")]
    Blocked(SendBlocked),
    #[error("filestore error: {0}")]
    Filestore(#[from] FilestoreError),
    #[error("read {read} bytes at offset {offset}, expected {expected}")]
    ShortRead {
        offset: u64,
        read: usize,
        expected: usize,
    },
    #[error("file size {0} exceeds the small file limit")]
    FileTooLarge(u64),
    #[error("checksum type {0:?} is not supported")]
    UnsupportedChecksum(ChecksumType),
    #[error("PDU encoding failed")]
    Encoding,
}

impl From<SendBlocked> for SourceError {
    fn from(value: SendBlocked) -> Self {
        SourceError::Blocked(value)
    }
}

/// Send at most one PDU for the transaction.
pub fn step(txn: &mut Transaction, ctx: &mut TxnCtx) -> Progress {
    let Transaction { core, state } = txn;
    let data = match state {
        TxnState::S1(data) | TxnState::S2(data) => data,
        _ => return Progress::Idle,
    };
    if core.flags.done || core.flags.suspended {
        return Progress::Idle;
    }
    if core.flags.cancel_requested {
        handle_cancel(core, data);
        if core.flags.done {
            return Progress::Idle;
        }
    }
    if data.sub_state == TxSubState::Metadata {
        if !data.started && start(core, data, ctx).is_err() {
            return Progress::Idle;
        }
        if let Err(e) = send_metadata(core, data, ctx) {
            return send_failure(core, data, ctx, e);
        }
        data.sub_state = TxSubState::FileData;
        return Progress::Sent;
    }
    if core.is_acknowledged() && data.sub_state < TxSubState::SendFinAck {
        if let Some(progress) = handle_retransmission(core, data, ctx) {
            return progress;
        }
    }
    if data.sub_state == TxSubState::FileData {
        if data.offset < data.file_size {
            let remaining = data.file_size - data.offset;
            return match send_file_data(core, data, ctx, data.offset, remaining, true) {
                Ok(sent) => {
                    data.offset += sent;
                    Progress::Sent
                }
                Err(e) => send_failure(core, data, ctx, e),
            };
        }
        data.sub_state = TxSubState::Eof;
    }
    if data.sub_state == TxSubState::Eof {
        if let Err(e) = send_eof(core, data, ctx) {
            return send_failure(core, data, ctx, e);
        }
        eof_sent(core, data, ctx);
        return Progress::Sent;
    }
    if data.sub_state == TxSubState::WaitForEofAck && data.eof_resend {
        if let Err(e) = send_eof(core, data, ctx) {
            return send_failure(core, data, ctx, e);
        }
        data.eof_resend = false;
        return Progress::Sent;
    }
    if data.sub_state == TxSubState::SendFinAck {
        if let Err(e) = send_fin_ack(core, data, ctx) {
            return send_failure(core, data, ctx, e);
        }
        core.complete();
        return Progress::Sent;
    }
    Progress::Idle
}

/// Advance the timers of the transaction by one tick.
pub fn tick(txn: &mut Transaction, ctx: &mut TxnCtx) {
    let Transaction { core, state } = txn;
    let data = match state {
        TxnState::S1(data) | TxnState::S2(data) => data,
        _ => return,
    };
    if core.flags.done || core.flags.suspended {
        return;
    }
    match data.sub_state {
        TxSubState::WaitForEofAck => handle_positive_ack_procedures(core, data, ctx),
        TxSubState::WaitForFin => {
            core.inactivity_timer.tick();
            if core.inactivity_timer.has_expired() {
                ctx.counters.fault.inactivity_timer += 1;
                ctx.report(EventId::TxInactivity, core.id);
                core.set_status(TxnStatus::InactivityDetected);
                core.complete();
            }
        }
        _ => (),
    }
}

/// Handle a PDU which was matched to this transaction.
pub fn recv(txn: &mut Transaction, ctx: &mut TxnCtx, pdu: &LogicalPdu) {
    let Transaction { core, state } = txn;
    let data = match state {
        TxnState::S1(data) | TxnState::S2(data) => data,
        _ => return,
    };
    if core.flags.done {
        return;
    }
    core.inactivity_timer.reset();
    match &pdu.body {
        PduBody::Directive(DirectiveBody::Ack(ack))
            if ack.ack_directive == FileDirectiveType::EofPdu =>
        {
            handle_eof_ack(core, data, ctx)
        }
        PduBody::Directive(DirectiveBody::Fin(fin)) => handle_fin(core, data, ctx, fin),
        PduBody::Directive(DirectiveBody::Nak(nak)) => handle_nak(core, data, ctx, nak),
        PduBody::Directive(DirectiveBody::Prompt { .. })
        | PduBody::Directive(DirectiveBody::KeepAlive { .. }) => {
            ctx.report(EventId::PduIgnoredDirective, core.id)
        }
        _ => spurious(core, ctx),
    }
}

fn spurious(core: &TxnCore, ctx: &mut TxnCtx) {
    ctx.counters.recv.spurious += 1;
    ctx.report(EventId::PduSpurious, core.id);
}

fn start(core: &mut TxnCore, data: &mut SendData, ctx: &mut TxnCtx) -> Result<(), SourceError> {
    let result = ctx
        .vfs
        .file_size(&data.src_path)
        .map_err(SourceError::from)
        .and_then(|size| {
            if size > MAX_FILE_SIZE {
                return Err(SourceError::FileTooLarge(size));
            }
            Ok(size)
        });
    match result {
        Ok(size) => data.file_size = size,
        Err(e) => {
            log::warn!("opening source file {} failed: {}", data.src_path, e);
            ctx.counters.fault.file_open += 1;
            ctx.report(EventId::TxFileOpenFailed, core.id);
            core.set_status(match e {
                SourceError::FileTooLarge(_) => TxnStatus::FileSizeError,
                _ => TxnStatus::FilestoreRejection,
            });
            core.complete();
            return Err(e);
        }
    }
    data.checksum = RunningChecksum::new(data.checksum_type);
    if data.checksum.is_none() {
        log::warn!(
            "transaction {}: checksum type {:?} is not supported",
            core.id,
            data.checksum_type
        );
        core.set_status(TxnStatus::UnsupportedChecksumType);
        core.complete();
        return Err(SourceError::UnsupportedChecksum(data.checksum_type));
    }
    data.started = true;
    ctx.report(EventId::TxStarted, core.id);
    Ok(())
}

/// A cancel takes effect here, at the start of the next step. Before the EOF went out the
/// receiver is notified with an EOF carrying the cancel condition.
fn handle_cancel(core: &mut TxnCore, data: &mut SendData) {
    core.flags.cancel_requested = false;
    core.set_status(TxnStatus::CancelRequestReceived);
    match data.sub_state {
        TxSubState::Metadata => core.complete(),
        TxSubState::FileData | TxSubState::Eof => {
            data.retransmit.reset();
            data.metadata_resend = false;
            data.sub_state = TxSubState::Eof;
        }
        TxSubState::WaitForEofAck | TxSubState::WaitForFin | TxSubState::SendFinAck => {
            core.complete()
        }
    }
}

/// Map a failed send to the step result. Only a throttled transport is retried in a later
/// cycle. A PDU which cannot be encoded or which the transport rejects ends the transaction.
fn send_failure(
    core: &mut TxnCore,
    data: &mut SendData,
    ctx: &mut TxnCtx,
    error: SourceError,
) -> Progress {
    match error {
        SourceError::Blocked(SendBlocked::Throttled) => Progress::Blocked,
        SourceError::Blocked(SendBlocked::Failed) | SourceError::Encoding => {
            log::warn!(
                "transaction {}: sending in state {:?} failed: {}",
                core.id,
                data.sub_state,
                error
            );
            if matches!(error, SourceError::Encoding) {
                ctx.report(EventId::PduSendFailed, core.id);
            }
            core.set_status(match data.sub_state {
                TxSubState::Eof | TxSubState::WaitForEofAck => TxnStatus::SendEofFailure,
                _ => TxnStatus::ProtocolError,
            });
            core.complete();
            Progress::Idle
        }
        SourceError::Filestore(_)
        | SourceError::ShortRead { .. }
        | SourceError::FileTooLarge(_)
        | SourceError::UnsupportedChecksum(_) => {
            log::warn!("reading source file {} failed: {}", data.src_path, error);
            ctx.counters.fault.file_read += 1;
            ctx.report(EventId::TxFileReadFailed, core.id);
            core.set_status(TxnStatus::FilestoreRejection);
            data.retransmit.reset();
            data.metadata_resend = false;
            if data.sub_state <= TxSubState::Eof {
                data.sub_state = TxSubState::Eof;
            } else {
                core.complete();
            }
            Progress::Idle
        }
    }
}

/// Metadata re-requests and NAKed ranges go out before anything else.
fn handle_retransmission(
    core: &mut TxnCore,
    data: &mut SendData,
    ctx: &mut TxnCtx,
) -> Option<Progress> {
    if data.metadata_resend {
        if let Err(e) = send_metadata(core, data, ctx) {
            return Some(send_failure(core, data, ctx, e));
        }
        data.metadata_resend = false;
        ctx.report(EventId::TxMetadataResent, core.id);
        return Some(Progress::Sent);
    }
    let chunk = *data.retransmit.first()?;
    Some(
        match send_file_data(core, data, ctx, chunk.offset, chunk.size, false) {
            Ok(sent) => {
                data.retransmit.remove_from_first(sent);
                Progress::Sent
            }
            Err(e) => send_failure(core, data, ctx, e),
        },
    )
}

fn handle_positive_ack_procedures(core: &mut TxnCore, data: &mut SendData, ctx: &mut TxnCtx) {
    let Some(timer) = core.retry_timer.as_mut() else {
        return;
    };
    timer.tick();
    if !timer.has_expired() {
        return;
    }
    data.ack_retries = data.ack_retries.saturating_add(1);
    if data.ack_retries >= ctx.cfg.ack_limit {
        ctx.counters.fault.ack_limit += 1;
        ctx.report(EventId::TxAckLimitNoEof, core.id);
        core.set_status(TxnStatus::AckLimitNoEof);
        core.complete();
    } else {
        timer.reset();
        data.eof_resend = true;
    }
}

fn eof_sent(core: &mut TxnCore, data: &mut SendData, ctx: &mut TxnCtx) {
    match core.class {
        TransmissionMode::Unacknowledged => core.complete(),
        TransmissionMode::Acknowledged => {
            data.sub_state = TxSubState::WaitForEofAck;
            data.ack_retries = 0;
            data.eof_resend = false;
            core.retry_timer = Some(ctx.timer(ctx.cfg.ack_timer_s));
            core.inactivity_timer = ctx.timer(ctx.cfg.inactivity_timer_s);
        }
    }
}

fn handle_eof_ack(core: &mut TxnCore, data: &mut SendData, ctx: &mut TxnCtx) {
    if data.sub_state != TxSubState::WaitForEofAck {
        return spurious(core, ctx);
    }
    core.retry_timer = None;
    data.eof_resend = false;
    if core.status.is_error() {
        // The EOF carried an error condition, no Finished PDU will follow.
        core.complete();
        return;
    }
    data.sub_state = TxSubState::WaitForFin;
}

fn handle_fin(core: &mut TxnCore, data: &mut SendData, ctx: &mut TxnCtx, fin: &Fin) {
    if !core.is_acknowledged() {
        return spurious(core, ctx);
    }
    if data.sub_state == TxSubState::SendFinAck {
        return;
    }
    if data.sub_state < TxSubState::WaitForFin {
        ctx.report(EventId::TxEarlyFin, core.id);
        core.set_status(TxnStatus::EarlyFin);
    }
    if fin.condition_code != ConditionCode::NoError {
        core.set_status(TxnStatus::from(fin.condition_code));
    }
    data.fin = Some(FinInfo {
        condition_code: fin.condition_code,
        delivery_code: fin.delivery_code,
        file_status: fin.file_status,
    });
    data.retransmit.reset();
    data.metadata_resend = false;
    data.eof_resend = false;
    core.retry_timer = None;
    data.sub_state = TxSubState::SendFinAck;
}

fn handle_nak(core: &mut TxnCore, data: &mut SendData, ctx: &mut TxnCtx, nak: &Nak) {
    if !core.is_acknowledged() || !data.started || data.sub_state == TxSubState::SendFinAck {
        return spurious(core, ctx);
    }
    ctx.counters.recv.nak_segment_requests += nak.segment_requests.len() as u32;
    for request in &nak.segment_requests {
        if request.is_metadata_request() {
            data.metadata_resend = true;
            continue;
        }
        if request.offset_start >= request.offset_end || request.offset_end > data.file_size {
            log::warn!(
                "transaction {} received invalid segment request [{}, {})",
                core.id,
                request.offset_start,
                request.offset_end
            );
            ctx.report(EventId::TxInvalidNakSegment, core.id);
            core.set_status(TxnStatus::NakResponseError);
            core.complete();
            return;
        }
        if let Err(e) = data.retransmit.add(
            request.offset_start,
            request.offset_end - request.offset_start,
        ) {
            // The range will be requested again by the next NAK.
            log::warn!("transaction {}: dropping segment request: {}", core.id, e);
        }
    }
}

fn send_metadata(core: &TxnCore, data: &SendData, ctx: &mut TxnCtx) -> Result<(), SourceError> {
    let metadata = Metadata {
        closure_requested: core.is_acknowledged(),
        checksum_type: data.checksum_type as u8,
        size: data.file_size,
        source_filename: Lv::new_from_str(&data.src_path),
        dest_filename: Lv::new_from_str(&data.dst_path),
        options: Default::default(),
    };
    let mut pdu = LogicalPdu::new_directive(
        core.pdu_header(ctx, PduType::FileDirective),
        DirectiveBody::Metadata(metadata),
    );
    ctx.send_pdu(&mut pdu)?;
    Ok(())
}

/// Send up to `max_len` bytes starting at `offset`. The file is read directly into the PDU
/// buffer. Only the sequential pass feeds the running checksum.
fn send_file_data(
    core: &TxnCore,
    data: &mut SendData,
    ctx: &mut TxnCtx,
    offset: u64,
    max_len: u64,
    sequential: bool,
) -> Result<u64, SourceError> {
    if ctx.is_throttled() {
        return Err(SendBlocked::Throttled.into());
    }
    let mut header = core.pdu_header(ctx, PduType::FileData);
    let crc_len = if header.crc_flag == CrcFlag::WithCrc {
        PDU_CRC_LEN
    } else {
        0
    };
    let chunk_size = ctx.cfg.outgoing_file_chunk_size as u64;
    let pdu_len = core::cmp::min(ctx.params.max_pdu_size, ctx.out_buf.len());
    let vfs = ctx.vfs;
    let mut encoder = Encoder::new(&mut ctx.out_buf[..pdu_len]);
    encoder.encode_header_without_size(&mut header);
    encoder.encode_file_data_header(
        SegmentMetadataFlag::NotPresent,
        &FileData {
            offset,
            ..Default::default()
        },
    );
    let room = encoder.state().remaining().saturating_sub(crc_len) as u64;
    let len = max_len.min(chunk_size).min(room) as usize;
    if len == 0 || !encoder.is_ok() {
        return Err(SourceError::Encoding);
    }
    let payload_start = encoder.state().position();
    let payload = encoder.reserve(len).ok_or(SourceError::Encoding)?;
    let read = vfs.read_data(&data.src_path, offset, payload)?;
    if read != len {
        return Err(SourceError::ShortRead {
            offset,
            read,
            expected: len,
        });
    }
    let total = encoder
        .encode_header_final_size(&mut header)
        .ok_or(SourceError::Encoding)?;
    ctx.transmit(core.id, PduType::FileData, None, total, len)?;
    if sequential {
        if let Some(checksum) = data.checksum.as_mut() {
            checksum.update(offset, &ctx.out_buf[payload_start..payload_start + len]);
        }
    }
    Ok(len as u64)
}

fn send_eof(core: &TxnCore, data: &mut SendData, ctx: &mut TxnCtx) -> Result<(), SourceError> {
    let checksum = match data.checksum_value {
        Some(value) => value,
        None => {
            let value = data.checksum.take().map_or(0, RunningChecksum::finalize);
            data.checksum_value = Some(value);
            value
        }
    };
    let condition_code = core.status.condition_code();
    let fault_location = if condition_code != ConditionCode::NoError {
        Some(Tlv::new_entity_id(ctx.params.local_eid))
    } else {
        None
    };
    let mut pdu = LogicalPdu::new_directive(
        core.pdu_header(ctx, PduType::FileDirective),
        DirectiveBody::Eof(Eof {
            condition_code,
            crc: checksum,
            size: data.offset,
            fault_location,
        }),
    );
    ctx.send_pdu(&mut pdu)?;
    Ok(())
}

fn send_fin_ack(core: &TxnCore, data: &SendData, ctx: &mut TxnCtx) -> Result<(), SourceError> {
    let condition_code = data
        .fin
        .map_or(ConditionCode::NoError, |fin| fin.condition_code);
    let mut pdu = LogicalPdu::new_directive(
        core.pdu_header(ctx, PduType::FileDirective),
        DirectiveBody::Ack(Ack {
            ack_directive: FileDirectiveType::FinishedPdu,
            ack_subtype: 1,
            condition_code,
            txn_status: TransactionStatus::Active,
        }),
    );
    ctx.send_pdu(&mut pdu)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{fs, path::PathBuf, vec::Vec};

    use tempfile::TempDir;

    use super::*;
    use crate::{
        checksum::calculate_checksum,
        codec::{decode_pdu, encode_pdu},
        pdu::{
            ChecksumType, DeliveryCode, FileStatus, PduHeader, SegmentList, SegmentRequest,
        },
        transaction::{tests::CtxOwner, TxnDirection},
        time::TickTimer,
        TransactionId,
    };

    const LOCAL_ID: u64 = 25;
    const REMOTE_ID: u64 = 23;

    struct SourceTestbench {
        _dir: TempDir,
        src_path: PathBuf,
        owner: CtxOwner,
        txn: Transaction,
        file_content: Vec<u8>,
    }

    impl SourceTestbench {
        fn new(class: TransmissionMode, file_content: &[u8]) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let src_path = dir.path().join("src.bin");
            fs::write(&src_path, file_content).unwrap();
            let owner = CtxOwner::new(LOCAL_ID, dir.path().to_str().unwrap());
            let data = SendData::new(
                src_path.to_str().unwrap(),
                "/remote/dst.bin",
                ChecksumType::Crc32,
            );
            let state = match class {
                TransmissionMode::Acknowledged => TxnState::S2(data),
                TransmissionMode::Unacknowledged => TxnState::S1(data),
            };
            let core = TxnCore::new(
                TransactionId::new(LOCAL_ID, 1),
                REMOTE_ID,
                TxnDirection::Send,
                class,
                0,
                TickTimer::new(3),
            );
            Self {
                _dir: dir,
                src_path,
                owner,
                txn: Transaction::new(core, state),
                file_content: file_content.to_vec(),
            }
        }

        fn step(&mut self) -> Progress {
            let mut ctx = self.owner.ctx();
            step(&mut self.txn, &mut ctx)
        }

        fn tick(&mut self) {
            let mut ctx = self.owner.ctx();
            tick(&mut self.txn, &mut ctx)
        }

        fn recv(&mut self, body: DirectiveBody) {
            let header = PduHeader::new(
                PduType::FileDirective,
                crate::pdu::Direction::TowardsSender,
                self.txn.class(),
                LOCAL_ID,
                REMOTE_ID,
                1,
            );
            let mut pdu = LogicalPdu::new_directive(header, body);
            // Run through the codec to exercise the same path as the engine.
            let mut buf = [0; 512];
            let len = encode_pdu(&mut buf, &mut pdu).unwrap();
            let decoded = decode_pdu(&buf[..len]).unwrap();
            let mut ctx = self.owner.ctx();
            recv(&mut self.txn, &mut ctx, &decoded);
        }

        fn next_pdu(&mut self) -> Vec<u8> {
            self.owner
                .sender
                .retrieve_next_pdu()
                .expect("no PDU was sent")
                .raw_pdu
        }

        fn run_until_idle(&mut self) -> usize {
            let mut sent = 0;
            while self.step() == Progress::Sent {
                sent += 1;
            }
            sent
        }

        fn check_metadata(&mut self) {
            let raw = self.next_pdu();
            let pdu = decode_pdu(&raw).unwrap();
            match pdu.body {
                PduBody::Directive(DirectiveBody::Metadata(md)) => {
                    assert_eq!(md.size, self.file_content.len() as u64);
                    assert_eq!(md.source_filename.as_str(), self.src_path.to_str());
                    assert_eq!(md.dest_filename.as_str(), Some("/remote/dst.bin"));
                    assert_eq!(md.checksum(), Some(ChecksumType::Crc32));
                    assert_eq!(md.closure_requested, self.txn.core.is_acknowledged());
                }
                other => panic!("expected metadata, got {:?}", other),
            }
        }

        fn check_file_data(&mut self, expected_offset: u64, expected_len: usize) {
            let raw = self.next_pdu();
            let pdu = decode_pdu(&raw).unwrap();
            match pdu.body {
                PduBody::FileData(fd) => {
                    assert_eq!(fd.offset, expected_offset);
                    let start = expected_offset as usize;
                    assert_eq!(fd.data, &self.file_content[start..start + expected_len]);
                }
                other => panic!("expected file data, got {:?}", other),
            }
        }

        fn check_eof(&mut self, condition_code: ConditionCode, size: u64) -> u32 {
            let raw = self.next_pdu();
            let pdu = decode_pdu(&raw).unwrap();
            match pdu.body {
                PduBody::Directive(DirectiveBody::Eof(eof)) => {
                    assert_eq!(eof.condition_code, condition_code);
                    assert_eq!(eof.size, size);
                    eof.crc
                }
                other => panic!("expected EOF, got {:?}", other),
            }
        }

        fn eof_ack(&mut self) {
            self.recv(DirectiveBody::Ack(Ack {
                ack_directive: FileDirectiveType::EofPdu,
                ack_subtype: 0,
                condition_code: ConditionCode::NoError,
                txn_status: TransactionStatus::Active,
            }));
        }

        fn fin(&mut self, condition_code: ConditionCode) {
            self.recv(DirectiveBody::Fin(Fin {
                condition_code,
                delivery_code: DeliveryCode::Complete,
                file_status: FileStatus::Retained,
                tlv_list: Default::default(),
            }));
        }

        fn nak(&mut self, requests: &[(u64, u64)]) {
            let mut segment_requests = SegmentList::new();
            for (start, end) in requests {
                segment_requests.push(SegmentRequest::new(*start, *end));
            }
            self.recv(DirectiveBody::Nak(Nak {
                scope_start: 0,
                scope_end: self.file_content.len() as u64,
                segment_requests,
            }));
        }
    }

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|idx| (idx % 251) as u8).collect()
    }

    #[test]
    fn test_unacknowledged_transfer() {
        let data = content(1000);
        let mut tb = SourceTestbench::new(TransmissionMode::Unacknowledged, &data);
        assert_eq!(tb.run_until_idle(), 5);
        assert!(tb.txn.is_done());
        assert_eq!(tb.txn.status(), TxnStatus::NoError);
        tb.check_metadata();
        tb.check_file_data(0, 480);
        tb.check_file_data(480, 480);
        tb.check_file_data(960, 40);
        let crc = tb.check_eof(ConditionCode::NoError, 1000);
        assert_eq!(crc, calculate_checksum(ChecksumType::Crc32, &data).unwrap());
        assert!(tb.owner.sender.queue_empty());
        assert_eq!(tb.owner.counters.sent.file_data_bytes, 1000);
        assert_eq!(tb.owner.hook.count(EventId::TxStarted), 1);
    }

    #[test]
    fn test_empty_file() {
        let mut tb = SourceTestbench::new(TransmissionMode::Unacknowledged, &[]);
        assert_eq!(tb.run_until_idle(), 2);
        tb.check_metadata();
        tb.check_eof(ConditionCode::NoError, 0);
        assert!(tb.txn.is_done());
    }

    #[test]
    fn test_acknowledged_transfer() {
        let data = content(100);
        let mut tb = SourceTestbench::new(TransmissionMode::Acknowledged, &data);
        assert_eq!(tb.run_until_idle(), 3);
        assert_eq!(tb.txn.tx_sub_state(), Some(TxSubState::WaitForEofAck));
        tb.check_metadata();
        tb.check_file_data(0, 100);
        tb.check_eof(ConditionCode::NoError, 100);
        tb.eof_ack();
        assert_eq!(tb.txn.tx_sub_state(), Some(TxSubState::WaitForFin));
        tb.fin(ConditionCode::NoError);
        assert_eq!(tb.txn.tx_sub_state(), Some(TxSubState::SendFinAck));
        assert_eq!(tb.step(), Progress::Sent);
        let raw = tb.next_pdu();
        match decode_pdu(&raw).unwrap().body {
            PduBody::Directive(DirectiveBody::Ack(ack)) => {
                assert_eq!(ack.ack_directive, FileDirectiveType::FinishedPdu);
                assert_eq!(ack.condition_code, ConditionCode::NoError);
            }
            other => panic!("expected ACK, got {:?}", other),
        }
        assert!(tb.txn.is_done());
        assert_eq!(tb.txn.status(), TxnStatus::NoError);
    }

    #[test]
    fn test_throttled_transport() {
        let data = content(100);
        let mut tb = SourceTestbench::new(TransmissionMode::Unacknowledged, &data);
        assert_eq!(tb.step(), Progress::Sent);
        tb.owner.sender.set_throttled(true);
        assert_eq!(tb.step(), Progress::Blocked);
        assert_eq!(tb.txn.tx_sub_state(), Some(TxSubState::FileData));
        tb.owner.sender.set_throttled(false);
        assert_eq!(tb.run_until_idle(), 2);
        tb.check_metadata();
        tb.check_file_data(0, 100);
        tb.check_eof(ConditionCode::NoError, 100);
    }

    #[test]
    fn test_eof_ack_limit() {
        let mut tb = SourceTestbench::new(TransmissionMode::Acknowledged, &content(10));
        tb.run_until_idle();
        tb.check_metadata();
        tb.check_file_data(0, 10);
        tb.check_eof(ConditionCode::NoError, 10);
        let ack_limit = tb.owner.cfg.ack_limit;
        for _ in 0..ack_limit - 1 {
            // One tick per second, ACK timer of one second.
            tb.tick();
            assert_eq!(tb.step(), Progress::Sent);
            tb.check_eof(ConditionCode::NoError, 10);
        }
        tb.tick();
        assert!(tb.txn.is_done());
        assert_eq!(tb.txn.status(), TxnStatus::AckLimitNoEof);
        assert!(tb.owner.sender.queue_empty());
        assert_eq!(tb.owner.hook.count(EventId::TxAckLimitNoEof), 1);
        assert_eq!(tb.owner.counters.fault.ack_limit, 1);
    }

    #[test]
    fn test_nak_retransmission() {
        let data = content(1000);
        let mut tb = SourceTestbench::new(TransmissionMode::Acknowledged, &data);
        tb.run_until_idle();
        tb.check_metadata();
        tb.check_file_data(0, 480);
        tb.check_file_data(480, 480);
        tb.check_file_data(960, 40);
        tb.check_eof(ConditionCode::NoError, 1000);
        tb.eof_ack();
        tb.nak(&[(0, 0), (480, 960)]);
        assert_eq!(tb.run_until_idle(), 2);
        tb.check_metadata();
        tb.check_file_data(480, 480);
        assert_eq!(tb.owner.counters.recv.nak_segment_requests, 2);
        assert_eq!(tb.owner.hook.count(EventId::TxMetadataResent), 1);
        assert_eq!(tb.txn.tx_sub_state(), Some(TxSubState::WaitForFin));
    }

    #[test]
    fn test_invalid_nak_segment() {
        let mut tb = SourceTestbench::new(TransmissionMode::Acknowledged, &content(100));
        tb.run_until_idle();
        tb.nak(&[(50, 200)]);
        assert!(tb.txn.is_done());
        assert_eq!(tb.txn.status(), TxnStatus::NakResponseError);
        assert_eq!(tb.owner.hook.count(EventId::TxInvalidNakSegment), 1);
    }

    #[test]
    fn test_early_fin() {
        let mut tb = SourceTestbench::new(TransmissionMode::Acknowledged, &content(100));
        tb.run_until_idle();
        tb.fin(ConditionCode::NoError);
        assert_eq!(tb.owner.hook.count(EventId::TxEarlyFin), 1);
        assert_eq!(tb.txn.tx_sub_state(), Some(TxSubState::SendFinAck));
        assert_eq!(tb.step(), Progress::Sent);
        assert!(tb.txn.is_done());
        assert_eq!(tb.txn.status(), TxnStatus::EarlyFin);
    }

    #[test]
    fn test_inactivity_waiting_for_fin() {
        let mut tb = SourceTestbench::new(TransmissionMode::Acknowledged, &content(10));
        tb.run_until_idle();
        tb.eof_ack();
        for _ in 0..3 {
            assert!(!tb.txn.is_done());
            tb.tick();
        }
        assert!(tb.txn.is_done());
        assert_eq!(tb.txn.status(), TxnStatus::InactivityDetected);
        assert_eq!(tb.owner.counters.fault.inactivity_timer, 1);
    }

    #[test]
    fn test_cancel_during_file_data() {
        let data = content(1000);
        let mut tb = SourceTestbench::new(TransmissionMode::Unacknowledged, &data);
        assert_eq!(tb.step(), Progress::Sent);
        assert_eq!(tb.step(), Progress::Sent);
        tb.txn.core.flags.cancel_requested = true;
        assert_eq!(tb.step(), Progress::Sent);
        tb.check_metadata();
        tb.check_file_data(0, 480);
        tb.check_eof(ConditionCode::CancelRequestReceived, 480);
        assert!(tb.txn.is_done());
        assert_eq!(tb.txn.status(), TxnStatus::CancelRequestReceived);
    }

    #[test]
    fn test_missing_source_file() {
        let mut tb = SourceTestbench::new(TransmissionMode::Unacknowledged, &[]);
        fs::remove_file(&tb.src_path).unwrap();
        assert_eq!(tb.step(), Progress::Idle);
        assert!(tb.txn.is_done());
        assert_eq!(tb.txn.status(), TxnStatus::FilestoreRejection);
        assert_eq!(tb.owner.hook.count(EventId::TxFileOpenFailed), 1);
        assert!(tb.owner.sender.queue_empty());
    }

    #[test]
    fn test_suspended_does_nothing() {
        let mut tb = SourceTestbench::new(TransmissionMode::Unacknowledged, &content(10));
        tb.txn.core.flags.suspended = true;
        assert_eq!(tb.step(), Progress::Idle);
        assert!(tb.owner.sender.queue_empty());
        assert!(!tb.txn.is_done());
    }

    #[test]
    fn test_spurious_pdu_class_1() {
        let mut tb = SourceTestbench::new(TransmissionMode::Unacknowledged, &content(10));
        tb.step();
        tb.fin(ConditionCode::NoError);
        assert_eq!(tb.owner.counters.recv.spurious, 1);
        assert_eq!(tb.owner.hook.count(EventId::PduSpurious), 1);
    }
}
