//! # Receiving Side
//!
//! Processing of incoming file transactions. A receive transaction is created by the channel for
//! the first Metadata or File Data PDU of an unknown transaction addressed to the local entity.
//! Like the sending side, it is driven by [step], [tick] and [recv].
//!
//! The data is written to the destination file named by the Metadata PDU. File data which
//! arrives before the Metadata PDU goes to a temporary file `<tmp_dir>/<source>_<seq>.tmp`,
//! which is renamed once the Metadata PDU arrives.
//!
//! After the EOF PDU, a class 2 receiver
//!
//! 1. acknowledges the EOF,
//! 2. sends a NAK for every missing range and for the Metadata PDU if it is still missing,
//!    repeated on each NAK timer expiry up to the NAK limit,
//! 3. verifies the checksum once the file is complete, a bounded number of bytes per cycle,
//! 4. sends the Finished PDU and waits for its ACK, re-sending up to the ACK limit.
//!
//! A class 1 receiver only verifies the checksum. A failed class 1 reception moves into the
//! `Drop` state, which absorbs the remaining PDUs of the transaction until its inactivity timer
//! expires.
use alloc::{format, string::String};

use crate::{
    checksum::RunningChecksum,
    event::EventId,
    filestore::FilestoreError,
    pdu::{
        Ack, ConditionCode, DeliveryCode, DirectiveBody, Eof, FileData, FileDirectiveType,
        FileStatus, Fin, LogicalPdu, Metadata, Nak, PduBody, PduType, SegmentList,
        SegmentRequest, TransactionStatus, NAK_MAX_SEGMENTS,
    },
    time::CountdownProvider,
    transaction::{
        EofInfo, FinInfo, Progress, RecvData, RxSubState, SendBlocked, Transaction, TxnCore,
        TxnCtx, TxnState, TxnStatus,
    },
    EntityId, TransactionSeq,
};

/// Path of the temporary file used until the Metadata PDU arrived.
pub fn temp_file_path(tmp_dir: &str, source_eid: EntityId, seq_num: TransactionSeq) -> String {
    format!("{}/{}_{}.tmp", tmp_dir.trim_end_matches('/'), source_eid, seq_num)
}

/// Send at most one PDU for the transaction.
pub fn step(txn: &mut Transaction, ctx: &mut TxnCtx) -> Progress {
    let Transaction { core, state } = txn;
    let data = match state {
        TxnState::R1(data) | TxnState::R2(data) => data,
        _ => return Progress::Idle,
    };
    if core.flags.done || core.flags.suspended {
        return Progress::Idle;
    }
    if core.flags.cancel_requested {
        core.flags.cancel_requested = false;
        if core.is_acknowledged() && data.sub_state != RxSubState::WaitForFinAck {
            fail(core, data, ctx, TxnStatus::CancelRequestReceived);
        } else {
            core.set_status(TxnStatus::CancelRequestReceived);
            if data.sub_state != RxSubState::WaitForFinAck {
                discard_file(data, ctx);
            }
            core.complete();
            return Progress::Idle;
        }
    }
    if !core.is_acknowledged() {
        return Progress::Idle;
    }
    if data.eof_ack_pending {
        if let Err(e) = send_eof_ack(core, data, ctx) {
            return send_failure(core, data, ctx, e);
        }
        data.eof_ack_pending = false;
        if data
            .eof
            .is_some_and(|eof| eof.condition_code != ConditionCode::NoError)
        {
            // Cancelled by the sender. Nothing follows the ACK.
            core.complete();
        }
        return Progress::Sent;
    }
    if data.nak_pending {
        return match send_nak(core, data, ctx) {
            Ok(true) => {
                data.nak_pending = false;
                Progress::Sent
            }
            Ok(false) => {
                data.nak_pending = false;
                Progress::Idle
            }
            Err(e) => send_failure(core, data, ctx, e),
        };
    }
    if data.fin_pending {
        if let Err(e) = send_fin(core, data, ctx) {
            return send_failure(core, data, ctx, e);
        }
        data.fin_pending = false;
        if data.sub_state != RxSubState::WaitForFinAck {
            data.sub_state = RxSubState::WaitForFinAck;
            data.ack_retries = 0;
        }
        core.retry_timer = Some(ctx.timer(ctx.cfg.ack_timer_s));
        return Progress::Sent;
    }
    Progress::Idle
}

/// Advance the timers of the transaction by one tick and continue the checksum calculation.
pub fn tick(txn: &mut Transaction, ctx: &mut TxnCtx) {
    {
        let Transaction { core, state } = &mut *txn;
        if core.flags.done || core.flags.suspended {
            return;
        }
        match state {
            TxnState::R1(data) | TxnState::R2(data) => tick_recv(core, data, ctx),
            TxnState::Drop(_) => {
                core.inactivity_timer.tick();
                if core.inactivity_timer.has_expired() {
                    core.complete();
                }
            }
            _ => (),
        }
    }
    enter_drop_on_failure(txn, ctx);
}

/// Handle a PDU which was matched to this transaction.
pub fn recv(txn: &mut Transaction, ctx: &mut TxnCtx, pdu: &LogicalPdu) {
    {
        let Transaction { core, state } = &mut *txn;
        if core.flags.done {
            return;
        }
        core.inactivity_timer.reset();
        match state {
            TxnState::R1(data) | TxnState::R2(data) => recv_pdu(core, data, ctx, pdu),
            TxnState::Drop(_) => ctx.counters.recv.dropped += 1,
            _ => (),
        }
    }
    enter_drop_on_failure(txn, ctx);
}

fn recv_pdu(core: &mut TxnCore, data: &mut RecvData, ctx: &mut TxnCtx, pdu: &LogicalPdu) {
    match &pdu.body {
        PduBody::FileData(fd) => handle_file_data(core, data, ctx, fd),
        PduBody::Directive(DirectiveBody::Metadata(md)) => handle_metadata(core, data, ctx, md),
        PduBody::Directive(DirectiveBody::Eof(eof)) => handle_eof(core, data, ctx, eof),
        PduBody::Directive(DirectiveBody::Ack(ack))
            if ack.ack_directive == FileDirectiveType::FinishedPdu =>
        {
            handle_fin_ack(core, data, ctx)
        }
        PduBody::Directive(DirectiveBody::Prompt { .. })
        | PduBody::Directive(DirectiveBody::KeepAlive { .. }) => {
            ctx.report(EventId::PduIgnoredDirective, core.id)
        }
        _ => spurious(core, ctx),
    }
}

/// A class 1 reception which failed before its end cannot notify the sender, so the remaining
/// PDUs are absorbed by the `Drop` state.
fn enter_drop_on_failure(txn: &mut Transaction, ctx: &mut TxnCtx) {
    if txn.core.flags.done || !txn.core.status.is_error() {
        return;
    }
    if let TxnState::R1(data) = &mut txn.state {
        let data = core::mem::take(data);
        txn.state = TxnState::Drop(data);
        txn.core.retry_timer = None;
        txn.core.inactivity_timer = ctx.timer(ctx.cfg.inactivity_timer_s);
        ctx.report(EventId::TxnDropped, txn.core.id);
    }
}

fn spurious(core: &TxnCore, ctx: &mut TxnCtx) {
    ctx.counters.recv.spurious += 1;
    ctx.report(EventId::PduSpurious, core.id);
}

fn create_or_truncate(ctx: &TxnCtx, path: &str) -> Result<(), FilestoreError> {
    if ctx.vfs.exists(path)? {
        ctx.vfs.truncate_file(path)
    } else {
        ctx.vfs.create_file(path)
    }
}

/// Remove the partially received file.
fn discard_file(data: &mut RecvData, ctx: &mut TxnCtx) -> FileStatus {
    if !data.file_created {
        return FileStatus::DiscardDeliberately;
    }
    match ctx.vfs.remove_file(&data.dst_path) {
        Ok(()) => {
            data.file_created = false;
            FileStatus::DiscardDeliberately
        }
        Err(e) => {
            log::warn!("removing {} failed: {}", data.dst_path, e);
            FileStatus::DiscardedFsRejection
        }
    }
}

/// Record a failure. Class 2 sends a Finished PDU with the error, class 1 ends right away or
/// moves to the drop state.
fn fail(core: &mut TxnCore, data: &mut RecvData, ctx: &mut TxnCtx, status: TxnStatus) {
    core.set_status(status);
    if data.fin.is_some() {
        return;
    }
    let file_status = discard_file(data, ctx);
    if !core.is_acknowledged() {
        if data.sub_state == RxSubState::Eof {
            core.complete();
        }
        return;
    }
    data.fin = Some(FinInfo {
        condition_code: core.status.condition_code(),
        delivery_code: DeliveryCode::Incomplete,
        file_status,
    });
    data.fin_pending = true;
    data.nak_pending = false;
    core.retry_timer = None;
    data.sub_state = RxSubState::Eof;
}

fn succeed(core: &mut TxnCore, data: &mut RecvData) {
    data.checksum_verified = true;
    core.retry_timer = None;
    if !core.is_acknowledged() {
        core.complete();
        return;
    }
    data.fin = Some(FinInfo {
        condition_code: ConditionCode::NoError,
        delivery_code: DeliveryCode::Complete,
        file_status: FileStatus::Retained,
    });
    data.fin_pending = true;
}

fn handle_metadata(core: &mut TxnCore, data: &mut RecvData, ctx: &mut TxnCtx, md: &Metadata) {
    if data.md_received || data.fin.is_some() {
        return;
    }
    let (Some(src), Some(dst)) = (md.source_filename.as_str(), md.dest_filename.as_str())
    else {
        log::warn!("transaction {}: file names are not valid UTF-8", core.id);
        return fail(core, data, ctx, TxnStatus::ProtocolError);
    };
    let checksum_type = match md.checksum() {
        Some(checksum_type) if RunningChecksum::new(checksum_type).is_some() => checksum_type,
        _ => {
            ctx.report(EventId::RxUnsupportedChecksum, core.id);
            return fail(core, data, ctx, TxnStatus::UnsupportedChecksumType);
        }
    };
    data.md_received = true;
    data.src_path = src.into();
    data.checksum_type = checksum_type;
    data.md_size = Some(md.size);
    if data.temp_file && data.file_created {
        if let Err(e) = ctx.vfs.rename_file(&data.dst_path, dst) {
            log::warn!("renaming {} to {} failed: {}", data.dst_path, dst, e);
            ctx.counters.fault.file_rename += 1;
            ctx.report(EventId::RxFileRenameFailed, core.id);
            return fail(core, data, ctx, TxnStatus::FilestoreRejection);
        }
        data.temp_file = false;
        data.dst_path = dst.into();
    } else {
        data.dst_path = dst.into();
        if let Err(e) = create_or_truncate(ctx, dst) {
            log::warn!("creating {} failed: {}", dst, e);
            ctx.counters.fault.file_open += 1;
            ctx.report(EventId::RxFileCreateFailed, core.id);
            return fail(core, data, ctx, TxnStatus::FilestoreRejection);
        }
        data.file_created = true;
    }
    if let Some(eof) = data.eof {
        if eof.size != md.size {
            ctx.counters.fault.file_size_mismatch += 1;
            ctx.report(EventId::RxMetadataSizeMismatch, core.id);
            return fail(core, data, ctx, TxnStatus::FileSizeError);
        }
    }
}

fn handle_file_data(core: &mut TxnCore, data: &mut RecvData, ctx: &mut TxnCtx, fd: &FileData) {
    if data.fin.is_some() || data.sub_state == RxSubState::WaitForFinAck {
        return;
    }
    if !data.file_created {
        data.dst_path = temp_file_path(ctx.tmp_dir, core.id.source_id(), core.id.seq_num());
        if let Err(e) = create_or_truncate(ctx, &data.dst_path) {
            log::warn!("creating {} failed: {}", data.dst_path, e);
            ctx.counters.fault.file_open += 1;
            ctx.report(EventId::RxFileCreateFailed, core.id);
            return fail(core, data, ctx, TxnStatus::FilestoreRejection);
        }
        data.temp_file = true;
        data.file_created = true;
        ctx.report(EventId::RxTempFileUsed, core.id);
    }
    if let Err(e) = ctx.vfs.write_data(&data.dst_path, fd.offset, fd.data) {
        log::warn!("writing to {} failed: {}", data.dst_path, e);
        ctx.counters.fault.file_write += 1;
        ctx.report(EventId::RxFileWriteFailed, core.id);
        return fail(core, data, ctx, TxnStatus::FilestoreRejection);
    }
    ctx.counters.recv.file_data_bytes += fd.data.len() as u64;
    if let Err(e) = data.received.add(fd.offset, fd.data.len() as u64) {
        // Written anyway, the range is requested again by the next NAK.
        log::warn!("transaction {}: untracked file data: {}", core.id, e);
    }
}

fn handle_eof(core: &mut TxnCore, data: &mut RecvData, ctx: &mut TxnCtx, eof: &Eof) {
    if core.is_acknowledged() {
        data.eof_ack_pending = true;
    }
    if data.eof.is_some() {
        return;
    }
    data.eof = Some(EofInfo {
        condition_code: eof.condition_code,
        checksum: eof.crc,
        size: eof.size,
    });
    if data.fin.is_some() {
        return;
    }
    if eof.condition_code != ConditionCode::NoError {
        // Notice of cancellation from the sender.
        core.set_status(TxnStatus::from(eof.condition_code));
        discard_file(data, ctx);
        data.sub_state = RxSubState::Eof;
        if !core.is_acknowledged() {
            core.complete();
        }
        return;
    }
    data.sub_state = RxSubState::Eof;
    let size_mismatch = data.md_size.is_some_and(|size| size != eof.size);
    if size_mismatch || data.received.extent() > eof.size {
        ctx.counters.fault.file_size_mismatch += 1;
        ctx.report(EventId::RxEofSizeMismatch, core.id);
        return fail(core, data, ctx, TxnStatus::FileSizeError);
    }
    if core.is_acknowledged() {
        if !is_data_complete(data) {
            data.nak_pending = true;
            data.nak_retries = 0;
            core.retry_timer = Some(ctx.timer(ctx.cfg.nak_timer_s));
        }
        return;
    }
    if !data.md_received {
        // Without the Metadata PDU there is no destination name. The data stays in the
        // temporary file.
        ctx.report(EventId::RxMissingMetadata, core.id);
        core.set_status(TxnStatus::ProtocolError);
        core.complete();
        return;
    }
    // Class 1 has no retransmission, a gap is final.
    if !data.received.is_complete(eof.size) {
        ctx.counters.fault.file_size_mismatch += 1;
        ctx.report(EventId::RxEofSizeMismatch, core.id);
        fail(core, data, ctx, TxnStatus::FileSizeError);
    }
}

fn handle_fin_ack(core: &mut TxnCore, data: &mut RecvData, ctx: &mut TxnCtx) {
    if !core.is_acknowledged() || data.sub_state != RxSubState::WaitForFinAck {
        return spurious(core, ctx);
    }
    core.complete();
}

#[inline]
fn is_data_complete(data: &RecvData) -> bool {
    data.md_received && data.eof.is_some_and(|eof| data.received.is_complete(eof.size))
}

fn tick_recv(core: &mut TxnCore, data: &mut RecvData, ctx: &mut TxnCtx) {
    match data.sub_state {
        RxSubState::FileData | RxSubState::Eof => {
            let verifying = data.sub_state == RxSubState::Eof
                && data.fin.is_none()
                && !core.status.is_error()
                && is_data_complete(data);
            if verifying {
                // Nothing is expected from the peer while the checksum is calculated.
                core.retry_timer = None;
                return calculate_checksum_step(core, data, ctx);
            }
            core.inactivity_timer.tick();
            if core.inactivity_timer.has_expired() && data.fin.is_none() {
                ctx.counters.fault.inactivity_timer += 1;
                ctx.report(EventId::RxInactivity, core.id);
                fail(core, data, ctx, TxnStatus::InactivityDetected);
                if !core.is_acknowledged() {
                    core.complete();
                }
                return;
            }
            if data.sub_state == RxSubState::Eof
                && data.fin.is_none()
                && !core.status.is_error()
                && core.is_acknowledged()
            {
                handle_nak_timer(core, data, ctx);
            }
        }
        RxSubState::WaitForFinAck => {
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
                ctx.report(EventId::RxAckLimitNoFin, core.id);
                core.set_status(TxnStatus::AckLimitNoFin);
                core.complete();
            } else {
                timer.reset();
                data.fin_pending = true;
            }
        }
    }
}

fn handle_nak_timer(core: &mut TxnCore, data: &mut RecvData, ctx: &mut TxnCtx) {
    let Some(timer) = core.retry_timer.as_mut() else {
        return;
    };
    timer.tick();
    if !timer.has_expired() {
        return;
    }
    if data.nak_retries < ctx.cfg.nak_limit {
        data.nak_retries += 1;
        data.nak_pending = true;
        timer.reset();
    } else {
        ctx.counters.fault.nak_limit += 1;
        ctx.report(EventId::RxNakLimit, core.id);
        fail(core, data, ctx, TxnStatus::NakLimitReached);
    }
}

/// Feed the next part of the completed file into the checksum. At most
/// `rx_crc_calc_bytes_per_wakeup` bytes are processed per call.
fn calculate_checksum_step(core: &mut TxnCore, data: &mut RecvData, ctx: &mut TxnCtx) {
    let Some(eof) = data.eof else {
        return;
    };
    if data.checksum.is_none() && data.checksum_offset == 0 {
        data.checksum = RunningChecksum::new(data.checksum_type);
    }
    let Some(checksum) = data.checksum.as_mut() else {
        return fail(core, data, ctx, TxnStatus::UnsupportedChecksumType);
    };
    let budget = ctx.params.rx_crc_calc_bytes_per_wakeup as u64;
    let len = core::cmp::min(budget, eof.size - data.checksum_offset);
    match ctx
        .vfs
        .checksum_range(&data.dst_path, checksum, data.checksum_offset, len, ctx.io_buf)
    {
        Ok(processed) if processed == len => data.checksum_offset += processed,
        Ok(_) => {
            ctx.counters.fault.file_size_mismatch += 1;
            ctx.report(EventId::RxEofSizeMismatch, core.id);
            return fail(core, data, ctx, TxnStatus::FileSizeError);
        }
        Err(e) => {
            log::warn!("reading {} failed: {}", data.dst_path, e);
            ctx.counters.fault.file_read += 1;
            ctx.report(EventId::RxFileReadFailed, core.id);
            return fail(core, data, ctx, TxnStatus::FilestoreRejection);
        }
    }
    if data.checksum_offset < eof.size {
        return;
    }
    let value = data.checksum.take().map_or(0, RunningChecksum::finalize);
    if value != eof.checksum && data.checksum_type != crate::pdu::ChecksumType::NullChecksum {
        log::warn!(
            "transaction {}: checksum mismatch, expected {:#010x}, calculated {:#010x}",
            core.id,
            eof.checksum,
            value
        );
        ctx.counters.fault.crc_mismatch += 1;
        ctx.report(EventId::RxChecksumMismatch, core.id);
        return fail(core, data, ctx, TxnStatus::FileChecksumFailure);
    }
    succeed(core, data);
}

/// A throttled transport is retried in a later cycle. Any other send failure ends the
/// transaction, the peer closes out through its own timers.
fn send_failure(
    core: &mut TxnCore,
    data: &mut RecvData,
    ctx: &mut TxnCtx,
    error: SendBlocked,
) -> Progress {
    if error == SendBlocked::Throttled {
        return Progress::Blocked;
    }
    log::warn!(
        "transaction {}: sending in state {:?} failed",
        core.id,
        data.sub_state
    );
    core.set_status(TxnStatus::ProtocolError);
    if data.fin.is_none() {
        discard_file(data, ctx);
    }
    data.eof_ack_pending = false;
    data.nak_pending = false;
    data.fin_pending = false;
    core.retry_timer = None;
    core.complete();
    Progress::Idle
}

fn send_eof_ack(core: &TxnCore, data: &RecvData, ctx: &mut TxnCtx) -> Result<(), SendBlocked> {
    let condition_code = data
        .eof
        .map_or(ConditionCode::NoError, |eof| eof.condition_code);
    let mut pdu = LogicalPdu::new_directive(
        core.pdu_header(ctx, PduType::FileDirective),
        DirectiveBody::Ack(Ack {
            ack_directive: FileDirectiveType::EofPdu,
            ack_subtype: 0,
            condition_code,
            txn_status: TransactionStatus::Active,
        }),
    );
    ctx.send_pdu(&mut pdu)
}

/// Returns `false` if there was nothing left to request.
fn send_nak(core: &TxnCore, data: &RecvData, ctx: &mut TxnCtx) -> Result<bool, SendBlocked> {
    let Some(eof) = data.eof else {
        return Ok(false);
    };
    let mut segment_requests = SegmentList::new();
    if !data.md_received {
        segment_requests.push(SegmentRequest::METADATA);
    }
    let gaps = data
        .received
        .compute_gaps(eof.size, NAK_MAX_SEGMENTS - segment_requests.len());
    segment_requests.extend(gaps);
    if segment_requests.is_empty() {
        return Ok(false);
    }
    let requests = segment_requests.len() as u32;
    let mut pdu = LogicalPdu::new_directive(
        core.pdu_header(ctx, PduType::FileDirective),
        DirectiveBody::Nak(Nak {
            scope_start: 0,
            scope_end: eof.size,
            segment_requests,
        }),
    );
    ctx.send_pdu(&mut pdu)?;
    ctx.counters.sent.nak_segment_requests += requests;
    Ok(true)
}

fn send_fin(core: &TxnCore, data: &RecvData, ctx: &mut TxnCtx) -> Result<(), SendBlocked> {
    let Some(fin) = data.fin else {
        return Ok(());
    };
    let mut pdu = LogicalPdu::new_directive(
        core.pdu_header(ctx, PduType::FileDirective),
        DirectiveBody::Fin(Fin {
            condition_code: fin.condition_code,
            delivery_code: fin.delivery_code,
            file_status: fin.file_status,
            tlv_list: Default::default(),
        }),
    );
    ctx.send_pdu(&mut pdu)
}

#[cfg(test)]
mod tests {
    use std::{fs, path::Path, string::String, vec::Vec};

    use tempfile::TempDir;

    use super::*;
    use crate::{
        checksum::calculate_checksum,
        codec::{decode_pdu, encode_pdu},
        pdu::{ChecksumType, Direction, Lv, PduHeader, TransmissionMode},
        time::TickTimer,
        transaction::{tests::CtxOwner, TxnDirection},
        TransactionId,
    };

    const LOCAL_ID: u64 = 23;
    const REMOTE_ID: u64 = 25;
    const SEQ: u64 = 7;

    #[derive(Debug)]
    enum Reply {
        Ack(Ack),
        Nak(Vec<SegmentRequest>),
        Fin(FinInfo),
    }

    struct DestTestbench {
        dir: TempDir,
        dst_path: String,
        owner: CtxOwner,
        txn: Transaction,
        file_content: Vec<u8>,
    }

    impl DestTestbench {
        fn new(class: TransmissionMode, file_content: &[u8]) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let dst_path = dir.path().join("dst.bin").to_str().unwrap().into();
            let owner = CtxOwner::new(LOCAL_ID, dir.path().to_str().unwrap());
            let state = match class {
                TransmissionMode::Acknowledged => TxnState::R2(RecvData::new()),
                TransmissionMode::Unacknowledged => TxnState::R1(RecvData::new()),
            };
            let core = TxnCore::new(
                TransactionId::new(REMOTE_ID, SEQ),
                REMOTE_ID,
                TxnDirection::Receive,
                class,
                0,
                TickTimer::new(3),
            );
            Self {
                dir,
                dst_path,
                owner,
                txn: Transaction::new(core, state),
                file_content: file_content.to_vec(),
            }
        }

        fn header(&self) -> PduHeader {
            PduHeader::new(
                PduType::FileDirective,
                Direction::TowardsReceiver,
                self.txn.class(),
                REMOTE_ID,
                LOCAL_ID,
                SEQ,
            )
        }

        fn feed(&mut self, mut pdu: LogicalPdu) {
            let mut buf = [0; 512];
            let len = encode_pdu(&mut buf, &mut pdu).unwrap();
            let decoded = decode_pdu(&buf[..len]).unwrap();
            let mut ctx = self.owner.ctx();
            recv(&mut self.txn, &mut ctx, &decoded);
        }

        fn metadata(&mut self) {
            let dst_path = self.dst_path.clone();
            let md = Metadata {
                closure_requested: self.txn.core.is_acknowledged(),
                checksum_type: ChecksumType::Crc32 as u8,
                size: self.file_content.len() as u64,
                source_filename: Lv::new_from_str("/remote/src.bin"),
                dest_filename: Lv::new_from_str(&dst_path),
                options: Default::default(),
            };
            let pdu = LogicalPdu::new_directive(self.header(), DirectiveBody::Metadata(md));
            self.feed(pdu);
        }

        fn file_data(&mut self, offset: usize, len: usize) {
            let content = self.file_content.clone();
            let pdu = LogicalPdu::new_file_data(
                self.header(),
                FileData {
                    offset: offset as u64,
                    data: &content[offset..offset + len],
                    ..Default::default()
                },
            );
            self.feed(pdu);
        }

        fn eof(&mut self) {
            let crc = calculate_checksum(ChecksumType::Crc32, &self.file_content).unwrap();
            self.eof_with(ConditionCode::NoError, crc, self.file_content.len() as u64);
        }

        fn eof_with(&mut self, condition_code: ConditionCode, crc: u32, size: u64) {
            let pdu = LogicalPdu::new_directive(
                self.header(),
                DirectiveBody::Eof(Eof {
                    condition_code,
                    crc,
                    size,
                    fault_location: None,
                }),
            );
            self.feed(pdu);
        }

        fn fin_ack(&mut self) {
            let pdu = LogicalPdu::new_directive(
                self.header(),
                DirectiveBody::Ack(Ack {
                    ack_directive: FileDirectiveType::FinishedPdu,
                    ack_subtype: 1,
                    condition_code: ConditionCode::NoError,
                    txn_status: TransactionStatus::Active,
                }),
            );
            self.feed(pdu);
        }

        fn step(&mut self) -> Progress {
            let mut ctx = self.owner.ctx();
            step(&mut self.txn, &mut ctx)
        }

        fn tick(&mut self) {
            let mut ctx = self.owner.ctx();
            tick(&mut self.txn, &mut ctx)
        }

        fn next_reply(&mut self) -> Reply {
            let raw = self
                .owner
                .sender
                .retrieve_next_pdu()
                .expect("no PDU was sent")
                .raw_pdu;
            let pdu = decode_pdu(&raw).unwrap();
            assert_eq!(pdu.header.direction, Direction::TowardsSender);
            assert_eq!(pdu.header.source_eid, REMOTE_ID);
            assert_eq!(pdu.header.destination_eid, LOCAL_ID);
            match pdu.body {
                PduBody::Directive(DirectiveBody::Ack(ack)) => Reply::Ack(ack),
                PduBody::Directive(DirectiveBody::Nak(nak)) => {
                    Reply::Nak(nak.segment_requests.to_vec())
                }
                PduBody::Directive(DirectiveBody::Fin(fin)) => Reply::Fin(FinInfo {
                    condition_code: fin.condition_code,
                    delivery_code: fin.delivery_code,
                    file_status: fin.file_status,
                }),
                other => panic!("unexpected PDU {:?}", other),
            }
        }

        fn check_eof_ack(&mut self) {
            match self.next_reply() {
                Reply::Ack(ack) => assert_eq!(ack.ack_directive, FileDirectiveType::EofPdu),
                other => panic!("expected EOF ACK, got {:?}", other),
            }
        }

        fn check_nak(&mut self, expected: &[SegmentRequest]) {
            match self.next_reply() {
                Reply::Nak(requests) => assert_eq!(requests, expected),
                other => panic!("expected NAK, got {:?}", other),
            }
        }

        fn check_fin(&mut self, condition_code: ConditionCode, delivery_code: DeliveryCode) {
            match self.next_reply() {
                Reply::Fin(fin) => {
                    assert_eq!(fin.condition_code, condition_code);
                    assert_eq!(fin.delivery_code, delivery_code);
                }
                other => panic!("expected FIN, got {:?}", other),
            }
        }

        fn run_until_idle(&mut self) -> usize {
            let mut sent = 0;
            while self.step() == Progress::Sent {
                sent += 1;
            }
            sent
        }
    }

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|idx| (idx * 7 % 256) as u8).collect()
    }

    #[test]
    fn test_class_1_reception() {
        let mut tb = DestTestbench::new(TransmissionMode::Unacknowledged, &content(1000));
        tb.metadata();
        tb.file_data(0, 480);
        tb.file_data(480, 480);
        tb.file_data(960, 40);
        tb.eof();
        assert_eq!(tb.txn.rx_sub_state(), Some(RxSubState::Eof));
        tb.tick();
        assert!(tb.txn.is_done());
        assert_eq!(tb.txn.status(), TxnStatus::NoError);
        assert_eq!(fs::read(&tb.dst_path).unwrap(), tb.file_content);
        assert!(tb.owner.sender.queue_empty());
        assert_eq!(tb.owner.counters.recv.file_data_bytes, 1000);
    }

    #[test]
    fn test_class_2_reception_with_gap() {
        let mut tb = DestTestbench::new(TransmissionMode::Acknowledged, &content(1000));
        tb.metadata();
        tb.file_data(0, 480);
        tb.file_data(960, 40);
        tb.eof();
        assert_eq!(tb.run_until_idle(), 2);
        tb.check_eof_ack();
        tb.check_nak(&[SegmentRequest::new(480, 960)]);
        tb.file_data(480, 480);
        tb.tick();
        assert_eq!(tb.run_until_idle(), 1);
        tb.check_fin(ConditionCode::NoError, DeliveryCode::Complete);
        assert_eq!(tb.txn.rx_sub_state(), Some(RxSubState::WaitForFinAck));
        tb.fin_ack();
        assert!(tb.txn.is_done());
        assert_eq!(tb.txn.status(), TxnStatus::NoError);
        assert_eq!(fs::read(&tb.dst_path).unwrap(), tb.file_content);
    }

    #[test]
    fn test_checksum_bounded_per_tick() {
        let mut tb = DestTestbench::new(TransmissionMode::Acknowledged, &content(3000));
        tb.metadata();
        for offset in (0..3000).step_by(480) {
            tb.file_data(offset, core::cmp::min(480, 3000 - offset));
        }
        tb.eof();
        tb.run_until_idle();
        tb.check_eof_ack();
        // 1024 bytes per tick.
        tb.tick();
        tb.tick();
        assert!(!tb.txn.state().recv_data().unwrap().checksum_verified);
        tb.tick();
        assert!(tb.txn.state().recv_data().unwrap().checksum_verified);
        assert_eq!(tb.run_until_idle(), 1);
        tb.check_fin(ConditionCode::NoError, DeliveryCode::Complete);
    }

    #[test]
    fn test_checksum_failure_discards_file() {
        let mut tb = DestTestbench::new(TransmissionMode::Acknowledged, &content(100));
        tb.metadata();
        tb.file_data(0, 100);
        tb.eof_with(ConditionCode::NoError, 0xdead_beef, 100);
        tb.run_until_idle();
        tb.check_eof_ack();
        tb.tick();
        assert_eq!(tb.txn.status(), TxnStatus::FileChecksumFailure);
        assert_eq!(tb.run_until_idle(), 1);
        tb.check_fin(ConditionCode::FileChecksumFailure, DeliveryCode::Incomplete);
        assert!(!Path::new(&tb.dst_path).exists());
        assert_eq!(tb.owner.counters.fault.crc_mismatch, 1);
    }

    #[test]
    fn test_failed_eof_ack_ends_transaction() {
        let mut tb = DestTestbench::new(TransmissionMode::Acknowledged, &content(100));
        tb.metadata();
        tb.file_data(0, 100);
        tb.eof();
        tb.owner.sender.set_failing(true);
        assert_eq!(tb.step(), Progress::Idle);
        assert!(tb.txn.is_done());
        assert_eq!(tb.txn.status(), TxnStatus::ProtocolError);
        assert!(tb.owner.sender.queue_empty());
        assert!(!Path::new(&tb.dst_path).exists());
        tb.tick();
        assert_eq!(tb.step(), Progress::Idle);
        assert!(tb.owner.sender.queue_empty());
    }

    #[test]
    fn test_file_data_before_metadata() {
        let mut tb = DestTestbench::new(TransmissionMode::Acknowledged, &content(500));
        tb.file_data(0, 480);
        let temp = temp_file_path(tb.dir.path().to_str().unwrap(), REMOTE_ID, SEQ);
        assert!(Path::new(&temp).exists());
        assert_eq!(tb.owner.hook.count(EventId::RxTempFileUsed), 1);
        tb.file_data(480, 20);
        tb.eof();
        tb.run_until_idle();
        tb.check_eof_ack();
        tb.check_nak(&[SegmentRequest::METADATA]);
        tb.metadata();
        assert!(!Path::new(&temp).exists());
        tb.tick();
        assert_eq!(tb.run_until_idle(), 1);
        tb.check_fin(ConditionCode::NoError, DeliveryCode::Complete);
        assert_eq!(fs::read(&tb.dst_path).unwrap(), tb.file_content);
    }

    #[test]
    fn test_eof_size_mismatch() {
        let mut tb = DestTestbench::new(TransmissionMode::Acknowledged, &content(100));
        tb.metadata();
        tb.file_data(0, 100);
        tb.eof_with(ConditionCode::NoError, 0, 120);
        assert_eq!(tb.txn.status(), TxnStatus::FileSizeError);
        assert_eq!(tb.run_until_idle(), 2);
        tb.check_eof_ack();
        tb.check_fin(ConditionCode::FileSizeError, DeliveryCode::Incomplete);
    }

    #[test]
    fn test_nak_limit() {
        let mut tb = DestTestbench::new(TransmissionMode::Acknowledged, &content(1000));
        tb.txn.core.inactivity_timer = TickTimer::new(100);
        tb.metadata();
        tb.file_data(0, 480);
        tb.eof();
        tb.run_until_idle();
        tb.check_eof_ack();
        let mut naks = 0;
        while tb.owner.sender.retrieve_next_pdu().is_some() {
            naks += 1;
        }
        let nak_limit = tb.owner.cfg.nak_limit;
        for _ in 0..nak_limit {
            // NAK timer of one tick.
            tb.tick();
            assert_eq!(tb.run_until_idle(), 1);
            naks += 1;
            tb.owner.sender.retrieve_next_pdu().unwrap();
        }
        assert_eq!(naks, 1 + nak_limit as usize);
        tb.tick();
        assert_eq!(tb.txn.status(), TxnStatus::NakLimitReached);
        assert_eq!(tb.run_until_idle(), 1);
        tb.check_fin(ConditionCode::NakLimitReached, DeliveryCode::Incomplete);
        assert_eq!(tb.owner.counters.fault.nak_limit, 1);
    }

    #[test]
    fn test_fin_ack_limit() {
        let mut tb = DestTestbench::new(TransmissionMode::Acknowledged, &content(10));
        tb.metadata();
        tb.file_data(0, 10);
        tb.eof();
        tb.tick();
        assert_eq!(tb.run_until_idle(), 2);
        tb.check_eof_ack();
        tb.check_fin(ConditionCode::NoError, DeliveryCode::Complete);
        let ack_limit = tb.owner.cfg.ack_limit;
        for _ in 0..ack_limit - 1 {
            tb.tick();
            assert_eq!(tb.run_until_idle(), 1);
            tb.check_fin(ConditionCode::NoError, DeliveryCode::Complete);
        }
        tb.tick();
        assert!(tb.txn.is_done());
        assert_eq!(tb.txn.status(), TxnStatus::AckLimitNoFin);
        assert_eq!(tb.owner.hook.count(EventId::RxAckLimitNoFin), 1);
    }

    #[test]
    fn test_class_2_inactivity() {
        let mut tb = DestTestbench::new(TransmissionMode::Acknowledged, &content(100));
        tb.metadata();
        for _ in 0..3 {
            tb.tick();
        }
        assert_eq!(tb.txn.status(), TxnStatus::InactivityDetected);
        assert_eq!(tb.run_until_idle(), 1);
        tb.check_fin(ConditionCode::InactivityDetected, DeliveryCode::Incomplete);
        assert_eq!(tb.owner.hook.count(EventId::RxInactivity), 1);
    }

    #[test]
    fn test_class_1_missing_metadata_keeps_temp_file() {
        let mut tb = DestTestbench::new(TransmissionMode::Unacknowledged, &content(100));
        tb.file_data(0, 100);
        tb.eof();
        assert!(tb.txn.is_done());
        assert_eq!(tb.txn.status(), TxnStatus::ProtocolError);
        let temp = temp_file_path(tb.dir.path().to_str().unwrap(), REMOTE_ID, SEQ);
        assert_eq!(fs::read(temp).unwrap(), tb.file_content);
        assert_eq!(tb.owner.hook.count(EventId::RxMissingMetadata), 1);
    }

    #[test]
    fn test_class_1_failure_enters_drop() {
        let mut tb = DestTestbench::new(TransmissionMode::Unacknowledged, &content(100));
        tb.dst_path = String::from("/nonexistent-dir/dst.bin");
        tb.metadata();
        assert!(matches!(tb.txn.state(), TxnState::Drop(_)));
        assert_eq!(tb.txn.status(), TxnStatus::FilestoreRejection);
        tb.file_data(0, 100);
        assert_eq!(tb.owner.counters.recv.dropped, 1);
        for _ in 0..3 {
            assert!(!tb.txn.is_done());
            tb.tick();
        }
        assert!(tb.txn.is_done());
    }

    #[test]
    fn test_cancelled_by_sender() {
        let mut tb = DestTestbench::new(TransmissionMode::Acknowledged, &content(100));
        tb.metadata();
        tb.file_data(0, 50);
        tb.eof_with(ConditionCode::CancelRequestReceived, 0, 50);
        assert_eq!(tb.run_until_idle(), 1);
        tb.check_eof_ack();
        assert!(tb.txn.is_done());
        assert_eq!(tb.txn.status(), TxnStatus::CancelRequestReceived);
        assert!(!Path::new(&tb.dst_path).exists());
    }

    #[test]
    fn test_local_cancel() {
        let mut tb = DestTestbench::new(TransmissionMode::Acknowledged, &content(100));
        tb.metadata();
        tb.txn.core.flags.cancel_requested = true;
        assert_eq!(tb.run_until_idle(), 1);
        tb.check_fin(ConditionCode::CancelRequestReceived, DeliveryCode::Incomplete);
        assert_eq!(tb.txn.rx_sub_state(), Some(RxSubState::WaitForFinAck));
    }
}
