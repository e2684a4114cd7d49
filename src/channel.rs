//! # Channel Module
//!
//! A [Channel] owns the transactions of one logical transfer path. The transactions live in a
//! fixed size [TransactionArena] and are addressed by generation checked [TxnHandle]s. Every
//! slot is a member of exactly one queue:
//!
//! * `Pending` - commanded sends which were not started yet.
//! * `TxActive` - the send transaction currently streaming file data.
//! * `TxWait` - class 2 sends waiting for the EOF ACK or the Finished PDU.
//! * `Rx` - receive transactions, including dropped ones.
//! * `Free` - unused slots.
//!
//! Moving a slot between queues is O(1). Finished transactions are released into the bounded
//! history ring of the channel.
use alloc::{collections::VecDeque, format, string::String, vec::Vec};

use hashbrown::HashMap;

use crate::{
    config::{ChannelConfig, PollDirConfig},
    dest,
    engine::CommandError,
    event::{ChannelCounters, EventHook, EventId, EventReporter},
    filestore::VirtualFilestore,
    pdu::{
        Ack, ConditionCode, DirectiveBody, Direction, FileDirectiveType, LogicalPdu, PduBody,
        PduHeader, PduType, TransactionStatus, TransmissionMode,
    },
    request::QueueSelector,
    source,
    time::{CountdownProvider, TickTimer},
    transaction::{
        EngineParams, HistoryEntry, PlaybackRef, Progress, RecvData, SendData, Transaction,
        TxSubState, TxnCore, TxnCtx, TxnDirection, TxnState, TxnStatus,
    },
    EntityId, PduSender, TransactionId, TransactionSeq,
};

/// Number of commanded playback slots per channel.
pub const MAX_COMMANDED_PLAYBACKS: usize = 2;
/// Files of one playback which may be in flight at the same time.
pub const MAX_PLAYBACK_IN_FLIGHT: usize = 5;

/// Stable reference to an arena slot. A handle becomes stale once its slot is freed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TxnHandle {
    index: u32,
    generation: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum QueueId {
    Pending = 0,
    TxActive = 1,
    TxWait = 2,
    Rx = 3,
    Free = 4,
}

const NUM_QUEUES: usize = 5;

#[derive(Debug)]
struct Slot {
    generation: u32,
    queue: QueueId,
    prev: Option<u32>,
    next: Option<u32>,
    txn: Option<Transaction>,
}

#[derive(Debug, Default, Copy, Clone)]
struct QueueList {
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
}

/// Fixed capacity transaction storage with index linked queues.
#[derive(Debug)]
pub struct TransactionArena {
    slots: Vec<Slot>,
    queues: [QueueList; NUM_QUEUES],
}

impl TransactionArena {
    pub fn new(capacity: usize) -> Self {
        let mut arena = Self {
            slots: Vec::with_capacity(capacity),
            queues: [QueueList::default(); NUM_QUEUES],
        };
        for index in 0..capacity {
            arena.slots.push(Slot {
                generation: 0,
                queue: QueueId::Free,
                prev: None,
                next: None,
                txn: None,
            });
            arena.push_back(QueueId::Free, index as u32);
        }
        arena
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn len(&self, queue: QueueId) -> usize {
        self.queues[queue as usize].len
    }

    /// Store a transaction in a free slot which is appended to `queue`. Returns [None] if the
    /// arena is full.
    pub fn alloc(&mut self, txn: Transaction, queue: QueueId) -> Option<TxnHandle> {
        let index = self.queues[QueueId::Free as usize].head?;
        self.unlink(index);
        self.push_back(queue, index);
        let slot = &mut self.slots[index as usize];
        slot.txn = Some(txn);
        Some(TxnHandle {
            index,
            generation: slot.generation,
        })
    }

    fn slot(&self, handle: TxnHandle) -> Option<&Slot> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation && slot.txn.is_some())
    }

    pub fn get(&self, handle: TxnHandle) -> Option<&Transaction> {
        self.slot(handle).and_then(|slot| slot.txn.as_ref())
    }

    pub fn get_mut(&mut self, handle: TxnHandle) -> Option<&mut Transaction> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.txn.as_mut())
    }

    pub fn queue_of(&self, handle: TxnHandle) -> Option<QueueId> {
        self.slot(handle).map(|slot| slot.queue)
    }

    /// Move a live transaction to the end of another queue.
    pub fn move_to(&mut self, handle: TxnHandle, queue: QueueId) -> bool {
        if self.slot(handle).is_none() || queue == QueueId::Free {
            return false;
        }
        self.unlink(handle.index);
        self.push_back(queue, handle.index);
        true
    }

    /// Release the slot and return its transaction. All handles to the slot become stale.
    pub fn free(&mut self, handle: TxnHandle) -> Option<Transaction> {
        self.slot(handle)?;
        self.unlink(handle.index);
        self.push_back(QueueId::Free, handle.index);
        let slot = &mut self.slots[handle.index as usize];
        slot.generation = slot.generation.wrapping_add(1);
        slot.txn.take()
    }

    /// Handles of a queue in queue order.
    pub fn handles(&self, queue: QueueId) -> Vec<TxnHandle> {
        let mut handles = Vec::with_capacity(self.len(queue));
        let mut current = self.queues[queue as usize].head;
        while let Some(index) = current {
            let slot = &self.slots[index as usize];
            handles.push(TxnHandle {
                index,
                generation: slot.generation,
            });
            current = slot.next;
        }
        handles
    }

    fn push_back(&mut self, queue: QueueId, index: u32) {
        let list = &mut self.queues[queue as usize];
        let tail = list.tail;
        list.tail = Some(index);
        list.len += 1;
        match tail {
            Some(tail) => self.slots[tail as usize].next = Some(index),
            None => list.head = Some(index),
        }
        let slot = &mut self.slots[index as usize];
        slot.queue = queue;
        slot.prev = tail;
        slot.next = None;
    }

    fn unlink(&mut self, index: u32) {
        let (queue, prev, next) = {
            let slot = &mut self.slots[index as usize];
            let links = (slot.queue, slot.prev, slot.next);
            slot.prev = None;
            slot.next = None;
            links
        };
        let list = &mut self.queues[queue as usize];
        list.len -= 1;
        match prev {
            Some(prev) => self.slots[prev as usize].next = next,
            None => list.head = next,
        }
        match next {
            Some(next) => self.slots[next as usize].prev = prev,
            None => list.tail = prev,
        }
    }
}

/// Everything owned by the engine which a channel needs for one processing step.
pub struct ChannelEnv<'a> {
    pub vfs: &'a dyn VirtualFilestore,
    pub sender: &'a dyn PduSender,
    pub hook: &'a mut dyn EventHook,
    pub params: EngineParams,
    pub tmp_dir: &'a str,
    pub fail_dir: &'a str,
    /// Last sequence number used by the local entity.
    pub seq_num: &'a mut TransactionSeq,
    pub out_buf: &'a mut [u8],
    pub io_buf: &'a mut [u8],
}

impl ChannelEnv<'_> {
    pub fn txn_ctx<'b>(
        &'b mut self,
        channel: u8,
        cfg: &'b ChannelConfig,
        counters: &'b mut ChannelCounters,
    ) -> TxnCtx<'b> {
        TxnCtx {
            vfs: self.vfs,
            sender: self.sender,
            events: EventReporter::new(&mut *self.hook),
            counters,
            cfg,
            channel,
            params: self.params,
            tmp_dir: self.tmp_dir,
            out_buf: &mut *self.out_buf,
            io_buf: &mut *self.io_buf,
        }
    }

    pub fn report(&mut self, id: EventId, channel: u8, txn: Option<TransactionId>) {
        EventReporter::new(&mut *self.hook).report(id, Some(channel), txn);
    }

    fn next_seq_num(&mut self) -> TransactionSeq {
        *self.seq_num = self.seq_num.wrapping_add(1);
        *self.seq_num
    }
}

/// Parameters of a send transaction created by a command or a playback.
#[derive(Debug, Clone)]
pub struct TxParams<'a> {
    pub class: TransmissionMode,
    pub keep: bool,
    pub priority: u8,
    pub dest_eid: EntityId,
    pub src_path: &'a str,
    pub dst_path: &'a str,
    pub playback: Option<PlaybackRef>,
}

/// Directory playback in progress.
#[derive(Debug)]
pub struct PlaybackSlot {
    pub active: bool,
    pub class: TransmissionMode,
    pub keep: bool,
    pub priority: u8,
    pub dest_eid: EntityId,
    pub dst_dir: String,
    /// Files which were not started yet.
    pub files: VecDeque<String>,
    pub in_flight: usize,
}

impl PlaybackSlot {
    fn idle() -> Self {
        Self {
            active: false,
            class: TransmissionMode::Unacknowledged,
            keep: true,
            priority: 0,
            dest_eid: 0,
            dst_dir: String::new(),
            files: VecDeque::new(),
            in_flight: 0,
        }
    }
}

#[derive(Debug)]
pub struct PollSlot {
    pub cfg: PollDirConfig,
    pub timer: TickTimer,
    pub playback: PlaybackSlot,
}

/// Selects transactions for the management commands.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TxnOp {
    Suspend,
    Resume,
    Cancel,
    Abandon,
}

#[derive(Debug)]
pub struct Channel {
    id: u8,
    cfg: ChannelConfig,
    arena: TransactionArena,
    index: HashMap<TransactionId, TxnHandle>,
    history: VecDeque<HistoryEntry>,
    playbacks: Vec<PlaybackSlot>,
    polls: Vec<PollSlot>,
    counters: ChannelCounters,
    frozen: bool,
}

impl Channel {
    pub fn new(id: u8, cfg: ChannelConfig, ticks_per_second: u32) -> Self {
        let polls = cfg
            .poll_dirs
            .iter()
            .map(|poll| PollSlot {
                cfg: poll.clone(),
                timer: TickTimer::from_seconds(poll.interval_s, ticks_per_second),
                playback: PlaybackSlot::idle(),
            })
            .collect();
        Self {
            id,
            arena: TransactionArena::new(cfg.num_transactions),
            index: HashMap::new(),
            history: VecDeque::with_capacity(cfg.num_history),
            playbacks: (0..MAX_COMMANDED_PLAYBACKS)
                .map(|_| PlaybackSlot::idle())
                .collect(),
            polls,
            counters: ChannelCounters::default(),
            frozen: false,
            cfg,
        }
    }

    #[inline]
    pub fn id(&self) -> u8 {
        self.id
    }

    #[inline]
    pub fn config(&self) -> &ChannelConfig {
        &self.cfg
    }

    pub(crate) fn config_mut(&mut self) -> &mut ChannelConfig {
        &mut self.cfg
    }

    #[inline]
    pub fn counters(&self) -> &ChannelCounters {
        &self.counters
    }

    #[inline]
    pub fn history(&self) -> &VecDeque<HistoryEntry> {
        &self.history
    }

    #[inline]
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn set_frozen(&mut self, frozen: bool) {
        self.frozen = frozen;
    }

    #[inline]
    pub fn queue_len(&self, queue: QueueId) -> usize {
        self.arena.len(queue)
    }

    pub fn contains(&self, id: &TransactionId) -> bool {
        self.index.contains_key(id)
    }

    pub fn transaction(&self, id: &TransactionId) -> Option<&Transaction> {
        self.index.get(id).and_then(|handle| self.arena.get(*handle))
    }

    pub fn queue_of(&self, id: &TransactionId) -> Option<QueueId> {
        self.index
            .get(id)
            .and_then(|handle| self.arena.queue_of(*handle))
    }

    /// Identifiers of all live transactions.
    pub fn transaction_ids(&self) -> Vec<TransactionId> {
        self.index.keys().copied().collect()
    }

    pub(crate) fn count_decode_error(&mut self) {
        self.counters.recv.error += 1;
    }

    pub fn poll_slots(&self) -> &[PollSlot] {
        &self.polls
    }

    pub fn playback_slots(&self) -> &[PlaybackSlot] {
        &self.playbacks
    }

    /// Create a send transaction in the pending queue.
    pub fn start_tx(
        &mut self,
        env: &mut ChannelEnv,
        params: TxParams,
    ) -> Result<TransactionId, CommandError> {
        if self.arena.len(QueueId::Free) == 0 {
            return Err(CommandError::NoFreeTransaction(self.id));
        }
        let id = TransactionId::new(env.params.local_eid, env.next_seq_num());
        let mut core = TxnCore::new(
            id,
            params.dest_eid,
            TxnDirection::Send,
            params.class,
            params.priority,
            TickTimer::from_seconds(self.cfg.inactivity_timer_s, env.params.ticks_per_second),
        );
        core.keep = params.keep;
        core.playback = params.playback;
        let data = SendData::new(params.src_path, params.dst_path, self.cfg.checksum_type);
        let state = match params.class {
            TransmissionMode::Acknowledged => TxnState::S2(data),
            TransmissionMode::Unacknowledged => TxnState::S1(data),
        };
        let handle = self
            .arena
            .alloc(Transaction::new(core, state), QueueId::Pending)
            .ok_or(CommandError::NoFreeTransaction(self.id))?;
        self.index.insert(id, handle);
        log::debug!(
            "channel {}: queued {} -> {} as transaction {}",
            self.id,
            params.src_path,
            params.dst_path,
            id
        );
        Ok(id)
    }

    /// Start a commanded playback of every file in `src_dir`.
    #[allow(clippy::too_many_arguments)]
    pub fn start_playback(
        &mut self,
        env: &mut ChannelEnv,
        class: TransmissionMode,
        keep: bool,
        priority: u8,
        dest_eid: EntityId,
        src_dir: &str,
        dst_dir: &str,
    ) -> Result<(), CommandError> {
        let slot_idx = self
            .playbacks
            .iter()
            .position(|slot| !slot.active)
            .ok_or(CommandError::NoFreePlayback(self.id))?;
        let files = match env.vfs.list_dir(src_dir) {
            Ok(files) => files,
            Err(e) => {
                self.counters.fault.directory_read += 1;
                env.report(EventId::PlaybackDirFailed, self.id, None);
                return Err(CommandError::Filestore(e));
            }
        };
        self.playbacks[slot_idx] = PlaybackSlot {
            active: true,
            class,
            keep,
            priority,
            dest_eid,
            dst_dir: String::from(dst_dir),
            files: files.into_iter().collect(),
            in_flight: 0,
        };
        Ok(())
    }

    fn playback_mut(&mut self, playback: PlaybackRef) -> Option<&mut PlaybackSlot> {
        match playback {
            PlaybackRef::Commanded(idx) => self.playbacks.get_mut(idx),
            PlaybackRef::Poll(idx) => self.polls.get_mut(idx).map(|poll| &mut poll.playback),
        }
    }

    /// Queue files of a playback until its in-flight limit is reached.
    fn service_playback(&mut self, env: &mut ChannelEnv, playback: PlaybackRef) {
        loop {
            let Some(slot) = self.playback_mut(playback) else {
                return;
            };
            if !slot.active || slot.in_flight >= MAX_PLAYBACK_IN_FLIGHT {
                return;
            }
            let Some(src_path) = slot.files.pop_front() else {
                if slot.in_flight == 0 {
                    slot.active = false;
                }
                return;
            };
            let Some(name) = env.vfs.file_name(&src_path) else {
                continue;
            };
            let dst_path = format!("{}/{}", slot.dst_dir.trim_end_matches('/'), name);
            let params = TxParams {
                class: slot.class,
                keep: slot.keep,
                priority: slot.priority,
                dest_eid: slot.dest_eid,
                src_path: &src_path,
                dst_path: &dst_path,
                playback: Some(playback),
            };
            match self.start_tx(env, params) {
                Ok(_) => {
                    if let Some(slot) = self.playback_mut(playback) {
                        slot.in_flight += 1;
                    }
                }
                Err(e) => {
                    // Retried in the next cycle.
                    log::debug!("channel {}: playback deferred: {}", self.id, e);
                    if let Some(slot) = self.playback_mut(playback) {
                        slot.files.push_front(src_path);
                    }
                    return;
                }
            }
        }
    }

    fn service_polls(&mut self, env: &mut ChannelEnv) {
        for idx in 0..self.polls.len() {
            let poll = &mut self.polls[idx];
            if !poll.cfg.enabled {
                continue;
            }
            if poll.playback.active {
                self.service_playback(env, PlaybackRef::Poll(idx));
                continue;
            }
            poll.timer.tick();
            if !poll.timer.has_expired() {
                continue;
            }
            poll.timer.reset();
            match env.vfs.list_dir(&poll.cfg.src_dir) {
                Ok(files) if !files.is_empty() => {
                    poll.playback = PlaybackSlot {
                        active: true,
                        class: poll.cfg.class,
                        keep: false,
                        priority: poll.cfg.priority,
                        dest_eid: poll.cfg.dest_eid,
                        dst_dir: poll.cfg.dst_dir.clone(),
                        files: files.into_iter().collect(),
                        in_flight: 0,
                    };
                    env.report(EventId::PollDirStarted, self.id, None);
                    self.service_playback(env, PlaybackRef::Poll(idx));
                }
                Ok(_) => (),
                Err(e) => {
                    log::warn!("channel {}: polling {} failed: {}", self.id, poll.cfg.src_dir, e);
                    self.counters.fault.directory_read += 1;
                    env.report(EventId::PlaybackDirFailed, self.id, None);
                }
            }
        }
    }

    pub fn set_polling(&mut self, index: Option<usize>, enabled: bool) -> Result<(), CommandError> {
        match index {
            Some(idx) => {
                let poll = self
                    .polls
                    .get_mut(idx)
                    .ok_or(CommandError::InvalidPollDir(self.id, idx))?;
                poll.cfg.enabled = enabled;
            }
            None => self
                .polls
                .iter_mut()
                .for_each(|poll| poll.cfg.enabled = enabled),
        }
        Ok(())
    }

    /// Handle an inbound PDU addressed to this channel.
    pub fn dispatch(&mut self, env: &mut ChannelEnv, pdu: &LogicalPdu) {
        self.counters.recv.pdu += 1;
        let id = pdu.header.transaction_id();
        if let Some(handle) = self.index.get(&id).copied() {
            let Some(txn) = self.arena.get_mut(handle) else {
                self.index.remove(&id);
                env.report(EventId::TxnStaleHandle, self.id, Some(id));
                return;
            };
            let mut ctx = env.txn_ctx(self.id, &self.cfg, &mut self.counters);
            match txn.direction() {
                TxnDirection::Send => source::recv(txn, &mut ctx, pdu),
                TxnDirection::Receive => dest::recv(txn, &mut ctx, pdu),
            }
            self.finish_if_done(env, handle);
            return;
        }
        let local_eid = env.params.local_eid;
        if pdu.header.source_eid == local_eid {
            if let PduBody::Directive(DirectiveBody::Fin(fin)) = &pdu.body {
                self.ack_unmatched_fin(env, &pdu.header, fin.condition_code);
            } else {
                self.counters.recv.spurious += 1;
                env.report(EventId::PduSpurious, self.id, Some(id));
            }
            return;
        }
        if pdu.header.destination_eid != local_eid {
            self.counters.recv.error += 1;
            env.report(EventId::PduUnexpectedDestination, self.id, Some(id));
            return;
        }
        match &pdu.body {
            PduBody::FileData(_) | PduBody::Directive(DirectiveBody::Metadata(_)) => {
                self.start_rx(env, pdu)
            }
            _ => {
                self.counters.recv.spurious += 1;
                env.report(EventId::PduSpurious, self.id, Some(id));
            }
        }
    }

    fn start_rx(&mut self, env: &mut ChannelEnv, pdu: &LogicalPdu) {
        let id = pdu.header.transaction_id();
        if self.arena.len(QueueId::Rx) >= self.cfg.max_simultaneous_rx
            || self.arena.len(QueueId::Free) == 0
        {
            self.counters.recv.dropped += 1;
            env.report(EventId::PduRxLimitReached, self.id, Some(id));
            return;
        }
        let core = TxnCore::new(
            id,
            pdu.header.source_eid,
            TxnDirection::Receive,
            pdu.header.trans_mode,
            0,
            TickTimer::from_seconds(self.cfg.inactivity_timer_s, env.params.ticks_per_second),
        );
        let state = match pdu.header.trans_mode {
            TransmissionMode::Acknowledged => TxnState::R2(RecvData::new()),
            TransmissionMode::Unacknowledged => TxnState::R1(RecvData::new()),
        };
        let Some(handle) = self.arena.alloc(Transaction::new(core, state), QueueId::Rx) else {
            return;
        };
        self.index.insert(id, handle);
        env.report(EventId::RxStarted, self.id, Some(id));
        if let Some(txn) = self.arena.get_mut(handle) {
            let mut ctx = env.txn_ctx(self.id, &self.cfg, &mut self.counters);
            dest::recv(txn, &mut ctx, pdu);
        }
        self.finish_if_done(env, handle);
    }

    /// Acknowledge a Finished PDU of a transaction which is already gone so the peer can close
    /// out its side.
    fn ack_unmatched_fin(
        &mut self,
        env: &mut ChannelEnv,
        fin_header: &PduHeader,
        condition_code: ConditionCode,
    ) {
        let mut header = PduHeader::new(
            PduType::FileDirective,
            Direction::TowardsReceiver,
            fin_header.trans_mode,
            fin_header.source_eid,
            fin_header.destination_eid,
            fin_header.sequence_num,
        );
        header.crc_flag = self.cfg.crc_on_transmission.into();
        let mut pdu = LogicalPdu::new_directive(
            header,
            DirectiveBody::Ack(Ack {
                ack_directive: FileDirectiveType::FinishedPdu,
                ack_subtype: 1,
                condition_code,
                txn_status: TransactionStatus::Unrecognized,
            }),
        );
        let id = fin_header.transaction_id();
        let mut ctx = env.txn_ctx(self.id, &self.cfg, &mut self.counters);
        if ctx.send_pdu(&mut pdu).is_ok() {
            env.report(EventId::PduUnmatchedFinAcked, self.id, Some(id));
        }
    }

    /// One processing cycle without the inbound part: timers, playbacks, promotion of pending
    /// transactions and PDU output. A frozen channel skips all of it.
    pub fn run(&mut self, env: &mut ChannelEnv) {
        if self.frozen {
            return;
        }
        self.tick(env);
        for idx in 0..self.playbacks.len() {
            self.service_playback(env, PlaybackRef::Commanded(idx));
        }
        self.service_polls(env);
        self.promote_pending();
        self.emit(env);
    }

    fn tick(&mut self, env: &mut ChannelEnv) {
        for queue in [QueueId::TxActive, QueueId::TxWait, QueueId::Rx] {
            for handle in self.arena.handles(queue) {
                let Some(txn) = self.arena.get_mut(handle) else {
                    continue;
                };
                let mut ctx = env.txn_ctx(self.id, &self.cfg, &mut self.counters);
                match txn.direction() {
                    TxnDirection::Send => source::tick(txn, &mut ctx),
                    TxnDirection::Receive => dest::tick(txn, &mut ctx),
                }
                self.finish_if_done(env, handle);
            }
        }
    }

    /// Promote the pending transaction with the best priority once no other send transaction
    /// streams file data.
    fn promote_pending(&mut self) {
        if !self.cfg.dequeue_enabled || self.arena.len(QueueId::TxActive) > 0 {
            return;
        }
        let mut best: Option<(u8, TxnHandle)> = None;
        for handle in self.arena.handles(QueueId::Pending) {
            if let Some(txn) = self.arena.get(handle) {
                if best.map_or(true, |(priority, _)| txn.priority() < priority) {
                    best = Some((txn.priority(), handle));
                }
            }
        }
        if let Some((_, handle)) = best {
            self.arena.move_to(handle, QueueId::TxActive);
        }
    }

    /// Let the transactions send PDUs in priority order until the budget of the cycle is used
    /// up or the transport blocks.
    fn emit(&mut self, env: &mut ChannelEnv) {
        let mut candidates: Vec<(u8, TxnHandle)> = Vec::new();
        for queue in [QueueId::Rx, QueueId::TxActive, QueueId::TxWait] {
            for handle in self.arena.handles(queue) {
                if let Some(txn) = self.arena.get(handle) {
                    candidates.push((txn.priority(), handle));
                }
            }
        }
        candidates.sort_by_key(|(priority, _)| *priority);
        let budget = self.cfg.max_outgoing_messages_per_wakeup;
        let mut sent = 0;
        'candidates: for (_, handle) in candidates {
            loop {
                if budget != 0 && sent >= budget {
                    break 'candidates;
                }
                if env.sender.throttled(self.id) {
                    break 'candidates;
                }
                let Some(txn) = self.arena.get_mut(handle) else {
                    continue 'candidates;
                };
                let mut ctx = env.txn_ctx(self.id, &self.cfg, &mut self.counters);
                let progress = match txn.direction() {
                    TxnDirection::Send => source::step(txn, &mut ctx),
                    TxnDirection::Receive => dest::step(txn, &mut ctx),
                };
                let waiting = txn
                    .tx_sub_state()
                    .is_some_and(|sub_state| sub_state >= TxSubState::WaitForEofAck);
                if waiting && self.arena.queue_of(handle) == Some(QueueId::TxActive) {
                    self.arena.move_to(handle, QueueId::TxWait);
                }
                match progress {
                    Progress::Sent => sent += 1,
                    Progress::Idle => {
                        self.finish_if_done(env, handle);
                        continue 'candidates;
                    }
                    // Throttled transport, the other transactions would be blocked as well.
                    Progress::Blocked => {
                        self.finish_if_done(env, handle);
                        break 'candidates;
                    }
                }
                if self.finish_if_done(env, handle) {
                    continue 'candidates;
                }
            }
        }
    }

    fn finish_if_done(&mut self, env: &mut ChannelEnv, handle: TxnHandle) -> bool {
        if self.arena.get(handle).is_some_and(Transaction::is_done) {
            self.finish(env, handle, true);
            return true;
        }
        false
    }

    /// Release a transaction into the history. The source file of a send transaction is
    /// disposed of according to its keep flag if `dispose` is set.
    fn finish(&mut self, env: &mut ChannelEnv, handle: TxnHandle, dispose: bool) {
        let Some(txn) = self.arena.free(handle) else {
            return;
        };
        let id = txn.id();
        self.index.remove(&id);
        if self.cfg.num_history > 0 {
            if self.history.len() >= self.cfg.num_history {
                self.history.pop_front();
            }
            self.history.push_back(HistoryEntry::from_transaction(&txn));
        }
        if let Some(playback) = txn.core.playback {
            if let Some(slot) = self.playback_mut(playback) {
                slot.in_flight = slot.in_flight.saturating_sub(1);
            }
        }
        if dispose {
            if let Some(data) = txn.state().send_data() {
                self.dispose_source(env, &txn, &data.src_path);
            }
            let completed = match txn.direction() {
                TxnDirection::Send => EventId::TxCompleted,
                TxnDirection::Receive => EventId::RxCompleted,
            };
            log::info!(
                "channel {}: transaction {} finished with status {:?}",
                self.id,
                id,
                txn.status()
            );
            env.report(completed, self.id, Some(id));
        }
        env.report(EventId::TxnFreed, self.id, Some(id));
    }

    fn dispose_source(&mut self, env: &mut ChannelEnv, txn: &Transaction, src_path: &str) {
        if txn.core.keep {
            return;
        }
        let result = if !txn.status().is_error() {
            env.vfs.remove_file(src_path)
        } else if !env.fail_dir.is_empty() {
            let name = env.vfs.file_name(src_path).unwrap_or(src_path);
            let target = format!("{}/{}", env.fail_dir.trim_end_matches('/'), name);
            env.vfs.rename_file(src_path, &target)
        } else {
            return;
        };
        if let Err(e) = result {
            log::warn!("channel {}: disposing of {} failed: {}", self.id, src_path, e);
            env.report(EventId::TxSourceDisposalFailed, self.id, Some(txn.id()));
        }
    }

    /// Apply a management command to one transaction or to all transactions of the channel.
    /// Returns the number of transactions affected.
    pub fn apply(
        &mut self,
        env: &mut ChannelEnv,
        id: Option<TransactionId>,
        op: TxnOp,
    ) -> usize {
        let handles: Vec<TxnHandle> = match id {
            Some(id) => self.index.get(&id).copied().into_iter().collect(),
            None => self.index.values().copied().collect(),
        };
        let mut affected = 0;
        for handle in handles {
            let pending = self.arena.queue_of(handle) == Some(QueueId::Pending);
            let Some(txn) = self.arena.get_mut(handle) else {
                continue;
            };
            let id = txn.id();
            let event = match op {
                TxnOp::Suspend => {
                    txn.core.flags.suspended = true;
                    EventId::TxnSuspended
                }
                TxnOp::Resume => {
                    txn.core.flags.suspended = false;
                    EventId::TxnResumed
                }
                TxnOp::Cancel => {
                    if pending {
                        // Never started, nothing to close out.
                        txn.core.set_status(TxnStatus::CancelRequestReceived);
                        txn.core.complete();
                    } else {
                        // The close-out runs in the next step, which a suspended
                        // transaction would skip.
                        txn.core.flags.suspended = false;
                        txn.core.flags.cancel_requested = true;
                    }
                    EventId::TxnCancelled
                }
                TxnOp::Abandon => {
                    txn.core.set_status(TxnStatus::CancelRequestReceived);
                    EventId::TxnAbandoned
                }
            };
            env.report(event, self.id, Some(id));
            if op == TxnOp::Abandon {
                self.finish(env, handle, false);
            } else {
                self.finish_if_done(env, handle);
            }
            affected += 1;
        }
        affected
    }

    pub fn purge(&mut self, env: &mut ChannelEnv, queue: QueueSelector) {
        if matches!(queue, QueueSelector::Pending | QueueSelector::Both) {
            for handle in self.arena.handles(QueueId::Pending) {
                if let Some(txn) = self.arena.free(handle) {
                    self.index.remove(&txn.id());
                    if let Some(playback) = txn.core.playback {
                        if let Some(slot) = self.playback_mut(playback) {
                            slot.in_flight = slot.in_flight.saturating_sub(1);
                        }
                    }
                    env.report(EventId::TxnFreed, self.id, Some(txn.id()));
                }
            }
        }
        if matches!(queue, QueueSelector::History | QueueSelector::Both) {
            self.history.clear();
        }
    }

    /// Abandon every transaction and stop all playbacks.
    pub fn clear(&mut self, env: &mut ChannelEnv) {
        self.apply(env, None, TxnOp::Abandon);
        for slot in self.playbacks.iter_mut() {
            *slot = PlaybackSlot::idle();
        }
        for poll in self.polls.iter_mut() {
            poll.playback = PlaybackSlot::idle();
        }
    }
}
