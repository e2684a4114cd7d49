//! # Engine Module
//!
//! The [Engine] is the top-level driver. It owns every [Channel], the sequence number generator
//! of the local entity and the staging buffers shared by all channels. It is driven by calling
//! [Engine::cycle] once per wakeup, which
//!
//! 1. drains up to `rx_max_messages_per_wakeup` inbound PDUs per channel from the
//!    [PduReceiver] and dispatches them to their transactions,
//! 2. services the timers, playbacks and polling directories of every channel that is not
//!    frozen,
//! 3. lets the transactions of every channel send their PDUs in priority order.
//!
//! All management commands are methods of the engine. A rejected command returns a
//! [CommandError], increments the rejected command counter and emits
//! [EventId::CommandRejected]. Failures of individual transactions are never returned: they
//! are reported as events and recorded in the history of the channel.
use alloc::vec::Vec;

use crate::{
    channel::{Channel, ChannelEnv, QueueId, TxParams, TxnOp},
    codec::decode_pdu,
    config::{ConfigError, EngineConfig, CRC_CALC_BLOCK_SIZE},
    event::{
        ChannelCounters, CommandCounters, EventHook, EventId, EventReporter, NullEventHook,
    },
    field::HDR_LARGE_FILE,
    filestore::{FilestoreError, VirtualFilestore},
    request::{
        ChannelSelector, ParamKey, PollDirSelector, PlaybackRequest, QueueSelector,
        TransactionSelector, TxFileRequest,
    },
    transaction::{EngineParams, HistoryEntry, Transaction},
    PduReceiver, PduSender, TransactionId, TransactionSeq,
};

/// Errors which prevent the engine from starting.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("maximum PDU size {0} is too small")]
    PduSizeTooSmall(usize),
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CommandError {
    #[error("engine is disabled")]
    EngineDisabled,
    #[error("engine is already enabled")]
    AlreadyEnabled,
    #[error("invalid channel {0}")]
    InvalidChannel(u8),
    #[error("unknown transaction {0}")]
    UnknownTransaction(TransactionId),
    #[error("no free transaction on channel {0}")]
    NoFreeTransaction(u8),
    #[error("no free playback slot on channel {0}")]
    NoFreePlayback(u8),
    #[error("invalid polling directory {1} on channel {0}")]
    InvalidPollDir(u8, usize),
    #[error("invalid value {1} for parameter {0:?}")]
    InvalidParam(ParamKey, u64),
    #[error("filestore error: {0}")]
    Filestore(#[from] FilestoreError),
    #[error("engine not restarted: {0}")]
    InvalidConfig(#[from] EngineError),
}

/// Smallest PDU size which still fits every directive with minimal field widths.
pub const MIN_PDU_SIZE: usize = 64;

pub struct Engine<Sender: PduSender, Vfs: VirtualFilestore, Hook: EventHook = NullEventHook> {
    cfg: EngineConfig,
    enabled: bool,
    channels: Vec<Channel>,
    seq_num: TransactionSeq,
    sender: Sender,
    vfs: Vfs,
    hook: Hook,
    in_buf: Vec<u8>,
    out_buf: Vec<u8>,
    io_buf: Vec<u8>,
    cmd_counters: CommandCounters,
}

impl<Sender: PduSender, Vfs: VirtualFilestore, Hook: EventHook> Engine<Sender, Vfs, Hook> {
    /// Create and enable an engine. The configuration is validated before anything else
    /// happens.
    pub fn new(cfg: EngineConfig, sender: Sender, vfs: Vfs, hook: Hook) -> Result<Self, EngineError> {
        Self::check_config(&cfg)?;
        let mut engine = Self {
            channels: Vec::new(),
            enabled: false,
            seq_num: 0,
            sender,
            vfs,
            hook,
            in_buf: alloc::vec![0; cfg.max_pdu_size],
            out_buf: alloc::vec![0; cfg.max_pdu_size],
            io_buf: alloc::vec![0; cfg.max_pdu_size],
            cmd_counters: CommandCounters::default(),
            cfg,
        };
        engine.start();
        Ok(engine)
    }

    fn check_config(cfg: &EngineConfig) -> Result<(), EngineError> {
        cfg.validate()?;
        if cfg.max_pdu_size < MIN_PDU_SIZE {
            return Err(EngineError::PduSizeTooSmall(cfg.max_pdu_size));
        }
        Ok(())
    }

    fn start(&mut self) {
        self.channels = self
            .cfg
            .channels
            .iter()
            .enumerate()
            .map(|(idx, cfg)| Channel::new(idx as u8, cfg.clone(), self.cfg.ticks_per_second))
            .collect();
        let size = self.cfg.max_pdu_size;
        self.in_buf.resize(size, 0);
        self.out_buf.resize(size, 0);
        self.io_buf.resize(size, 0);
        self.enabled = true;
        self.report(EventId::EngineEnabled, None);
    }

    fn params(&self) -> EngineParams {
        EngineParams {
            local_eid: self.cfg.local_eid,
            ticks_per_second: self.cfg.ticks_per_second,
            rx_crc_calc_bytes_per_wakeup: self.cfg.rx_crc_calc_bytes_per_wakeup,
            max_pdu_size: self.cfg.max_pdu_size,
        }
    }

    /// Borrow the channels, the inbound buffer and the processing environment at the same
    /// time.
    fn split(&mut self) -> (&mut [Channel], &mut [u8], ChannelEnv<'_>) {
        let params = self.params();
        let env = ChannelEnv {
            vfs: &self.vfs,
            sender: &self.sender,
            hook: &mut self.hook,
            params,
            tmp_dir: &self.cfg.tmp_dir,
            fail_dir: &self.cfg.fail_dir,
            seq_num: &mut self.seq_num,
            out_buf: &mut self.out_buf,
            io_buf: &mut self.io_buf,
        };
        (&mut self.channels, &mut self.in_buf, env)
    }

    fn report(&mut self, id: EventId, channel: Option<u8>) {
        EventReporter::new(&mut self.hook).report(id, channel, None);
    }

    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[inline]
    pub fn sender(&self) -> &Sender {
        &self.sender
    }

    #[inline]
    pub fn vfs(&self) -> &Vfs {
        &self.vfs
    }

    #[inline]
    pub fn hook(&self) -> &Hook {
        &self.hook
    }

    #[inline]
    pub fn hook_mut(&mut self) -> &mut Hook {
        &mut self.hook
    }

    /// Last sequence number assigned to a locally started transaction.
    #[inline]
    pub fn seq_num(&self) -> TransactionSeq {
        self.seq_num
    }

    #[inline]
    pub fn command_counters(&self) -> CommandCounters {
        self.cmd_counters
    }

    pub fn channel(&self, channel: u8) -> Option<&Channel> {
        self.channels.get(channel as usize)
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn counters(&self, channel: u8) -> Option<&ChannelCounters> {
        self.channel(channel).map(Channel::counters)
    }

    /// Completed transactions of a channel, oldest first.
    pub fn history(&self, channel: u8) -> impl Iterator<Item = &HistoryEntry> {
        self.channel(channel)
            .into_iter()
            .flat_map(|channel| channel.history().iter())
    }

    /// Look up a live transaction on any channel.
    pub fn transaction(&self, id: &TransactionId) -> Option<&Transaction> {
        self.channels
            .iter()
            .find_map(|channel| channel.transaction(id))
    }

    /// Handle one inbound PDU for `channel`. Malformed PDUs are dropped with a diagnostic.
    pub fn receive_pdu(&mut self, channel: u8, raw: &[u8]) {
        if !self.enabled {
            return;
        }
        let (channels, _, mut env) = self.split();
        if let Some(channel) = channels.get_mut(channel as usize) {
            dispatch_raw(channel, &mut env, raw);
        }
    }

    /// One processing cycle of the engine.
    pub fn cycle(&mut self, receiver: &mut impl PduReceiver) {
        if !self.enabled {
            return;
        }
        let (channels, in_buf, mut env) = self.split();
        for channel in channels.iter_mut() {
            let limit = channel.config().rx_max_messages_per_wakeup;
            let mut received = 0;
            // Inbound PDUs are consumed even while the channel is frozen.
            while limit == 0 || received < limit {
                let Some(len) = receiver.try_recv_pdu(channel.id(), in_buf) else {
                    break;
                };
                received += 1;
                if len > in_buf.len() {
                    channel.count_decode_error();
                    env.report(EventId::PduTooLarge, channel.id(), None);
                    continue;
                }
                dispatch_raw(channel, &mut env, &in_buf[..len]);
            }
            channel.run(&mut env);
        }
    }

    fn finish_command<T>(&mut self, result: Result<T, CommandError>) -> Result<T, CommandError> {
        match &result {
            Ok(_) => self.cmd_counters.accepted += 1,
            Err(e) => {
                log::warn!("command rejected: {}", e);
                self.cmd_counters.rejected += 1;
                self.report(EventId::CommandRejected, None);
            }
        }
        result
    }

    fn ensure_enabled(&self) -> Result<(), CommandError> {
        if !self.enabled {
            return Err(CommandError::EngineDisabled);
        }
        Ok(())
    }

    fn channel_index(&self, channel: u8) -> Result<usize, CommandError> {
        if (channel as usize) < self.channels.len() {
            return Ok(channel as usize);
        }
        Err(CommandError::InvalidChannel(channel))
    }

    fn selected_channels(&self, selector: ChannelSelector) -> Result<core::ops::Range<usize>, CommandError> {
        match selector {
            ChannelSelector::Channel(channel) => {
                let idx = self.channel_index(channel)?;
                Ok(idx..idx + 1)
            }
            ChannelSelector::All => Ok(0..self.channels.len()),
        }
    }

    /// Queue a file for sending. Returns the identifier of the new transaction.
    pub fn tx_file(&mut self, request: &TxFileRequest) -> Result<TransactionId, CommandError> {
        let result = self.tx_file_inner(request);
        self.finish_command(result)
    }

    fn tx_file_inner(&mut self, request: &TxFileRequest) -> Result<TransactionId, CommandError> {
        self.ensure_enabled()?;
        let idx = self.channel_index(request.channel)?;
        let (channels, _, mut env) = self.split();
        channels[idx].start_tx(
            &mut env,
            TxParams {
                class: request.class,
                keep: request.keep,
                priority: request.priority,
                dest_eid: request.dest_eid,
                src_path: request.src_path(),
                dst_path: request.dst_path(),
                playback: None,
            },
        )
    }

    /// Send every file of a directory.
    pub fn playback_dir(&mut self, request: &PlaybackRequest) -> Result<(), CommandError> {
        let result = self.playback_dir_inner(request);
        self.finish_command(result)
    }

    fn playback_dir_inner(&mut self, request: &PlaybackRequest) -> Result<(), CommandError> {
        self.ensure_enabled()?;
        let idx = self.channel_index(request.channel)?;
        let (channels, _, mut env) = self.split();
        channels[idx].start_playback(
            &mut env,
            request.class,
            request.keep,
            request.priority,
            request.dest_eid,
            request.src_dir(),
            request.dst_dir(),
        )
    }

    pub fn freeze(&mut self, selector: ChannelSelector) -> Result<(), CommandError> {
        let result = self.set_frozen(selector, true);
        self.finish_command(result)
    }

    pub fn thaw(&mut self, selector: ChannelSelector) -> Result<(), CommandError> {
        let result = self.set_frozen(selector, false);
        self.finish_command(result)
    }

    fn set_frozen(&mut self, selector: ChannelSelector, frozen: bool) -> Result<(), CommandError> {
        self.ensure_enabled()?;
        for idx in self.selected_channels(selector)? {
            self.channels[idx].set_frozen(frozen);
        }
        Ok(())
    }

    pub fn enable_dequeue(&mut self, selector: ChannelSelector) -> Result<(), CommandError> {
        let result = self.set_dequeue(selector, true);
        self.finish_command(result)
    }

    pub fn disable_dequeue(&mut self, selector: ChannelSelector) -> Result<(), CommandError> {
        let result = self.set_dequeue(selector, false);
        self.finish_command(result)
    }

    fn set_dequeue(&mut self, selector: ChannelSelector, enabled: bool) -> Result<(), CommandError> {
        self.ensure_enabled()?;
        for idx in self.selected_channels(selector)? {
            self.channels[idx].config_mut().dequeue_enabled = enabled;
        }
        Ok(())
    }

    pub fn enable_polling(&mut self, channel: u8, dirs: PollDirSelector) -> Result<(), CommandError> {
        let result = self.set_polling(channel, dirs, true);
        self.finish_command(result)
    }

    pub fn disable_polling(&mut self, channel: u8, dirs: PollDirSelector) -> Result<(), CommandError> {
        let result = self.set_polling(channel, dirs, false);
        self.finish_command(result)
    }

    fn set_polling(
        &mut self,
        channel: u8,
        dirs: PollDirSelector,
        enabled: bool,
    ) -> Result<(), CommandError> {
        self.ensure_enabled()?;
        let idx = self.channel_index(channel)?;
        let index = match dirs {
            PollDirSelector::Index(index) => Some(index),
            PollDirSelector::All => None,
        };
        self.channels[idx].set_polling(index, enabled)
    }

    /// Suspend timers and PDU output of the selected transactions. Returns the number of
    /// transactions affected.
    pub fn suspend(&mut self, selector: TransactionSelector) -> Result<usize, CommandError> {
        let result = self.apply(selector, TxnOp::Suspend);
        self.finish_command(result)
    }

    pub fn resume(&mut self, selector: TransactionSelector) -> Result<usize, CommandError> {
        let result = self.apply(selector, TxnOp::Resume);
        self.finish_command(result)
    }

    /// Close out the selected transactions with the cancel condition code.
    pub fn cancel(&mut self, selector: TransactionSelector) -> Result<usize, CommandError> {
        let result = self.apply(selector, TxnOp::Cancel);
        self.finish_command(result)
    }

    /// Free the selected transactions immediately without any protocol close-out.
    pub fn abandon(&mut self, selector: TransactionSelector) -> Result<usize, CommandError> {
        let result = self.apply(selector, TxnOp::Abandon);
        self.finish_command(result)
    }

    fn apply(&mut self, selector: TransactionSelector, op: TxnOp) -> Result<usize, CommandError> {
        self.ensure_enabled()?;
        if let TransactionSelector::Channel(channel) = selector {
            self.channel_index(channel)?;
        }
        let (channels, _, mut env) = self.split();
        match selector {
            TransactionSelector::Id(id) => {
                let channel = channels
                    .iter_mut()
                    .find(|channel| channel.contains(&id))
                    .ok_or(CommandError::UnknownTransaction(id))?;
                Ok(channel.apply(&mut env, Some(id), op))
            }
            TransactionSelector::Channel(channel) => {
                Ok(channels[channel as usize].apply(&mut env, None, op))
            }
            TransactionSelector::All => Ok(channels
                .iter_mut()
                .map(|channel| channel.apply(&mut env, None, op))
                .sum()),
        }
    }

    pub fn purge_queue(&mut self, channel: u8, queue: QueueSelector) -> Result<(), CommandError> {
        let result = self.purge_queue_inner(channel, queue);
        self.finish_command(result)
    }

    fn purge_queue_inner(&mut self, channel: u8, queue: QueueSelector) -> Result<(), CommandError> {
        self.ensure_enabled()?;
        let idx = self.channel_index(channel)?;
        let (channels, _, mut env) = self.split();
        channels[idx].purge(&mut env, queue);
        Ok(())
    }

    /// Change a run-time parameter. Engine wide parameters ignore `channel`.
    pub fn set_param(&mut self, key: ParamKey, channel: u8, value: u64) -> Result<(), CommandError> {
        let result = self.set_param_inner(key, channel, value);
        self.finish_command(result)
    }

    fn set_param_inner(&mut self, key: ParamKey, channel: u8, value: u64) -> Result<(), CommandError> {
        self.ensure_enabled()?;
        let invalid = CommandError::InvalidParam(key, value);
        let as_u32 = u32::try_from(value).map_err(|_| CommandError::InvalidParam(key, value));
        if key.is_engine_wide() {
            match key {
                ParamKey::TicksPerSecond => {
                    let ticks = as_u32?;
                    if ticks == 0 {
                        return Err(invalid);
                    }
                    self.cfg.ticks_per_second = ticks;
                }
                ParamKey::RxCrcCalcBytesPerWakeup => {
                    let bytes = as_u32?;
                    if bytes == 0 || bytes % CRC_CALC_BLOCK_SIZE != 0 {
                        return Err(invalid);
                    }
                    self.cfg.rx_crc_calc_bytes_per_wakeup = bytes;
                }
                ParamKey::LocalEid => self.cfg.local_eid = value,
                _ => return Err(invalid),
            }
            return Ok(());
        }
        let idx = self.channel_index(channel)?;
        let max_pdu_size = self.cfg.max_pdu_size;
        let cfg = self.channels[idx].config_mut();
        match key {
            ParamKey::AckTimerSeconds => cfg.ack_timer_s = as_u32?,
            ParamKey::NakTimerSeconds => cfg.nak_timer_s = as_u32?,
            ParamKey::InactivityTimerSeconds => cfg.inactivity_timer_s = as_u32?,
            ParamKey::AckLimit | ParamKey::NakLimit => {
                let limit = u8::try_from(value).map_err(|_| CommandError::InvalidParam(key, value))?;
                if limit == 0 {
                    return Err(invalid);
                }
                if key == ParamKey::AckLimit {
                    cfg.ack_limit = limit;
                } else {
                    cfg.nak_limit = limit;
                }
            }
            ParamKey::OutgoingFileChunkSize => {
                let Ok(size) = usize::try_from(value) else {
                    return Err(invalid);
                };
                if size == 0 || size > max_pdu_size {
                    return Err(invalid);
                }
                cfg.outgoing_file_chunk_size = size;
            }
            ParamKey::MaxOutgoingMessagesPerWakeup => {
                cfg.max_outgoing_messages_per_wakeup = as_u32?
            }
            _ => return Err(invalid),
        }
        Ok(())
    }

    pub fn get_param(&mut self, key: ParamKey, channel: u8) -> Result<u64, CommandError> {
        let result = self.get_param_inner(key, channel);
        self.finish_command(result)
    }

    fn get_param_inner(&self, key: ParamKey, channel: u8) -> Result<u64, CommandError> {
        self.ensure_enabled()?;
        match key {
            ParamKey::TicksPerSecond => return Ok(self.cfg.ticks_per_second as u64),
            ParamKey::RxCrcCalcBytesPerWakeup => {
                return Ok(self.cfg.rx_crc_calc_bytes_per_wakeup as u64)
            }
            ParamKey::LocalEid => return Ok(self.cfg.local_eid),
            _ => (),
        }
        let cfg = self.channels[self.channel_index(channel)?].config();
        Ok(match key {
            ParamKey::AckTimerSeconds => cfg.ack_timer_s as u64,
            ParamKey::NakTimerSeconds => cfg.nak_timer_s as u64,
            ParamKey::InactivityTimerSeconds => cfg.inactivity_timer_s as u64,
            ParamKey::AckLimit => cfg.ack_limit as u64,
            ParamKey::NakLimit => cfg.nak_limit as u64,
            ParamKey::OutgoingFileChunkSize => cfg.outgoing_file_chunk_size as u64,
            ParamKey::MaxOutgoingMessagesPerWakeup => cfg.max_outgoing_messages_per_wakeup as u64,
            _ => return Err(CommandError::InvalidParam(key, 0)),
        })
    }

    /// Abandon every transaction and stop all processing until [Self::enable] is called.
    pub fn disable(&mut self) -> Result<(), CommandError> {
        let result = self.disable_inner();
        self.finish_command(result)
    }

    fn disable_inner(&mut self) -> Result<(), CommandError> {
        self.ensure_enabled()?;
        let (channels, _, mut env) = self.split();
        for channel in channels.iter_mut() {
            channel.clear(&mut env);
        }
        self.channels.clear();
        self.enabled = false;
        self.report(EventId::EngineDisabled, None);
        Ok(())
    }

    /// Re-enable a disabled engine with a freshly read configuration.
    pub fn enable(&mut self, cfg: EngineConfig) -> Result<(), CommandError> {
        let result = self.enable_inner(cfg);
        self.finish_command(result)
    }

    fn enable_inner(&mut self, cfg: EngineConfig) -> Result<(), CommandError> {
        if self.enabled {
            return Err(CommandError::AlreadyEnabled);
        }
        Self::check_config(&cfg)?;
        self.cfg = cfg;
        self.start();
        Ok(())
    }

    /// Number of transactions in a queue of a channel.
    pub fn queue_len(&self, channel: u8, queue: QueueId) -> usize {
        self.channel(channel).map_or(0, |channel| channel.queue_len(queue))
    }
}

/// Decode a raw PDU and hand it to the channel.
fn dispatch_raw(channel: &mut Channel, env: &mut ChannelEnv, raw: &[u8]) {
    match decode_pdu(raw) {
        Some(pdu) => channel.dispatch(env, &pdu),
        None => {
            let id = if raw.first().is_some_and(|flags| HDR_LARGE_FILE.get_flag(*flags)) {
                EventId::PduLargeFileUnsupported
            } else {
                EventId::PduDecodeFailed
            };
            channel.count_decode_error();
            env.report(id, channel.id(), None);
        }
    }
}
