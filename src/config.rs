//! Engine and channel configuration.
//!
//! The configuration is read when the engine is constructed and again when a disabled engine is
//! re-enabled. A subset of the values can be changed at run-time with
//! [crate::engine::Engine::set_param].
//!
//! ## Notes on Positive Acknowledgment Procedures
//!
//! A class 2 sender starts the ACK timer (`ack_timer_s`) after sending the EOF PDU. Each expiry
//! without the expected ACK increments a counter and re-sends the EOF. Once the counter reaches
//! `ack_limit`, the transaction fails. A class 2 receiver applies the same procedure to its FIN
//! PDU.
//!
//! ## Notes on NAK Procedures
//!
//! After a class 2 receiver got the EOF PDU, it sends a NAK listing every missing range and
//! starts the NAK timer (`nak_timer_s`). Each expiry with data still missing re-sends the NAK,
//! up to `nak_limit` retries before the transaction fails.
use alloc::string::String;
use alloc::vec::Vec;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{
    pdu::{ChecksumType, TransmissionMode},
    EntityId,
};

pub const DEFAULT_TICKS_PER_SECOND: u32 = 10;
pub const DEFAULT_RX_CRC_CALC_BYTES_PER_WAKEUP: u32 = 16384;
pub const DEFAULT_MAX_PDU_SIZE: usize = 512;
pub const DEFAULT_CHUNK_SIZE: usize = 480;
/// Checksum work is done in blocks of this size, so the per-wakeup budget must be a multiple.
pub const CRC_CALC_BLOCK_SIZE: u32 = 1024;
pub const MAX_CHANNELS: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[non_exhaustive]
pub enum ConfigError {
    #[error("ticks per second must not be zero")]
    ZeroTicksPerSecond,
    #[error("checksum bytes per wakeup {0} is not a non-zero multiple of 1024")]
    MisalignedCrcBytesPerWakeup(u32),
    #[error("chunk size {chunk_size} of channel {channel} exceeds the maximum PDU size {max_pdu_size}")]
    ChunkSizeTooLarge {
        channel: usize,
        chunk_size: usize,
        max_pdu_size: usize,
    },
    #[error("invalid number of channels {0}")]
    InvalidChannelCount(usize),
    #[error("channel {0} has no transaction slots")]
    NoTransactions(usize),
    #[error("channel {0} has an ACK or NAK limit of zero")]
    ZeroRetryLimit(usize),
    #[error("channel {0} has a zero chunk size")]
    ZeroChunkSize(usize),
    #[error("temporary file directory must not be empty")]
    EmptyTmpDir,
}

/// Polling directory definition. Files in `src_dir` are sent to `dst_dir` every `interval_s`
/// seconds while the slot is idle.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PollDirConfig {
    pub enabled: bool,
    pub interval_s: u32,
    pub priority: u8,
    pub class: TransmissionMode,
    pub dest_eid: EntityId,
    pub src_dir: String,
    pub dst_dir: String,
}

/// Per-channel configuration.
///
/// * `max_outgoing_messages_per_wakeup` - Bound of PDUs sent per cycle. 0 means unlimited.
/// * `rx_max_messages_per_wakeup` - Bound of inbound PDUs consumed per cycle.
/// * `max_simultaneous_rx` - New receive transactions are refused once this many are active.
/// * `num_transactions` - Size of the transaction arena of the channel.
/// * `num_history` - Size of the history ring of the channel.
/// * `crc_on_transmission` - Append the CRC-16 trailer to every PDU sent on the channel.
/// * `dequeue_enabled` - Whether pending transactions are promoted to active.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChannelConfig {
    pub max_outgoing_messages_per_wakeup: u32,
    pub rx_max_messages_per_wakeup: u32,
    pub ack_timer_s: u32,
    pub nak_timer_s: u32,
    pub inactivity_timer_s: u32,
    pub ack_limit: u8,
    pub nak_limit: u8,
    pub outgoing_file_chunk_size: usize,
    pub max_simultaneous_rx: usize,
    pub num_transactions: usize,
    pub num_history: usize,
    pub checksum_type: ChecksumType,
    pub crc_on_transmission: bool,
    pub dequeue_enabled: bool,
    pub poll_dirs: Vec<PollDirConfig>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_outgoing_messages_per_wakeup: 0,
            rx_max_messages_per_wakeup: 32,
            ack_timer_s: 10,
            nak_timer_s: 10,
            inactivity_timer_s: 30,
            ack_limit: 4,
            nak_limit: 4,
            outgoing_file_chunk_size: DEFAULT_CHUNK_SIZE,
            max_simultaneous_rx: 5,
            num_transactions: 16,
            num_history: 16,
            checksum_type: ChecksumType::Modular,
            crc_on_transmission: false,
            dequeue_enabled: true,
            poll_dirs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EngineConfig {
    pub local_eid: EntityId,
    pub ticks_per_second: u32,
    pub rx_crc_calc_bytes_per_wakeup: u32,
    pub max_pdu_size: usize,
    /// Directory for files received before their Metadata PDU.
    pub tmp_dir: String,
    /// Directory failed outgoing files are moved to. Empty to disable.
    pub fail_dir: String,
    pub channels: Vec<ChannelConfig>,
}

impl EngineConfig {
    pub fn new_with_default_values(local_eid: EntityId, tmp_dir: &str) -> Self {
        Self {
            local_eid,
            ticks_per_second: DEFAULT_TICKS_PER_SECOND,
            rx_crc_calc_bytes_per_wakeup: DEFAULT_RX_CRC_CALC_BYTES_PER_WAKEUP,
            max_pdu_size: DEFAULT_MAX_PDU_SIZE,
            tmp_dir: String::from(tmp_dir),
            fail_dir: String::new(),
            channels: alloc::vec![ChannelConfig::default()],
        }
    }

    /// Check the configuration before any channel runs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ticks_per_second == 0 {
            return Err(ConfigError::ZeroTicksPerSecond);
        }
        if self.tmp_dir.is_empty() {
            return Err(ConfigError::EmptyTmpDir);
        }
        if self.rx_crc_calc_bytes_per_wakeup == 0
            || self.rx_crc_calc_bytes_per_wakeup % CRC_CALC_BLOCK_SIZE != 0
        {
            return Err(ConfigError::MisalignedCrcBytesPerWakeup(
                self.rx_crc_calc_bytes_per_wakeup,
            ));
        }
        if self.channels.is_empty() || self.channels.len() > MAX_CHANNELS {
            return Err(ConfigError::InvalidChannelCount(self.channels.len()));
        }
        for (idx, channel) in self.channels.iter().enumerate() {
            channel.validate(idx, self.max_pdu_size)?;
        }
        Ok(())
    }
}

impl ChannelConfig {
    pub fn validate(&self, channel: usize, max_pdu_size: usize) -> Result<(), ConfigError> {
        if self.outgoing_file_chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize(channel));
        }
        if self.outgoing_file_chunk_size > max_pdu_size {
            return Err(ConfigError::ChunkSizeTooLarge {
                channel,
                chunk_size: self.outgoing_file_chunk_size,
                max_pdu_size,
            });
        }
        if self.num_transactions == 0 {
            return Err(ConfigError::NoTransactions(channel));
        }
        if self.ack_limit == 0 || self.nak_limit == 0 {
            return Err(ConfigError::ZeroRetryLimit(channel));
        }
        Ok(())
    }
}
