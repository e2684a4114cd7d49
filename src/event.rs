//! Diagnostic events and counters.
//!
//! Every failure and every notable step of the engine is surfaced as a discrete [EventId]. The
//! [EventReporter] logs each event through the [log] facade at the level implied by its
//! [EventSeverity] and forwards it to the user supplied [EventHook]. This is the only status
//! channel of the engine: transaction level failures are never returned as errors.
use core::fmt::Display;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::TransactionId;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum EventSeverity {
    Debug,
    Info,
    Error,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[non_exhaustive]
pub enum EventId {
    EngineEnabled,
    EngineDisabled,
    CommandRejected,

    // Inbound PDU handling.
    PduDecodeFailed,
    PduTooLarge,
    PduLargeFileUnsupported,
    PduUnexpectedDestination,
    PduRxLimitReached,
    PduSpurious,
    PduIgnoredDirective,
    PduUnmatchedFinAcked,
    PduSendFailed,

    // Sending side.
    TxStarted,
    TxFileOpenFailed,
    TxFileReadFailed,
    TxInvalidNakSegment,
    TxMetadataResent,
    TxAckLimitNoEof,
    TxEarlyFin,
    TxInactivity,
    TxCompleted,
    TxSourceDisposalFailed,

    // Receiving side.
    RxStarted,
    RxTempFileUsed,
    RxFileCreateFailed,
    RxFileWriteFailed,
    RxFileRenameFailed,
    RxFileReadFailed,
    RxMetadataSizeMismatch,
    RxEofSizeMismatch,
    RxChecksumMismatch,
    RxUnsupportedChecksum,
    RxNakLimit,
    RxAckLimitNoFin,
    RxInactivity,
    RxMissingMetadata,
    RxCompleted,

    // Transaction management.
    TxnSuspended,
    TxnResumed,
    TxnCancelled,
    TxnAbandoned,
    TxnDropped,
    TxnFreed,
    TxnStaleHandle,

    // Directory playback and polling.
    PlaybackDirFailed,
    PollDirStarted,
}

impl EventId {
    pub fn severity(&self) -> EventSeverity {
        match self {
            EventId::CommandRejected
            | EventId::PduDecodeFailed
            | EventId::PduTooLarge
            | EventId::PduLargeFileUnsupported
            | EventId::PduUnexpectedDestination
            | EventId::PduRxLimitReached
            | EventId::PduSendFailed
            | EventId::TxFileOpenFailed
            | EventId::TxFileReadFailed
            | EventId::TxInvalidNakSegment
            | EventId::TxAckLimitNoEof
            | EventId::TxEarlyFin
            | EventId::TxInactivity
            | EventId::TxSourceDisposalFailed
            | EventId::RxFileCreateFailed
            | EventId::RxFileWriteFailed
            | EventId::RxFileRenameFailed
            | EventId::RxFileReadFailed
            | EventId::RxMetadataSizeMismatch
            | EventId::RxEofSizeMismatch
            | EventId::RxChecksumMismatch
            | EventId::RxUnsupportedChecksum
            | EventId::RxNakLimit
            | EventId::RxAckLimitNoFin
            | EventId::RxInactivity
            | EventId::RxMissingMetadata
            | EventId::TxnStaleHandle
            | EventId::PlaybackDirFailed => EventSeverity::Error,
            EventId::PduSpurious
            | EventId::PduIgnoredDirective
            | EventId::TxMetadataResent
            | EventId::TxnFreed => EventSeverity::Debug,
            _ => EventSeverity::Info,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Event {
    pub id: EventId,
    pub severity: EventSeverity,
    pub channel: Option<u8>,
    pub transaction: Option<TransactionId>,
}

impl Event {
    pub fn new(id: EventId, channel: Option<u8>, transaction: Option<TransactionId>) -> Self {
        Self {
            id,
            severity: id.severity(),
            channel,
            transaction,
        }
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}", self.id)?;
        if let Some(channel) = self.channel {
            write!(f, " channel={}", channel)?;
        }
        if let Some(id) = self.transaction {
            write!(f, " transaction={}", id)?;
        }
        Ok(())
    }
}

/// User callback for diagnostic events, for example to generate telemetry.
pub trait EventHook {
    fn on_event(&mut self, event: &Event);
}

/// Hook which ignores all events. They are still logged.
#[derive(Default, Debug, PartialEq, Eq, Copy, Clone)]
pub struct NullEventHook {}

impl EventHook for NullEventHook {
    fn on_event(&mut self, _event: &Event) {}
}

/// Short-lived wrapper around the user hook which is passed down into the channel and
/// transaction processing.
pub struct EventReporter<'hook> {
    hook: &'hook mut dyn EventHook,
}

impl<'hook> EventReporter<'hook> {
    pub fn new(hook: &'hook mut dyn EventHook) -> Self {
        Self { hook }
    }

    pub fn report(&mut self, id: EventId, channel: Option<u8>, transaction: Option<TransactionId>) {
        let event = Event::new(id, channel, transaction);
        match event.severity {
            EventSeverity::Error => log::error!("{}", event),
            EventSeverity::Info => log::info!("{}", event),
            EventSeverity::Debug => log::debug!("{}", event),
        }
        self.hook.on_event(&event);
    }

    #[inline]
    pub fn report_txn(&mut self, id: EventId, channel: u8, transaction: TransactionId) {
        self.report(id, Some(channel), Some(transaction));
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RecvCounters {
    pub pdu: u32,
    pub file_data_bytes: u64,
    pub error: u32,
    pub spurious: u32,
    pub dropped: u32,
    pub nak_segment_requests: u32,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SentCounters {
    pub pdu: u32,
    pub file_data_bytes: u64,
    pub nak_segment_requests: u32,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FaultCounters {
    pub file_open: u32,
    pub file_read: u32,
    pub file_write: u32,
    pub file_seek: u32,
    pub file_rename: u32,
    pub directory_read: u32,
    pub crc_mismatch: u32,
    pub file_size_mismatch: u32,
    pub nak_limit: u32,
    pub ack_limit: u32,
    pub inactivity_timer: u32,
    pub spurious: u32,
}

/// Per-channel statistics.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChannelCounters {
    pub recv: RecvCounters,
    pub sent: SentCounters,
    pub fault: FaultCounters,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CommandCounters {
    pub accepted: u32,
    pub rejected: u32,
}
