//! This crate contains a multi-channel engine for the CCSDS File Delivery Protocol (CFDP) as
//! specified in CCSDS 727.0-B-5.
//!
//! A file is transferred as a stream of protocol data units (PDU) within one transaction.
//! Class 1 transactions are unacknowledged and suited for simplex links. Class 2 transactions
//! detect lost file data, request it again with NAK PDUs and positively acknowledge the EOF and
//! Finished PDUs.
//!
//! The engine is designed for on-board software. It has no notion of wall clock time or
//! threads: the user calls [engine::Engine::cycle] periodically and every timer of the protocol
//! is a countdown of those cycles. All memory is allocated when the engine is constructed or
//! re-enabled. After that, the engine runs on fixed size transaction arenas and three shared
//! PDU buffers.
//!
//! # Structure
//!
//! * [engine] owns all channels and accepts the management commands of the [request] module.
//! * [channel] holds the transactions of one transfer path, their queues and their history.
//! * [source] and [dest] contain the sending and receiving state machines, which operate on the
//!   [transaction::Transaction] records.
//! * [codec] converts between the wire format and the [pdu] records. It is built from the
//!   single-byte primitives of [field].
//! * [chunk] tracks received and requested byte ranges.
//! * [filestore] abstracts file system access, [checksum] the CFDP file checksums.
//! * [event] carries diagnostics. Every failure is reported as an [event::EventId] through the
//!   [log] facade and to a user [event::EventHook].
//!
//! # Transport
//!
//! The engine is decoupled from the transport of the PDUs by the [PduSender] and [PduReceiver]
//! traits. Implementations for [std::sync::mpsc] channels are provided. The
//! [loopback demo](https://docs.rs/crate/cfdp-engine/latest/source/demos/loopback.rs) connects
//! two engines with them.
#![no_std]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#[cfg(feature = "alloc")]
extern crate alloc;
#[cfg(any(feature = "std", test))]
extern crate std;

#[cfg(feature = "alloc")]
pub mod channel;
pub mod checksum;
#[cfg(feature = "alloc")]
pub mod chunk;
pub mod codec;
#[cfg(feature = "alloc")]
pub mod config;
#[cfg(feature = "alloc")]
pub mod dest;
#[cfg(feature = "alloc")]
pub mod engine;
pub mod event;
pub mod field;
#[cfg(feature = "alloc")]
pub mod filestore;
pub mod pdu;
#[cfg(feature = "alloc")]
pub mod request;
#[cfg(feature = "alloc")]
pub mod source;
pub mod time;
#[cfg(feature = "alloc")]
pub mod transaction;

use core::fmt::Display;

#[cfg(feature = "alloc")]
pub use alloc_mod::*;
use pdu::{FileDirectiveType, PduType};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
#[cfg(feature = "std")]
pub use std_mod::*;

/// Entity IDs are encoded with 1 to 8 bytes on the wire and held as [u64].
pub type EntityId = u64;
/// Transaction sequence numbers are encoded with 1 to 8 bytes on the wire and held as [u64].
pub type TransactionSeq = u64;

/// The CFDP transaction ID of a CFDP transaction consists of the source entity ID and the
/// sequence number of that transfer which is also determined by the CFDP source entity.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TransactionId {
    source_id: EntityId,
    seq_num: TransactionSeq,
}

impl TransactionId {
    pub const fn new(source_id: EntityId, seq_num: TransactionSeq) -> Self {
        Self { source_id, seq_num }
    }

    #[inline]
    pub fn source_id(&self) -> EntityId {
        self.source_id
    }

    #[inline]
    pub fn seq_num(&self) -> TransactionSeq {
        self.seq_num
    }
}

impl Display for TransactionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "({}, {})", self.source_id, self.seq_num)
    }
}

/// Generic error type for sending a PDU via a message queue.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum GenericSendError {
    #[error("RX disconnected")]
    RxDisconnected,
    #[error("queue is full, fill count {0:?}")]
    QueueFull(Option<u32>),
    #[error("other send error")]
    Other,
}

/// Outbound transport of the engine.
///
/// A [GenericSendError::QueueFull] error is treated like throttling: the transaction tries
/// again in a later cycle. Every other error fails the PDU.
pub trait PduSender {
    fn send_pdu(
        &self,
        channel: u8,
        pdu_type: PduType,
        file_directive_type: Option<FileDirectiveType>,
        raw_pdu: &[u8],
    ) -> Result<(), GenericSendError>;

    /// Throttles the output of a channel, for example while a downlink is saturated. No PDU
    /// is sent for a throttled channel.
    fn throttled(&self, _channel: u8) -> bool {
        false
    }
}

/// Inbound transport of the engine.
pub trait PduReceiver {
    /// Copy the next PDU for `channel` into `buf` and return its length. The returned length
    /// may exceed the buffer length for PDUs which did not fit, those PDUs are dropped.
    fn try_recv_pdu(&mut self, channel: u8, buf: &mut [u8]) -> Option<usize>;
}

#[cfg(feature = "alloc")]
fn copy_pdu(pdu: &[u8], buf: &mut [u8]) -> usize {
    let len = core::cmp::min(pdu.len(), buf.len());
    buf[..len].copy_from_slice(&pdu[..len]);
    if pdu.len() > buf.len() {
        log::warn!(
            "received PDU with length {} exceeds the buffer size {}",
            pdu.len(),
            buf.len()
        );
    }
    pdu.len()
}

#[cfg(feature = "alloc")]
pub mod alloc_mod {
    use alloc::{collections::VecDeque, vec::Vec};

    use super::*;

    #[derive(Debug, PartialEq, Eq, Clone)]
    pub struct PduOwnedWithInfo {
        pub channel: u8,
        pub pdu_type: PduType,
        pub file_directive_type: Option<FileDirectiveType>,
        pub pdu: Vec<u8>,
    }

    impl PduOwnedWithInfo {
        pub fn new(
            channel: u8,
            pdu_type: PduType,
            file_directive_type: Option<FileDirectiveType>,
            pdu: Vec<u8>,
        ) -> Self {
            Self {
                channel,
                pdu_type,
                file_directive_type,
                pdu,
            }
        }
    }

    /// In-memory queue. The PDUs are handed out in order, independent of the polling channel.
    impl PduReceiver for VecDeque<PduOwnedWithInfo> {
        fn try_recv_pdu(&mut self, _channel: u8, buf: &mut [u8]) -> Option<usize> {
            self.pop_front().map(|pdu| copy_pdu(&pdu.pdu, buf))
        }
    }
}

#[cfg(feature = "std")]
pub mod std_mod {
    use std::sync::mpsc;

    use super::*;

    impl PduSender for mpsc::Sender<PduOwnedWithInfo> {
        fn send_pdu(
            &self,
            channel: u8,
            pdu_type: PduType,
            file_directive_type: Option<FileDirectiveType>,
            raw_pdu: &[u8],
        ) -> Result<(), GenericSendError> {
            self.send(PduOwnedWithInfo::new(
                channel,
                pdu_type,
                file_directive_type,
                raw_pdu.to_vec(),
            ))
            .map_err(|_| GenericSendError::RxDisconnected)?;
            Ok(())
        }
    }

    impl PduSender for mpsc::SyncSender<PduOwnedWithInfo> {
        fn send_pdu(
            &self,
            channel: u8,
            pdu_type: PduType,
            file_directive_type: Option<FileDirectiveType>,
            raw_pdu: &[u8],
        ) -> Result<(), GenericSendError> {
            self.try_send(PduOwnedWithInfo::new(
                channel,
                pdu_type,
                file_directive_type,
                raw_pdu.to_vec(),
            ))
            .map_err(|e| match e {
                mpsc::TrySendError::Full(_) => GenericSendError::QueueFull(None),
                mpsc::TrySendError::Disconnected(_) => GenericSendError::RxDisconnected,
            })
        }
    }

    /// A single queue feeds every channel. PDUs go to whichever channel polls first.
    impl PduReceiver for mpsc::Receiver<PduOwnedWithInfo> {
        fn try_recv_pdu(&mut self, _channel: u8, buf: &mut [u8]) -> Option<usize> {
            self.try_recv().ok().map(|pdu| copy_pdu(&pdu.pdu, buf))
        }
    }
}
