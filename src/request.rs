//! Command payloads accepted by the [crate::engine::Engine].
use crate::{pdu::TransmissionMode, EntityId, TransactionId};

/// Maximum length of a path carried inside a Metadata PDU LV field.
pub const MAX_PATH_LEN: usize = u8::MAX as usize;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[error("file path with length {0} exceeds the maximum of 255 bytes")]
pub struct FilePathTooLarge(pub usize);

pub fn generic_path_checks(source_file: &str, dest_file: &str) -> Result<(), FilePathTooLarge> {
    if source_file.len() > MAX_PATH_LEN {
        return Err(FilePathTooLarge(source_file.len()));
    }
    if dest_file.len() > MAX_PATH_LEN {
        return Err(FilePathTooLarge(dest_file.len()));
    }
    Ok(())
}

/// Request to send a single file.
///
/// `keep` controls what happens with the source file after the transaction: it stays in place
/// when set, otherwise it is deleted after a successful transfer or moved to the configured
/// fail directory after a failed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxFileRequest<'src_file, 'dest_file> {
    pub class: TransmissionMode,
    pub keep: bool,
    pub channel: u8,
    pub priority: u8,
    pub dest_eid: EntityId,
    src_path: &'src_file str,
    dst_path: &'dest_file str,
}

impl<'src_file, 'dest_file> TxFileRequest<'src_file, 'dest_file> {
    pub fn new(
        class: TransmissionMode,
        keep: bool,
        channel: u8,
        priority: u8,
        dest_eid: EntityId,
        src_path: &'src_file str,
        dst_path: &'dest_file str,
    ) -> Result<Self, FilePathTooLarge> {
        generic_path_checks(src_path, dst_path)?;
        Ok(Self {
            class,
            keep,
            channel,
            priority,
            dest_eid,
            src_path,
            dst_path,
        })
    }

    #[inline]
    pub fn src_path(&self) -> &'src_file str {
        self.src_path
    }

    #[inline]
    pub fn dst_path(&self) -> &'dest_file str {
        self.dst_path
    }
}

/// Request to send every regular file of a directory. Same shape as [TxFileRequest], the paths
/// are directories. Each file `<src_dir>/<name>` is sent to `<dst_dir>/<name>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackRequest<'src_dir, 'dest_dir> {
    pub class: TransmissionMode,
    pub keep: bool,
    pub channel: u8,
    pub priority: u8,
    pub dest_eid: EntityId,
    src_dir: &'src_dir str,
    dst_dir: &'dest_dir str,
}

impl<'src_dir, 'dest_dir> PlaybackRequest<'src_dir, 'dest_dir> {
    pub fn new(
        class: TransmissionMode,
        keep: bool,
        channel: u8,
        priority: u8,
        dest_eid: EntityId,
        src_dir: &'src_dir str,
        dst_dir: &'dest_dir str,
    ) -> Result<Self, FilePathTooLarge> {
        generic_path_checks(src_dir, dst_dir)?;
        Ok(Self {
            class,
            keep,
            channel,
            priority,
            dest_eid,
            src_dir,
            dst_dir,
        })
    }

    #[inline]
    pub fn src_dir(&self) -> &'src_dir str {
        self.src_dir
    }

    #[inline]
    pub fn dst_dir(&self) -> &'dest_dir str {
        self.dst_dir
    }
}

/// Target of the freeze, thaw and dequeue commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ChannelSelector {
    Channel(u8),
    All,
}

/// Target of the suspend, resume, cancel and abandon commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TransactionSelector {
    Id(TransactionId),
    Channel(u8),
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum QueueSelector {
    Pending,
    History,
    Both,
}

/// Polling directory slots addressed by the polling commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PollDirSelector {
    Index(usize),
    All,
}

/// Parameters accessible with the get and set parameter commands. Engine wide parameters ignore
/// the channel argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ParamKey {
    TicksPerSecond,
    RxCrcCalcBytesPerWakeup,
    AckTimerSeconds,
    NakTimerSeconds,
    InactivityTimerSeconds,
    AckLimit,
    NakLimit,
    OutgoingFileChunkSize,
    MaxOutgoingMessagesPerWakeup,
    LocalEid,
}

impl ParamKey {
    #[inline]
    pub fn is_engine_wide(&self) -> bool {
        matches!(
            self,
            ParamKey::TicksPerSecond | ParamKey::RxCrcCalcBytesPerWakeup | ParamKey::LocalEid
        )
    }
}

#[cfg(test)]
mod tests {
    use std::string::String;

    use super::*;

    #[test]
    fn test_tx_file_request() {
        let request = TxFileRequest::new(
            TransmissionMode::Acknowledged,
            true,
            0,
            3,
            23,
            "/tmp/src.txt",
            "/tmp/dst.txt",
        )
        .unwrap();
        assert_eq!(request.src_path(), "/tmp/src.txt");
        assert_eq!(request.dst_path(), "/tmp/dst.txt");
        assert_eq!(request.priority, 3);
    }

    #[test]
    fn test_path_too_large() {
        let long_path: String = core::iter::repeat('a').take(256).collect();
        assert_eq!(
            TxFileRequest::new(
                TransmissionMode::Unacknowledged,
                true,
                0,
                0,
                23,
                &long_path,
                "/tmp/dst.txt",
            ),
            Err(FilePathTooLarge(256))
        );
        assert_eq!(
            PlaybackRequest::new(
                TransmissionMode::Unacknowledged,
                true,
                0,
                0,
                23,
                "/tmp",
                &long_path,
            ),
            Err(FilePathTooLarge(256))
        );
        assert!(generic_path_checks(&long_path[..255], "").is_ok());
    }

    #[test]
    fn test_engine_wide_params() {
        assert!(ParamKey::LocalEid.is_engine_wide());
        assert!(!ParamKey::AckLimit.is_engine_wide());
    }
}
