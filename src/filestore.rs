use alloc::string::String;
use alloc::vec::Vec;

use crate::checksum::RunningChecksum;
use crate::pdu::ChecksumType;
#[cfg(feature = "std")]
pub use std_mod::*;

#[derive(Debug, thiserror::Error)]
#[cfg_attr(all(feature = "defmt", not(feature = "std")), derive(defmt::Format))]
#[non_exhaustive]
pub enum FilestoreError {
    #[error("file does not exist")]
    FileDoesNotExist,
    #[error("file already exists")]
    FileAlreadyExists,
    #[error("directory does not exist")]
    DirDoesNotExist,
    #[error("permission error")]
    Permission,
    #[error("is not a file")]
    IsNotFile,
    #[error("is not a directory")]
    IsNotDirectory,
    #[error("buffer too small: found {found}, expected {expected}")]
    BufferTooSmall { found: usize, expected: usize },
    #[error("IO error: {0})")]
    #[cfg(feature = "std")]
    Io(#[from] std::io::Error),
    #[error("checksum type not implemented: {0:?}")]
    ChecksumTypeNotImplemented(ChecksumType),
    #[error("utf8 error")]
    Utf8Error,
    #[error("other error")]
    Other,
}

/// File system abstraction used by the transaction state machines.
///
/// All paths are plain strings as carried by Metadata PDUs and commands. Implementations are
/// addressed through `&dyn VirtualFilestore`, so every method takes `&self`.
pub trait VirtualFilestore {
    fn create_file(&self, file_path: &str) -> Result<(), FilestoreError>;

    fn remove_file(&self, file_path: &str) -> Result<(), FilestoreError>;

    /// Move a file. An existing file at the destination is replaced.
    fn rename_file(&self, from: &str, to: &str) -> Result<(), FilestoreError>;

    /// Truncating a file means deleting all its data so the resulting file is empty.
    fn truncate_file(&self, file_path: &str) -> Result<(), FilestoreError>;

    fn create_dir(&self, dir_path: &str) -> Result<(), FilestoreError>;

    fn remove_dir(&self, dir_path: &str, all: bool) -> Result<(), FilestoreError>;

    /// Read up to `buf.len()` bytes starting at `offset`. Returns the number of bytes read,
    /// which is only smaller than the buffer at the end of the file.
    fn read_data(&self, file_path: &str, offset: u64, buf: &mut [u8])
        -> Result<usize, FilestoreError>;

    /// Write `data` at `offset`, extending the file if required.
    fn write_data(&self, file_path: &str, offset: u64, data: &[u8]) -> Result<(), FilestoreError>;

    fn is_file(&self, path: &str) -> Result<bool, FilestoreError>;

    fn is_dir(&self, path: &str) -> Result<bool, FilestoreError> {
        Ok(!self.is_file(path)?)
    }

    fn exists(&self, path: &str) -> Result<bool, FilestoreError>;

    fn file_size(&self, path: &str) -> Result<u64, FilestoreError>;

    /// Full paths of the regular files inside a directory, sorted by name.
    fn list_dir(&self, dir_path: &str) -> Result<Vec<String>, FilestoreError>;

    /// Extract the file name part of a full path.
    ///
    /// This method should behave similarly to the [std::path::Path::file_name] method.
    fn file_name<'a>(&self, full_path: &'a str) -> Option<&'a str> {
        full_path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
    }

    /// Feed up to `len` bytes of the file starting at `offset` into a running checksum. Returns
    /// the number of bytes processed, which is smaller than `len` if the end of the file was
    /// reached.
    ///
    /// The passed buffer is used to read the file. Larger buffers need fewer reads.
    fn checksum_range(
        &self,
        file_path: &str,
        checksum: &mut RunningChecksum,
        offset: u64,
        len: u64,
        read_buf: &mut [u8],
    ) -> Result<u64, FilestoreError> {
        if read_buf.is_empty() && len > 0 {
            return Err(FilestoreError::BufferTooSmall {
                found: 0,
                expected: 1,
            });
        }
        let mut processed = 0;
        while processed < len {
            let chunk = core::cmp::min(len - processed, read_buf.len() as u64) as usize;
            let read = self.read_data(file_path, offset + processed, &mut read_buf[..chunk])?;
            if read == 0 {
                break;
            }
            checksum.update(offset + processed, &read_buf[..read]);
            processed += read as u64;
        }
        Ok(processed)
    }

    /// Checksum of the first `size_to_verify` bytes of a file.
    fn calculate_checksum(
        &self,
        file_path: &str,
        checksum_type: ChecksumType,
        size_to_verify: u64,
        read_buf: &mut [u8],
    ) -> Result<u32, FilestoreError> {
        let mut checksum = RunningChecksum::new(checksum_type)
            .ok_or(FilestoreError::ChecksumTypeNotImplemented(checksum_type))?;
        if checksum_type == ChecksumType::NullChecksum {
            return Ok(0);
        }
        self.checksum_range(file_path, &mut checksum, 0, size_to_verify, read_buf)?;
        Ok(checksum.finalize())
    }

    fn checksum_verify(
        &self,
        expected_checksum: u32,
        file_path: &str,
        checksum_type: ChecksumType,
        size_to_verify: u64,
        read_buf: &mut [u8],
    ) -> Result<bool, FilestoreError> {
        Ok(
            self.calculate_checksum(file_path, checksum_type, size_to_verify, read_buf)?
                == expected_checksum,
        )
    }
}

#[cfg(feature = "std")]
pub mod std_mod {
    use super::*;
    use std::{
        fs::{self, File, OpenOptions},
        io::{ErrorKind, Read, Seek, SeekFrom, Write},
        path::Path,
        string::ToString,
    };

    #[derive(Debug, Default, Copy, Clone)]
    pub struct NativeFilestore {}

    impl NativeFilestore {
        fn check_is_file(&self, file_path: &str) -> Result<(), FilestoreError> {
            if !self.exists(file_path)? {
                return Err(FilestoreError::FileDoesNotExist);
            }
            if !self.is_file(file_path)? {
                return Err(FilestoreError::IsNotFile);
            }
            Ok(())
        }
    }

    impl VirtualFilestore for NativeFilestore {
        fn create_file(&self, file_path: &str) -> Result<(), FilestoreError> {
            if self.exists(file_path)? {
                return Err(FilestoreError::FileAlreadyExists);
            }
            File::create(file_path)?;
            Ok(())
        }

        fn remove_file(&self, file_path: &str) -> Result<(), FilestoreError> {
            self.check_is_file(file_path)?;
            fs::remove_file(file_path)?;
            Ok(())
        }

        fn rename_file(&self, from: &str, to: &str) -> Result<(), FilestoreError> {
            self.check_is_file(from)?;
            fs::rename(from, to)?;
            Ok(())
        }

        fn truncate_file(&self, file_path: &str) -> Result<(), FilestoreError> {
            self.check_is_file(file_path)?;
            OpenOptions::new()
                .write(true)
                .truncate(true)
                .open(file_path)?;
            Ok(())
        }

        fn create_dir(&self, dir_path: &str) -> Result<(), FilestoreError> {
            fs::create_dir(dir_path)?;
            Ok(())
        }

        fn remove_dir(&self, dir_path: &str, all: bool) -> Result<(), FilestoreError> {
            if !self.exists(dir_path)? {
                return Err(FilestoreError::DirDoesNotExist);
            }
            if !self.is_dir(dir_path)? {
                return Err(FilestoreError::IsNotDirectory);
            }
            if !all {
                fs::remove_dir(dir_path)?;
                return Ok(());
            }
            fs::remove_dir_all(dir_path)?;
            Ok(())
        }

        fn read_data(
            &self,
            file_path: &str,
            offset: u64,
            buf: &mut [u8],
        ) -> Result<usize, FilestoreError> {
            self.check_is_file(file_path)?;
            let mut file = File::open(file_path)?;
            file.seek(SeekFrom::Start(offset))?;
            let mut filled = 0;
            while filled < buf.len() {
                match file.read(&mut buf[filled..]) {
                    Ok(0) => break,
                    Ok(read) => filled += read,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(filled)
        }

        fn write_data(
            &self,
            file_path: &str,
            offset: u64,
            data: &[u8],
        ) -> Result<(), FilestoreError> {
            self.check_is_file(file_path)?;
            let mut file = OpenOptions::new().write(true).open(file_path)?;
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(data)?;
            Ok(())
        }

        fn is_file(&self, str_path: &str) -> Result<bool, FilestoreError> {
            let path = Path::new(str_path);
            if !path.exists() {
                return Err(FilestoreError::FileDoesNotExist);
            }
            Ok(path.is_file())
        }

        fn exists(&self, path: &str) -> Result<bool, FilestoreError> {
            Ok(Path::new(path).exists())
        }

        fn file_size(&self, str_path: &str) -> Result<u64, FilestoreError> {
            self.check_is_file(str_path)?;
            Ok(Path::new(str_path).metadata()?.len())
        }

        fn list_dir(&self, dir_path: &str) -> Result<Vec<String>, FilestoreError> {
            let path = Path::new(dir_path);
            if !path.exists() {
                return Err(FilestoreError::DirDoesNotExist);
            }
            if !path.is_dir() {
                return Err(FilestoreError::IsNotDirectory);
            }
            let mut files = Vec::new();
            for entry in fs::read_dir(path)? {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                let full_path = entry.path();
                let full_path = full_path.to_str().ok_or(FilestoreError::Utf8Error)?;
                files.push(full_path.to_string());
            }
            files.sort_unstable();
            Ok(files)
        }

        fn file_name<'a>(&self, full_path: &'a str) -> Option<&'a str> {
            Path::new(full_path)
                .file_name()
                .and_then(|name| name.to_str())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, string::ToString};

    use super::*;
    use crate::checksum::calculate_checksum;
    use alloc::format;
    use tempfile::tempdir;

    const EXAMPLE_DATA_CFDP: [u8; 15] = [
        0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E,
    ];

    const NATIVE_FS: NativeFilestore = NativeFilestore {};

    #[test]
    fn test_create_and_exists() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let file_path = tmpdir.path().join("test.txt");
        let file_path = file_path.to_str().unwrap();
        assert!(!NATIVE_FS.exists(file_path).unwrap());
        NATIVE_FS.create_file(file_path).unwrap();
        assert!(NATIVE_FS.exists(file_path).unwrap());
        assert!(NATIVE_FS.is_file(file_path).unwrap());
        assert_eq!(NATIVE_FS.file_size(file_path).unwrap(), 0);
    }

    #[test]
    fn test_file_already_exists() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let file_path = tmpdir.path().join("test.txt");
        let file_path = file_path.to_str().unwrap();
        NATIVE_FS.create_file(file_path).unwrap();
        let error = NATIVE_FS.create_file(file_path).unwrap_err();
        if let FilestoreError::FileAlreadyExists = error {
            assert_eq!(error.to_string(), "file already exists");
        } else {
            panic!("unexpected error");
        }
    }

    #[test]
    fn test_write_then_read_at_offsets() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let file_path = tmpdir.path().join("test.bin");
        let file_path = file_path.to_str().unwrap();
        NATIVE_FS.create_file(file_path).unwrap();
        // Writing behind the end leaves a zero filled hole.
        NATIVE_FS.write_data(file_path, 4, &[5, 6, 7, 8]).unwrap();
        NATIVE_FS.write_data(file_path, 0, &[1, 2]).unwrap();
        assert_eq!(fs::read(file_path).unwrap(), [1, 2, 0, 0, 5, 6, 7, 8]);
        let mut buf = [0; 4];
        assert_eq!(NATIVE_FS.read_data(file_path, 2, &mut buf).unwrap(), 4);
        assert_eq!(buf, [0, 0, 5, 6]);
        // Short read at the end of the file.
        assert_eq!(NATIVE_FS.read_data(file_path, 6, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[7, 8]);
        assert_eq!(NATIVE_FS.file_size(file_path).unwrap(), 8);
    }

    #[test]
    fn test_read_missing_file() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let file_path = tmpdir.path().join("test.txt");
        let error = NATIVE_FS
            .read_data(file_path.to_str().unwrap(), 0, &mut [0; 4])
            .unwrap_err();
        assert!(matches!(error, FilestoreError::FileDoesNotExist));
    }

    #[test]
    fn test_read_file_on_dir() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let error = NATIVE_FS
            .read_data(tmpdir.path().to_str().unwrap(), 0, &mut [0; 4])
            .unwrap_err();
        if let FilestoreError::IsNotFile = error {
            assert_eq!(error.to_string(), "is not a file");
        } else {
            panic!("unexpected error");
        }
    }

    #[test]
    fn test_rename() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let from = tmpdir.path().join("from.txt");
        let to = tmpdir.path().join("to.txt");
        fs::write(&from, [1, 2, 3]).unwrap();
        NATIVE_FS
            .rename_file(from.to_str().unwrap(), to.to_str().unwrap())
            .unwrap();
        assert!(!from.exists());
        assert_eq!(fs::read(to).unwrap(), [1, 2, 3]);
        assert!(matches!(
            NATIVE_FS.rename_file(from.to_str().unwrap(), "/nonexistent/dir/x"),
            Err(FilestoreError::FileDoesNotExist)
        ));
    }

    #[test]
    fn test_truncate_and_remove() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let file_path = tmpdir.path().join("test.txt");
        fs::write(&file_path, [1, 2, 3, 4]).unwrap();
        let file_path = file_path.to_str().unwrap();
        NATIVE_FS.truncate_file(file_path).unwrap();
        assert_eq!(NATIVE_FS.file_size(file_path).unwrap(), 0);
        NATIVE_FS.remove_file(file_path).unwrap();
        assert!(!NATIVE_FS.exists(file_path).unwrap());
        assert!(matches!(
            NATIVE_FS.remove_file(file_path),
            Err(FilestoreError::FileDoesNotExist)
        ));
    }

    #[test]
    fn test_dirs() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let dir_path = tmpdir.path().join("testdir");
        let dir_path = dir_path.to_str().unwrap();
        NATIVE_FS.create_dir(dir_path).unwrap();
        assert!(NATIVE_FS.is_dir(dir_path).unwrap());
        assert!(matches!(
            NATIVE_FS.remove_file(dir_path),
            Err(FilestoreError::IsNotFile)
        ));
        let file_path = format!("{}/inner.txt", dir_path);
        NATIVE_FS.create_file(&file_path).unwrap();
        assert!(matches!(
            NATIVE_FS.remove_dir(&file_path, true),
            Err(FilestoreError::IsNotDirectory)
        ));
        NATIVE_FS.remove_dir(dir_path, true).unwrap();
        assert!(!NATIVE_FS.exists(dir_path).unwrap());
        assert!(matches!(
            NATIVE_FS.remove_dir(dir_path, true),
            Err(FilestoreError::DirDoesNotExist)
        ));
    }

    #[test]
    fn test_list_dir() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        fs::write(tmpdir.path().join("b.bin"), [1]).unwrap();
        fs::write(tmpdir.path().join("a.bin"), [2]).unwrap();
        fs::create_dir(tmpdir.path().join("subdir")).unwrap();
        let files = NATIVE_FS.list_dir(tmpdir.path().to_str().unwrap()).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("a.bin"));
        assert!(files[1].ends_with("b.bin"));
        assert!(matches!(
            NATIVE_FS.list_dir(&files[0]),
            Err(FilestoreError::IsNotDirectory)
        ));
    }

    #[test]
    fn test_file_name() {
        assert_eq!(NATIVE_FS.file_name("/tmp/dir/test.txt"), Some("test.txt"));
        assert_eq!(NATIVE_FS.file_name("test.txt"), Some("test.txt"));
    }

    #[test]
    fn test_modular_checksum() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let file_path = tmpdir.path().join("mod-crc.bin");
        fs::write(file_path.as_path(), EXAMPLE_DATA_CFDP).expect("writing test file failed");
        // Verified manually: three full words plus the zero padded remainder.
        let expected = 0x0001_0203u32
            .wrapping_add(0x0405_0607)
            .wrapping_add(0x0809_0a0b)
            .wrapping_add(0x0c0d_0e00);
        // A small buffer forces multiple reads, including one unaligned to the word size.
        let mut read_buf = [0; 7];
        assert!(NATIVE_FS
            .checksum_verify(
                expected,
                file_path.to_str().unwrap(),
                ChecksumType::Modular,
                EXAMPLE_DATA_CFDP.len() as u64,
                &mut read_buf,
            )
            .unwrap());
    }

    #[test]
    fn test_crc32_checksum_matches_in_memory() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let file_path = tmpdir.path().join("crc.bin");
        let data: std::vec::Vec<u8> = (0..1000u32).map(|v| (v % 251) as u8).collect();
        fs::write(&file_path, &data).unwrap();
        let mut read_buf = [0; 64];
        let from_file = NATIVE_FS
            .calculate_checksum(
                file_path.to_str().unwrap(),
                ChecksumType::Crc32,
                data.len() as u64,
                &mut read_buf,
            )
            .unwrap();
        assert_eq!(
            Some(from_file),
            calculate_checksum(ChecksumType::Crc32, &data)
        );
    }

    #[test]
    fn test_checksum_range_stops_at_end() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let file_path = tmpdir.path().join("short.bin");
        fs::write(&file_path, [1, 2, 3]).unwrap();
        let mut checksum = RunningChecksum::new(ChecksumType::Modular).unwrap();
        let processed = NATIVE_FS
            .checksum_range(
                file_path.to_str().unwrap(),
                &mut checksum,
                0,
                100,
                &mut [0; 16],
            )
            .unwrap();
        assert_eq!(processed, 3);
        assert_eq!(checksum.finalize(), 0x0102_0300);
    }

    #[test]
    fn test_null_checksum_impl() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let file_path = tmpdir.path().join("mod-crc.bin");
        // The file does not need to exist for the null checksum.
        let result = NATIVE_FS.checksum_verify(
            0,
            file_path.to_str().unwrap(),
            ChecksumType::NullChecksum,
            0,
            &mut [],
        );
        assert!(result.unwrap());
    }

    #[test]
    fn test_checksum_not_implemented() {
        let result = NATIVE_FS.checksum_verify(
            0,
            "/tmp/does-not-matter",
            ChecksumType::Crc32Proximity1,
            0,
            &mut [],
        );
        let error = result.unwrap_err();
        if let FilestoreError::ChecksumTypeNotImplemented(cksum_type) = error {
            assert_eq!(
                error.to_string(),
                format!("checksum type not implemented: {:?}", cksum_type)
            );
        } else {
            panic!("unexpected error");
        }
    }
}
