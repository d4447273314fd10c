//! Reader over a temporary file that removes the file once drained.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use imagemod_shared::errors::{ImageModError, ImageModResult};
use tempfile::{NamedTempFile, TempPath};

/// Streams the content of a temporary file and deletes it when the stream ends.
///
/// Cleanup happens exactly once: when the remaining byte count reaches zero,
/// when the underlying file reports end of data, or on the first read error.
/// After cleanup every read returns `Ok(0)`. Dropping an unfinished reader also
/// removes the file.
#[derive(Debug)]
pub struct TmpReader {
    file: Option<File>,
    path: Option<TempPath>,
    remain: u64,
}

impl TmpReader {
    /// Take ownership of a fully written temp file and read it from the start.
    pub fn from_named(tmp: NamedTempFile) -> ImageModResult<Self> {
        let file = tmp.reopen().map_err(|e| {
            ImageModError::Storage(format!(
                "Failed to reopen temp file {}: {}",
                tmp.path().display(),
                e
            ))
        })?;
        let remain = file
            .metadata()
            .map_err(|e| {
                ImageModError::Storage(format!(
                    "Failed to stat temp file {}: {}",
                    tmp.path().display(),
                    e
                ))
            })?
            .len();
        Ok(Self {
            file: Some(file),
            path: Some(tmp.into_temp_path()),
            remain,
        })
    }

    /// Bytes left before the reader cleans up.
    pub fn remaining(&self) -> u64 {
        self.remain
    }

    /// Path of the backing file while it still exists.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn cleanup(&mut self) {
        self.file = None;
        if let Some(path) = self.path.take() {
            let shown = path.display().to_string();
            if let Err(e) = path.close() {
                tracing::warn!(path = %shown, error = %e, "Failed to remove temp file");
            } else {
                tracing::trace!(path = %shown, "Removed temp file");
            }
        }
        self.remain = 0;
    }
}

impl Read for TmpReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let Some(file) = self.file.as_mut() else {
            return Ok(0);
        };
        match file.read(buf) {
            Ok(0) => {
                self.cleanup();
                Ok(0)
            }
            Ok(n) => {
                self.remain = self.remain.saturating_sub(n as u64);
                if self.remain == 0 {
                    self.cleanup();
                }
                Ok(n)
            }
            Err(e) => {
                self.cleanup();
                Err(e)
            }
        }
    }
}

impl Drop for TmpReader {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn reader_with(content: &[u8]) -> TmpReader {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(content).unwrap();
        tmp.flush().unwrap();
        TmpReader::from_named(tmp).unwrap()
    }

    #[test]
    fn test_drained_reader_removes_file() {
        let mut reader = reader_with(b"hello world");
        let path = reader.path().unwrap().to_path_buf();
        assert!(path.exists());
        assert_eq!(reader.remaining(), 11);

        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();

        assert_eq!(out, b"hello world");
        assert!(!path.exists());
        assert!(reader.path().is_none());
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_partial_read_keeps_file() {
        let mut reader = reader_with(b"0123456789");
        let path = reader.path().unwrap().to_path_buf();

        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"0123");
        assert_eq!(reader.remaining(), 6);
        assert!(path.exists());

        drop(reader);
        assert!(!path.exists());
    }

    #[test]
    fn test_empty_file_cleans_up_on_first_read() {
        let mut reader = reader_with(b"");
        let path = reader.path().unwrap().to_path_buf();

        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
        assert!(!path.exists());
    }

    #[test]
    fn test_read_error_removes_file() {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(b"content").unwrap();
        let path = tmp.into_temp_path();
        let write_only = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        let shown = path.to_path_buf();
        let mut reader = TmpReader {
            file: Some(write_only),
            path: Some(path),
            remain: 7,
        };

        let mut buf = [0u8; 4];
        assert!(reader.read(&mut buf).is_err());
        assert!(!shown.exists());
        assert!(reader.path().is_none());
        assert_eq!(reader.remaining(), 0);
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_truncated_file_cleans_up_at_early_end() {
        let mut reader = reader_with(b"0123456789");
        let path = reader.path().unwrap().to_path_buf();
        std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(3)
            .unwrap();

        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"012");
        assert!(!path.exists());
    }

    #[test]
    fn test_zero_length_buffer_is_noop() {
        let mut reader = reader_with(b"abc");
        let path = reader.path().unwrap().to_path_buf();

        assert_eq!(reader.read(&mut []).unwrap(), 0);
        assert!(path.exists());
        assert_eq!(reader.remaining(), 3);
    }
}
