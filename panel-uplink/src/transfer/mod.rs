//! Archive handles and upload progress reporting.

pub mod progress;
pub mod progress_stream;

use std::fmt;
use std::io::Cursor;
use tokio::io::AsyncRead;

/// Readable side of an archive being transferred.
pub type ArchiveReader = Box<dyn AsyncRead + Send + Sync + Unpin>;

/// A completed backup archive, ready to be streamed.
///
/// Whoever holds the handle owns the underlying reader; dropping the handle
/// closes it.
pub struct ArchiveHandle {
    pub file_name: String,
    pub reader: ArchiveReader,
    /// Size in bytes, when known up front
    pub size: Option<u64>,
}

impl ArchiveHandle {
    pub fn new(file_name: impl Into<String>, reader: ArchiveReader) -> Self {
        Self {
            file_name: file_name.into(),
            reader,
            size: None,
        }
    }

    /// Wrap an in-memory payload.
    pub fn from_bytes(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let size = bytes.len() as u64;
        Self::new(file_name, Box::new(Cursor::new(bytes))).with_size(size)
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }
}

impl fmt::Debug for ArchiveHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveHandle")
            .field("file_name", &self.file_name)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}
