//! Backing media for the page store.
//!
//! A backend is a flat, growable byte region addressed by offset. The page
//! store decides what lives where; backends only read and write bytes.
//! Each `read_at` call results in exactly one seek and read on a file.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Byte-addressed storage underneath a [`PageStore`](super::PageStore).
pub trait PageBackend: Send {
    /// Fills `buf` from `offset`. Reading past the end fails with
    /// `UnexpectedEof`.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Writes `buf` at `offset`, growing the medium when needed.
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()>;

    /// Current size of the medium in bytes.
    fn len(&self) -> io::Result<u64>;

    fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Forces buffered writes down to the medium.
    fn sync(&mut self) -> io::Result<()>;

    /// Shrinks or grows the medium to `len` bytes.
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

/// File-backed medium.
pub struct FileBackend {
    file: File,
    path: PathBuf,
}

impl FileBackend {
    /// Opens `path` for read/write, creating it if missing. Existing content
    /// is kept so the caller can detect an index that is already there.
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Opens an existing file for read/write.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PageBackend for FileBackend {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn sync(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }
}

/// In-process growable medium for ephemeral indexes.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    data: Vec<u8>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps existing bytes, e.g. a previously exported image.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

impl PageBackend for MemoryBackend {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let start = offset as usize;
        let end = start.checked_add(buf.len()).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "read range overflows")
        })?;
        if end > self.data.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "read of {} bytes at {} past end of {} byte region",
                    buf.len(),
                    offset,
                    self.data.len()
                ),
            ));
        }
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let start = offset as usize;
        let end = start.checked_add(buf.len()).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "write range overflows")
        })?;
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.data.resize(len as usize, 0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_backend_create() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.rstar");
        let backend = FileBackend::create(&path).unwrap();
        assert!(path.exists());
        assert_eq!(backend.len().unwrap(), 0);
        assert_eq!(backend.path(), path.as_path());
    }

    #[test]
    fn test_file_backend_open_missing_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.rstar");
        assert!(FileBackend::open(&path).is_err());
    }

    #[test]
    fn test_file_backend_write_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.rstar");
        let mut backend = FileBackend::create(&path).unwrap();

        backend.write_at(100, b"hello").unwrap();
        assert_eq!(backend.len().unwrap(), 105);

        let mut buf = [0u8; 5];
        backend.read_at(100, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        backend.sync().unwrap();
    }

    #[test]
    fn test_file_backend_keeps_content_on_create() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.rstar");
        {
            let mut backend = FileBackend::create(&path).unwrap();
            backend.write_at(0, b"abc").unwrap();
        }
        let backend = FileBackend::create(&path).unwrap();
        assert_eq!(backend.len().unwrap(), 3);
    }

    #[test]
    fn test_file_backend_read_past_end() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.rstar");
        let mut backend = FileBackend::create(&path).unwrap();
        backend.write_at(0, b"abc").unwrap();

        let mut buf = [0u8; 8];
        let err = backend.read_at(0, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_memory_backend_grows_on_write() {
        let mut backend = MemoryBackend::new();
        assert!(backend.is_empty().unwrap());

        backend.write_at(10, &[1, 2, 3]).unwrap();
        assert_eq!(backend.len().unwrap(), 13);
        assert_eq!(&backend.as_bytes()[..10], &[0u8; 10]);

        let mut buf = [0u8; 3];
        backend.read_at(10, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn test_memory_backend_read_past_end() {
        let mut backend = MemoryBackend::from_bytes(vec![0; 4]);
        let mut buf = [0u8; 8];
        let err = backend.read_at(0, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_truncate() {
        let mut backend = MemoryBackend::from_bytes(vec![7; 16]);
        backend.truncate(4).unwrap();
        assert_eq!(backend.into_bytes(), vec![7; 4]);

        let dir = tempdir().unwrap();
        let path = dir.path().join("test.rstar");
        let mut file = FileBackend::create(&path).unwrap();
        file.write_at(0, &[1; 64]).unwrap();
        file.truncate(0).unwrap();
        assert_eq!(file.len().unwrap(), 0);
    }
}
