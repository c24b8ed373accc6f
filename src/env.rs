//! Storage backend abstraction.
//!
//! Per spec.md §1, the underlying object/file store is out of scope and is
//! abstracted as a small `Env`-like trait providing writable-append and
//! random-read objects, so object stores other than the local filesystem
//! can be substituted.

use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// A writable, append-only object in the underlying store.
#[async_trait]
pub trait WritableFile: AsyncWrite + Send + Sync + Unpin {
    /// Flushes any internally buffered data to the underlying store without
    /// necessarily making it durable.
    async fn flush_file(&mut self) -> io::Result<()>;

    /// Makes all previously written data durable.
    async fn sync(&mut self) -> io::Result<()>;
}

/// A random-access, read-only view of an object already persisted in the
/// underlying store.
#[async_trait]
pub trait RandomAccessFile: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    async fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>>;

    /// Total size, in bytes, of the object.
    fn size(&self) -> u64;
}

/// Abstraction over the underlying object/file store.
///
/// A default, local-filesystem-backed implementation is provided as
/// [`LocalEnv`]; other storage backends implement this trait directly.
#[async_trait]
pub trait Env: Send + Sync + fmt::Debug {
    /// Opens (creating if necessary) a writable, append-only object.
    async fn open_writable(&self, path: &Path) -> io::Result<Box<dyn WritableFile>>;

    /// Opens an existing object for random-access reads, along with its size.
    async fn open_random_access(&self, path: &Path) -> io::Result<Arc<dyn RandomAccessFile>>;

    /// Creates `path` (and any missing parents) as a directory.
    async fn create_dir_all(&self, path: &Path) -> io::Result<()>;
}

/// The default [`Env`]: local files accessed via `tokio::fs`, with reads
/// served from a `memmap2`-backed memory-mapped view.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalEnv;

struct LocalWritableFile {
    inner: tokio::fs::File,
}

impl AsyncWrite for LocalWritableFile {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<io::Result<usize>> {
        std::pin::Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[async_trait]
impl WritableFile for LocalWritableFile {
    async fn flush_file(&mut self) -> io::Result<()> {
        use tokio::io::AsyncWriteExt;
        self.inner.flush().await
    }

    async fn sync(&mut self) -> io::Result<()> {
        self.inner.sync_data().await
    }
}

struct LocalRandomAccessFile {
    mmap: memmap2::Mmap,
}

#[async_trait]
impl RandomAccessFile for LocalRandomAccessFile {
    async fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let offset = usize::try_from(offset).map_err(|_| io::ErrorKind::InvalidInput)?;
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= self.mmap.len())
            .ok_or(io::ErrorKind::UnexpectedEof)?;
        Ok(self.mmap[offset..end].to_vec())
    }

    fn size(&self) -> u64 {
        self.mmap.len() as u64
    }
}

#[async_trait]
impl Env for LocalEnv {
    async fn open_writable(&self, path: &Path) -> io::Result<Box<dyn WritableFile>> {
        let inner = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Box::new(LocalWritableFile { inner }))
    }

    async fn open_random_access(&self, path: &Path) -> io::Result<Arc<dyn RandomAccessFile>> {
        let file = tokio::fs::File::open(path).await?;
        let std_file = file.into_std().await;
        // SAFETY: the mapped file is treated as immutable for the lifetime of the mapping;
        // callers only read logs that have already been durably appended to.
        let mmap = unsafe { memmap2::Mmap::map(&std_file)? };
        Ok(Arc::new(LocalRandomAccessFile { mmap }))
    }

    async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }
}
