//! Log sinks and sources (spec.md §4.5, §3 "LogSink"/"LogSource").
//!
//! A `LogSink` is a shared, mutex-guarded, append-only byte stream with
//! batched writes: callers buffer into it under the lock, and only the
//! lock holder that crosses the configured threshold pays for the actual
//! `WritableFile` append. This is the same shared-sink-behind-a-mutex shape
//! the original header documents for `Lwrite`/`Lsync`/`Lclose`, adapted to
//! `tokio::sync::Mutex` since the flush itself is async I/O.

use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::env::{RandomAccessFile, WritableFile};
use crate::error::{Error, Result};
use crate::events::{Event, EventListener, NullEventListener};
use crate::stats::IoStats;

/// Which physical log a sink or source backs; used only to label stats and
/// metrics (`"data"` vs `"index"`).
pub type LogName = &'static str;

pub const DATA_LOG: LogName = "data";
pub const INDEX_LOG: LogName = "index";

struct LogSinkInner {
    file: Box<dyn WritableFile>,
    pending: BytesMut,
    /// Logical offset at the end of all bytes ever buffered, whether or not
    /// they have been physically flushed yet. Index entries reference this
    /// value, not the physically-flushed offset (spec.md §4.5).
    logical_offset: u64,
    buffer_threshold: usize,
    min_buffer: usize,
    tail_padding: bool,
    closed: bool,
    listener: Arc<dyn EventListener>,
}

impl LogSinkInner {
    async fn flush_pending(&mut self, name: LogName, stats: Option<&IoStats>) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let data = std::mem::take(&mut self.pending);
        self.listener.on_event(Event::IoStart {
            micros: Event::now_micros(),
        });
        self.file.write_all(&data).await?;
        self.file.flush_file().await?;
        self.listener.on_event(Event::IoEnd {
            micros: Event::now_micros(),
        });
        if let Some(stats) = stats {
            match name {
                DATA_LOG => stats.add_data(data.len() as u64),
                _ => stats.add_index(data.len() as u64),
            }
        }
        crate::stats::record_io_bytes(name, "write", data.len() as u64);
        Ok(())
    }
}

/// An append-only, reference-counted, mutex-guarded log stream.
///
/// Cloning a `LogSink` shares the same underlying file and offset counter
/// (the `Ref`/`Unref` pattern from the original header), so two partitions
/// can write to the same physical log while the mutex serializes the
/// actual flush.
#[derive(Clone)]
pub struct LogSink {
    inner: Arc<Mutex<LogSinkInner>>,
    name: LogName,
}

impl std::fmt::Debug for LogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSink").field("name", &self.name).finish()
    }
}

impl LogSink {
    pub fn new(
        file: Box<dyn WritableFile>,
        buffer_threshold: usize,
        min_buffer: usize,
        tail_padding: bool,
        name: LogName,
    ) -> Self {
        Self::with_listener(
            file,
            buffer_threshold,
            min_buffer,
            tail_padding,
            name,
            Arc::new(NullEventListener),
        )
    }

    /// Like [`LogSink::new`], but notifies `listener` with `IoStart`/`IoEnd`
    /// around every physical flush (spec.md §4.7).
    pub fn with_listener(
        file: Box<dyn WritableFile>,
        buffer_threshold: usize,
        min_buffer: usize,
        tail_padding: bool,
        name: LogName,
        listener: Arc<dyn EventListener>,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LogSinkInner {
                file,
                pending: BytesMut::new(),
                logical_offset: 0,
                buffer_threshold,
                min_buffer,
                tail_padding,
                closed: false,
                listener,
            })),
            name,
        }
    }

    /// Buffers `data`, returning the logical offset at which it begins.
    /// Triggers a physical flush once the pending buffer reaches
    /// `buffer_threshold`.
    pub async fn write(&self, data: &[u8], stats: Option<&IoStats>) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(Error::AssertionFailed {
                reason: "write to a closed log sink".into(),
            });
        }
        let offset = inner.logical_offset;
        inner.pending.put_slice(data);
        inner.logical_offset += data.len() as u64;
        if inner.pending.len() >= inner.buffer_threshold {
            inner.flush_pending(self.name, stats).await?;
        }
        Ok(offset)
    }

    /// Forces a physical flush of any buffered bytes without closing.
    pub async fn flush(&self, stats: Option<&IoStats>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.flush_pending(self.name, stats).await
    }

    /// Flushes, pads the tail to a multiple of `buffer_threshold` if
    /// configured and the final write is too small to flush as-is, and
    /// syncs the underlying file. Idempotent: a second call on an
    /// already-closed sink is a no-op (spec.md §8 property 7).
    pub async fn close(&self, stats: Option<&IoStats>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Ok(());
        }
        if inner.tail_padding && !inner.pending.is_empty() && inner.pending.len() < inner.min_buffer
        {
            let threshold = inner.buffer_threshold as u64;
            let remainder = inner.logical_offset % threshold;
            if remainder != 0 {
                let pad = threshold - remainder;
                inner.pending.resize(inner.pending.len() + pad as usize, 0);
                inner.logical_offset += pad;
            }
        }
        inner.flush_pending(self.name, stats).await?;
        inner.file.sync().await?;
        inner.closed = true;
        Ok(())
    }

    /// The current logical end-of-log offset.
    pub async fn tell(&self) -> u64 {
        self.inner.lock().await.logical_offset
    }

    pub fn name(&self) -> LogName {
        self.name
    }
}

/// A reference-counted, random-access view of a persisted log.
#[derive(Clone)]
pub struct LogSource {
    file: Arc<dyn RandomAccessFile>,
    name: LogName,
    listener: Arc<dyn EventListener>,
}

impl std::fmt::Debug for LogSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSource")
            .field("name", &self.name)
            .field("size", &self.file.size())
            .finish()
    }
}

impl LogSource {
    pub fn new(file: Arc<dyn RandomAccessFile>, name: LogName) -> Self {
        Self::with_listener(file, name, Arc::new(NullEventListener))
    }

    /// Like [`LogSource::new`], but notifies `listener` with `IoStart`/
    /// `IoEnd` around every physical read (spec.md §4.7).
    pub fn with_listener(
        file: Arc<dyn RandomAccessFile>,
        name: LogName,
        listener: Arc<dyn EventListener>,
    ) -> Self {
        Self {
            file,
            name,
            listener,
        }
    }

    pub async fn read(&self, offset: u64, len: usize, stats: Option<&IoStats>) -> Result<Vec<u8>> {
        self.listener.on_event(Event::IoStart {
            micros: Event::now_micros(),
        });
        let data = self.file.read_at(offset, len).await?;
        self.listener.on_event(Event::IoEnd {
            micros: Event::now_micros(),
        });
        if let Some(stats) = stats {
            match self.name {
                DATA_LOG => stats.add_data(data.len() as u64),
                _ => stats.add_index(data.len() as u64),
            }
        }
        crate::stats::record_io_bytes(self.name, "read", data.len() as u64);
        Ok(data)
    }

    pub fn size(&self) -> u64 {
        self.file.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Debug, Default)]
    struct MemFile {
        data: parking_lot::Mutex<Vec<u8>>,
        synced: std::sync::atomic::AtomicBool,
    }

    impl tokio::io::AsyncWrite for MemFile {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            self.data.lock().extend_from_slice(buf);
            std::task::Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[async_trait::async_trait]
    impl WritableFile for MemFile {
        async fn flush_file(&mut self) -> std::io::Result<()> {
            Ok(())
        }

        async fn sync(&mut self) -> std::io::Result<()> {
            self.synced.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct MemRandomAccess {
        data: Vec<u8>,
    }

    #[async_trait::async_trait]
    impl RandomAccessFile for MemRandomAccess {
        async fn read_at(&self, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
            let offset = offset as usize;
            Ok(self.data[offset..offset + len].to_vec())
        }

        fn size(&self) -> u64 {
            self.data.len() as u64
        }
    }

    #[tokio::test]
    async fn write_returns_logical_offsets_before_flush() {
        let sink = LogSink::new(Box::new(MemFile::default()), 1 << 20, 0, false, DATA_LOG);
        let off0 = sink.write(b"hello", None).await.unwrap();
        let off1 = sink.write(b"world", None).await.unwrap();
        assert_eq!(off0, 0);
        assert_eq!(off1, 5);
        assert_eq!(sink.tell().await, 10);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let sink = LogSink::new(Box::new(MemFile::default()), 1 << 20, 0, false, DATA_LOG);
        sink.write(b"abc", None).await.unwrap();
        sink.close(None).await.unwrap();
        sink.close(None).await.unwrap();
    }

    #[tokio::test]
    async fn write_after_close_is_rejected() {
        let sink = LogSink::new(Box::new(MemFile::default()), 1 << 20, 0, false, DATA_LOG);
        sink.close(None).await.unwrap();
        let err = sink.write(b"x", None).await.unwrap_err();
        assert!(matches!(err, Error::AssertionFailed { .. }));
    }

    #[tokio::test]
    async fn tail_padding_pads_small_final_write() {
        let sink = LogSink::new(Box::new(MemFile::default()), 1 << 20, 16, true, DATA_LOG);
        sink.write(b"abc", None).await.unwrap();
        sink.close(None).await.unwrap();
        assert_eq!(sink.tell().await, 1 << 20);
    }

    #[tokio::test]
    async fn tail_padding_is_skipped_above_min_buffer() {
        let sink = LogSink::new(Box::new(MemFile::default()), 1 << 20, 16, true, DATA_LOG);
        sink.write(&vec![0u8; 20], None).await.unwrap();
        sink.close(None).await.unwrap();
        assert_eq!(sink.tell().await, 20);
    }

    #[tokio::test]
    async fn log_source_reads_at_offset() {
        let source = LogSource::new(
            Arc::new(MemRandomAccess {
                data: b"0123456789".to_vec(),
            }),
            DATA_LOG,
        );
        let data = source.read(3, 4, None).await.unwrap();
        assert_eq!(&data, b"3456");
        assert_eq!(source.size(), 10);
    }

    #[test]
    fn log_names_are_distinct() {
        assert_ne!(DATA_LOG, INDEX_LOG);
        let _ = AtomicU64::new(0);
    }

    #[derive(Debug, Default)]
    struct RecordingListener {
        events: parking_lot::Mutex<Vec<Event>>,
    }

    impl EventListener for RecordingListener {
        fn on_event(&self, event: Event) {
            self.events.lock().push(event);
        }
    }

    #[tokio::test]
    async fn sink_flush_fires_io_start_and_end() {
        let listener = Arc::new(RecordingListener::default());
        let sink = LogSink::with_listener(
            Box::new(MemFile::default()),
            4,
            0,
            false,
            DATA_LOG,
            listener.clone(),
        );
        sink.write(b"data", None).await.unwrap();
        let events = listener.events.lock();
        assert!(matches!(events[0], Event::IoStart { .. }));
        assert!(matches!(events[1], Event::IoEnd { .. }));
    }

    #[tokio::test]
    async fn source_read_fires_io_start_and_end() {
        let listener = Arc::new(RecordingListener::default());
        let source = LogSource::with_listener(
            Arc::new(MemRandomAccess {
                data: b"0123456789".to_vec(),
            }),
            DATA_LOG,
            listener.clone(),
        );
        source.read(0, 4, None).await.unwrap();
        let events = listener.events.lock();
        assert!(matches!(events[0], Event::IoStart { .. }));
        assert!(matches!(events[1], Event::IoEnd { .. }));
    }
}
