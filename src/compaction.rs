//! Partitioned compaction pipeline (spec.md §4.4).
//!
//! Each partition owns a mutable memtable (writes land here), an immutable
//! slot (rotated out, awaiting or undergoing compaction), and a single
//! in-flight compaction slot enforced by a `tokio::sync::Semaphore(1)`.
//! Compaction itself is CPU-bound (sort + serialize), so a job runs on the
//! configured [`ThreadPool`] when one is set; the actual table-building I/O
//! is async, so the pool closure bridges back into the calling Tokio
//! runtime with `Handle::block_on`.
//!
//! `PartitionState`'s memtable/epoch bookkeeping is guarded by an internal
//! `parking_lot::Mutex` rather than an external `tokio::sync::Mutex`, so a
//! writer can check-and-rotate synchronously without holding a lock across
//! an `.await` — the `Notify`/`Semaphore` fields handle the genuinely
//! asynchronous waits (for compaction completion and for the single
//! in-flight slot).

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};

use crate::error::{Error, Result};
use crate::events::{Event, EventListener};
use crate::log::LogSink;
use crate::memtable::MemTable;
use crate::options::DirOptions;
use crate::stats::{self, IoStats};
use crate::table::{BlockHandle, TableBuilder};
use crate::threadpool::ThreadPool;

/// One scheduled compaction: sort/reduce `memtable`, stream it through a
/// table builder, and return the resulting footer handle.
pub struct CompactionJob {
    pub partition: u32,
    pub memtable: MemTable,
    pub opts: Arc<DirOptions>,
    pub data_sink: LogSink,
    pub index_sink: LogSink,
    pub stats: Arc<IoStats>,
    pub listener: Arc<dyn EventListener>,
}

impl CompactionJob {
    #[instrument(skip(self), level = "trace", fields(partition = self.partition))]
    async fn run(self) -> Result<BlockHandle> {
        let started = Instant::now();
        trace!(partition = self.partition, entries = self.memtable.len(), "compaction starting");
        self.listener.on_event(Event::CompactionStart {
            partition: self.partition,
            micros: Event::now_micros(),
        });

        let reduced = self.memtable.into_sorted_reduced(
            self.opts.mode,
            self.opts.skip_sort,
            self.opts.paranoid_checks,
        )?;

        let mut builder = TableBuilder::new(
            &self.opts,
            self.data_sink.clone(),
            self.index_sink.clone(),
            stats::gate(self.opts.measure_writes, &self.stats),
        );
        for (key, value) in &reduced {
            builder.add(key, value).await?;
        }
        let handle = builder.finish().await?;

        self.listener.on_event(Event::CompactionEnd {
            partition: self.partition,
            micros: Event::now_micros(),
        });
        stats::record_compaction(self.partition, started.elapsed());
        debug!(partition = self.partition, elapsed = ?started.elapsed(), "compaction finished");

        Ok(handle)
    }
}

/// Schedules [`CompactionJob`]s per spec.md §4.4's scheduling model: onto
/// `compaction_pool` if set, otherwise synchronously on the caller.
///
/// `allow_env_threads` names the case where the default environment's own
/// scheduler may be used instead of a dedicated pool; this crate has no
/// such default scheduler of its own, so that case also runs synchronously
/// on the caller's task.
#[derive(Clone)]
pub struct Compactor {
    pool: Option<Arc<dyn ThreadPool>>,
}

impl Compactor {
    pub fn new(pool: Option<Arc<dyn ThreadPool>>) -> Self {
        Self { pool }
    }

    pub async fn run(&self, job: CompactionJob) -> Result<BlockHandle> {
        match &self.pool {
            Some(pool) => {
                let pool = pool.clone();
                let rt = tokio::runtime::Handle::current();
                let (tx, rx) = tokio::sync::oneshot::channel();
                pool.schedule(Box::new(move || {
                    let result = rt.block_on(job.run());
                    let _ = tx.send(result);
                }));
                rx.await.map_err(|_| Error::AssertionFailed {
                    reason: "compaction worker dropped its result".into(),
                })?
            }
            None => job.run().await,
        }
    }
}

struct Inner {
    mutable: MemTable,
    /// Whether the immutable slot is occupied by a rotated-out memtable
    /// awaiting or undergoing compaction. The rotated memtable's data is
    /// handed directly to a [`CompactionJob`] rather than stored here;
    /// this is purely an occupancy flag.
    immutable_occupied: bool,
    /// `epoch_tables[e]` is this partition's footer handle for epoch `e`,
    /// once its compaction has completed. `None` while still pending.
    epoch_tables: Vec<Option<BlockHandle>>,
}

/// Per-partition pipeline state: the open memtable, the single in-flight
/// compaction slot, and the per-epoch table handles accumulated so far.
pub struct PartitionState {
    inner: Mutex<Inner>,
    slot: Semaphore,
    notify: Notify,
}

impl PartitionState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                mutable: MemTable::new(),
                immutable_occupied: false,
                epoch_tables: Vec::new(),
            }),
            slot: Semaphore::new(1),
            notify: Notify::new(),
        }
    }

    pub fn add(&self, key: &[u8], value: &[u8]) {
        self.inner.lock().mutable.add(key, value);
    }

    pub fn mutable_bytes(&self) -> usize {
        self.inner.lock().mutable.approx_bytes()
    }

    pub fn has_room(&self) -> bool {
        !self.inner.lock().immutable_occupied
    }

    /// Rotates the mutable memtable out, even if empty, so the manifest
    /// still records an epoch boundary. Returns `None` if the immutable
    /// slot is already occupied (caller must wait).
    pub fn try_rotate(&self) -> Option<MemTable> {
        let mut inner = self.inner.lock();
        if inner.immutable_occupied {
            return None;
        }
        let rotated = std::mem::replace(&mut inner.mutable, MemTable::new());
        inner.immutable_occupied = true;
        Some(rotated)
    }

    pub fn clear_immutable(&self) {
        self.inner.lock().immutable_occupied = false;
    }

    pub fn record_table(&self, epoch: u32, handle: BlockHandle) {
        let mut inner = self.inner.lock();
        let epoch = epoch as usize;
        if inner.epoch_tables.len() <= epoch {
            inner.epoch_tables.resize(epoch + 1, None);
        }
        inner.epoch_tables[epoch] = Some(handle);
    }

    pub fn table_for_epoch(&self, epoch: u32) -> Option<BlockHandle> {
        self.inner.lock().epoch_tables.get(epoch as usize).copied().flatten()
    }

    pub fn num_epochs(&self) -> usize {
        self.inner.lock().epoch_tables.len()
    }

    /// Acquires this partition's single compaction slot; blocks the caller
    /// if a job is already in flight (spec.md §5: "at most one job per
    /// partition is in flight").
    pub async fn acquire_slot(&self) -> tokio::sync::SemaphorePermit<'_> {
        self.slot.acquire().await.expect("slot semaphore never closed")
    }

    pub fn notify_done(&self) {
        self.notify.notify_waiters();
    }

    pub async fn wait_for_done(&self) {
        self.notify.notified().await;
    }

    /// Whether a compaction is currently in flight for this partition. The
    /// immutable slot is occupied for exactly the lifetime of one
    /// outstanding job, so this doubles as the "is busy" check
    /// `WaitForOne`/`Wait` use.
    pub fn is_busy(&self) -> bool {
        !self.has_room()
    }
}

impl Default for PartitionState {
    fn default() -> Self {
        Self::new()
    }
}
