//! Background execution for compaction and parallel reads (spec.md §5.2,
//! REDESIGN FLAGS).
//!
//! Compaction is CPU-bound sort-and-serialize work rather than async I/O, so
//! it is scheduled onto a `rayon`-backed pool instead of the ambient Tokio
//! runtime, behind a small trait so an embedder can substitute its own pool
//! or run everything inline.

use std::fmt;

/// A place to run CPU-bound background work.
///
/// Implementations must guarantee that `schedule`d closures eventually run,
/// even if the caller never calls `join`; `join` exists purely as a
/// barrier for tests and for `DirWriter::wait`/`wait_for_one`.
pub trait ThreadPool: Send + Sync + fmt::Debug {
    /// Submits `job` for execution, returning immediately.
    fn schedule(&self, job: Box<dyn FnOnce() + Send + 'static>);

    /// Blocks until every previously scheduled job has completed.
    fn join(&self);
}

/// A [`ThreadPool`] backed by a dedicated `rayon::ThreadPool`.
pub struct RayonThreadPool {
    inner: rayon::ThreadPool,
}

impl fmt::Debug for RayonThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RayonThreadPool")
            .field("num_threads", &self.inner.current_num_threads())
            .finish()
    }
}

impl RayonThreadPool {
    /// Builds a pool with `num_threads` workers (0 lets rayon pick a
    /// default based on the number of available cores).
    pub fn new(num_threads: usize) -> Result<Self, rayon::ThreadPoolBuildError> {
        let inner = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("epochlog-compact-{i}"))
            .build()?;
        Ok(Self { inner })
    }
}

impl ThreadPool for RayonThreadPool {
    fn schedule(&self, job: Box<dyn FnOnce() + Send + 'static>) {
        self.inner.spawn(job);
    }

    fn join(&self) {
        // rayon has no "wait for all outstanding spawns" primitive, so
        // round-trip a no-op through `install` after a `broadcast`, which
        // only returns once every worker thread has drained its queue.
        self.inner.broadcast(|_| {});
    }
}

/// A [`ThreadPool`] that runs every job synchronously on the calling
/// thread, for single-threaded embedders and deterministic tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineThreadPool;

impl ThreadPool for InlineThreadPool {
    fn schedule(&self, job: Box<dyn FnOnce() + Send + 'static>) {
        job();
    }

    fn join(&self) {}
}
