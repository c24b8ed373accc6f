//! Event notifications for compaction and I/O activity (spec.md §4.7).
//!
//! A single trait with one enum parameter, covering the four event kinds
//! spec.md §4.7 defines, in place of a virtual-base-class-per-event-kind
//! design.

use std::time::{SystemTime, UNIX_EPOCH};

/// A notification delivered to a configured [`EventListener`].
///
/// Carries a partition index for compaction events and a microsecond
/// timestamp on every event, matching spec.md §4.7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    CompactionStart { partition: u32, micros: u64 },
    CompactionEnd { partition: u32, micros: u64 },
    IoStart { micros: u64 },
    IoEnd { micros: u64 },
}

impl Event {
    /// Microseconds since the Unix epoch, used to stamp every event this
    /// module emits.
    pub fn now_micros() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64
    }
}

/// Receives [`Event`] notifications as they occur.
///
/// Implementations must not block: the engine invokes `on_event` from
/// whatever context (compaction worker thread, or the caller's own task)
/// produced the event, and does not serialize or buffer calls on the
/// listener's behalf.
pub trait EventListener: Send + Sync + std::fmt::Debug {
    fn on_event(&self, event: Event);
}

/// An [`EventListener`] that discards every event; the default when no
/// listener is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventListener;

impl EventListener for NullEventListener {
    fn on_event(&self, _event: Event) {}
}
