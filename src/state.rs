//! Process-wide enable switch and per-thread re-entrancy bookkeeping.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

thread_local! {
    /// Depth of tracking logic currently running on this thread.
    static DEPTH: Cell<u32> = const { Cell::new(0) };
    /// Nested user suppressions on this thread.
    static SUPPRESSED: Cell<u32> = const { Cell::new(0) };
    /// Lazily assigned identity of this thread, `0` until first observed.
    static THREAD_ID: Cell<u64> = const { Cell::new(0) };
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of an allocating thread.
///
/// Assigned the first time the detector observes a thread; ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ThreadId(pub u64);

impl ThreadId {
    /// Returns the id of the calling thread.
    pub fn current() -> Self {
        THREAD_ID.with(|id| {
            if id.get() == 0 {
                id.set(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed));
            }
            ThreadId(id.get())
        })
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The `Enabled`/`Disabled` switch.
#[derive(Debug)]
pub struct TrackingState {
    enabled: AtomicBool,
}

impl TrackingState {
    pub const fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Whether an allocation on the calling thread should get a record.
    pub fn should_track(&self) -> bool {
        self.is_enabled() && SUPPRESSED.with(Cell::get) == 0
    }
}

/// RAII marker for "tracking logic is running on this thread".
///
/// While one is alive, intercepted calls on the same thread are forwarded
/// without being tracked.
pub(crate) struct ReentrancyGuard(());

impl ReentrancyGuard {
    /// Enters tracking logic unless this thread is already inside it.
    pub(crate) fn try_enter() -> Option<Self> {
        DEPTH.with(|depth| {
            if depth.get() > 0 {
                None
            } else {
                depth.set(1);
                Some(Self(()))
            }
        })
    }

    /// Enters tracking logic, nesting if already inside.
    pub(crate) fn enter() -> Self {
        DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self(())
    }

    /// Returns whether the calling thread is inside tracking logic.
    #[cfg(test)]
    pub(crate) fn is_held() -> bool {
        DEPTH.with(Cell::get) > 0
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Suppresses tracking of new allocations on the current thread while alive.
///
/// Suppressions nest. Frees keep being honoured.
#[must_use = "tracking resumes as soon as the suppression is dropped"]
pub struct Suppression {
    // !Send: the counter belongs to the creating thread
    _thread: std::marker::PhantomData<*const ()>,
}

impl Suppression {
    pub(crate) fn new() -> Self {
        SUPPRESSED.with(|count| count.set(count.get() + 1));
        Self {
            _thread: std::marker::PhantomData,
        }
    }
}

impl Drop for Suppression {
    fn drop(&mut self) {
        SUPPRESSED.with(|count| count.set(count.get().saturating_sub(1)));
    }
}
