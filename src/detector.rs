//! The detector context and its process-wide lifecycle.

use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use parking_lot::Mutex;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::patch::{ImportTable, Interceptor, ModulePatchEntry};
use crate::report::{self, BuildOptions, LeakReport, ReportWriter, TracingWriter};
use crate::stack::{self, StackCapture};
use crate::state::{ReentrancyGuard, Suppression, ThreadId, TrackingState};
use crate::symbols::{BacktraceResolver, SymbolResolver};
use crate::table::{self, AllocationRecord, AllocationTable, BlockContents, BlockId, TableStats};

/// A leak detector: tracking state, allocation table and reporting.
///
/// One instance is attached to the process with [`attach`] and receives the
/// intercepted traffic. Further instances can be created with
/// [`Detector::new`] and fed directly, which is how the engine is tested.
pub struct Detector {
    config: Config,
    state: TrackingState,
    table: AllocationTable,
    capturer: Box<dyn StackCapture>,
    resolver: Box<dyn SymbolResolver>,
    writer: Mutex<Box<dyn ReportWriter>>,
    interceptor: Interceptor,
    /// Set by [`detach`]: frees are no longer seen, so block contents can not be read.
    detached: AtomicBool,
}

/// What a reallocation did with the old block.
#[derive(Debug, Clone, Copy)]
pub enum ReallocOutcome {
    /// The contents now live in `block`; the old block is gone.
    Moved { block: BlockId, size: usize },
    /// The reallocation failed; the old block is still live.
    Failed,
    /// The old block was released and nothing was returned.
    Released,
}

/// State carried across a reallocation, from [`Detector::begin_realloc`] to
/// [`Detector::finish_realloc`].
#[must_use]
pub struct ReallocTicket {
    record: Option<AllocationRecord>,
    bypass: bool,
}

impl ReallocTicket {
    fn bypass() -> Self {
        Self {
            record: None,
            bypass: true,
        }
    }
}

impl Detector {
    pub fn new(config: Config) -> Self {
        let interceptor = Interceptor::new(default_patch_table(), config.ignored_modules.clone());
        Self {
            state: TrackingState::new(!config.start_disabled),
            table: AllocationTable::new(),
            capturer: stack::capturer_for(config.unwind),
            resolver: Box::new(BacktraceResolver),
            writer: Mutex::new(Box::new(TracingWriter)),
            interceptor,
            detached: AtomicBool::new(false),
            config,
        }
    }

    /// Replaces the stack capturer.
    pub fn with_capturer(mut self, capturer: impl StackCapture + 'static) -> Self {
        self.capturer = Box::new(capturer);
        self
    }

    /// Replaces the symbol resolver used by reports.
    pub fn with_resolver(mut self, resolver: impl SymbolResolver + 'static) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    /// Replaces the destination of [`Detector::report_leaks`].
    pub fn with_writer(self, writer: impl ReportWriter + 'static) -> Self {
        *self.writer.lock() = Box::new(writer);
        self
    }

    /// Replaces the patch table installed by [`Detector::patch_module`].
    pub fn with_patch_table(mut self, entries: Vec<ModulePatchEntry>) -> Self {
        self.interceptor = Interceptor::new(entries, self.config.ignored_modules.clone());
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Resumes tracking of new allocations.
    pub fn enable(&self) {
        self.state.enable();
    }

    /// Stops tracking new allocations. Frees of tracked blocks are still honoured.
    pub fn disable(&self) {
        self.state.disable();
    }

    pub fn is_enabled(&self) -> bool {
        self.state.is_enabled()
    }

    /// Stops tracking new allocations made by the current thread until the
    /// returned guard is dropped.
    pub fn suppress_thread(&self) -> Suppression {
        Suppression::new()
    }

    /// Records a new block, unless tracking is off or the caller is the
    /// detector itself. Returns the serial number of the new record.
    pub fn track_alloc(&self, block: BlockId, size: usize) -> Option<u64> {
        let _guard = ReentrancyGuard::try_enter()?;
        if !self.state.should_track() {
            return None;
        }
        let stack = self.capturer.capture(self.config.max_frames);
        Some(self.table.insert(block, size, ThreadId::current(), stack))
    }

    /// Forgets a freed block. Returns whether it was tracked.
    pub fn track_free(&self, block: BlockId) -> bool {
        // only ever untracked blocks are freed while the table is locked
        if table::held_by_current_thread() {
            return false;
        }
        match ReentrancyGuard::try_enter() {
            Some(_guard) => self.table.remove(&block),
            // released by the detector's own logging or reporting
            None => self.table.discard(&block),
        }
    }

    /// Takes the record of a block about to be reallocated.
    ///
    /// Must run before the real reallocation, so a concurrent allocation
    /// reusing the old address can not be mistaken for it.
    pub fn begin_realloc(&self, block: BlockId) -> ReallocTicket {
        if table::held_by_current_thread() {
            return ReallocTicket::bypass();
        }
        let _guard = ReentrancyGuard::enter();
        ReallocTicket {
            record: self.table.take(&block),
            bypass: false,
        }
    }

    /// Completes a reallocation started with [`Detector::begin_realloc`].
    ///
    /// A tracked block stays tracked when it moves, under a new serial and the
    /// current stack. A block that was not tracked is treated as a new allocation.
    pub fn finish_realloc(&self, ticket: ReallocTicket, outcome: ReallocOutcome) {
        if ticket.bypass {
            return;
        }

        match (outcome, ticket.record) {
            (ReallocOutcome::Moved { block, size }, Some(record)) => {
                let _guard = ReentrancyGuard::enter();
                let stack = self.capturer.capture(self.config.max_frames);
                self.table.insert(block, size, ThreadId::current(), stack);
                drop(record);
            }
            (ReallocOutcome::Moved { block, size }, None) => {
                self.track_alloc(block, size);
            }
            (ReallocOutcome::Failed, Some(record)) => {
                let _guard = ReentrancyGuard::enter();
                self.table.restore(record);
            }
            (_, record) => {
                let _guard = ReentrancyGuard::enter();
                drop(record);
            }
        }
    }

    /// Number of leaked blocks not yet marked as reported.
    pub fn leaks_count(&self) -> usize {
        let _guard = ReentrancyGuard::enter();
        report::count(&self.table.snapshot())
    }

    /// Builds a report of the leaked blocks not yet marked as reported.
    ///
    /// Reporting does not mark anything: calling it twice reports the same
    /// leaks twice.
    pub fn leak_report(&self) -> LeakReport {
        let _guard = ReentrancyGuard::enter();
        let (records, contents) =
            if self.config.dump_data > 0 && !self.detached.load(Ordering::Acquire) {
                // SAFETY: records of intercepted blocks leave the table before their memory does
                unsafe { self.table.snapshot_with_contents(self.config.dump_data) }
            } else {
                (self.table.snapshot(), BlockContents::new())
            };
        report::build_with_contents(
            &records,
            &contents,
            self.table.stats(),
            self.resolver.as_ref(),
            BuildOptions {
                aggregate_duplicates: self.config.aggregate_duplicates,
                trace_internal_frames: self.config.trace_internal_frames,
                resolve_symbols: self.config.resolve_symbols,
            },
        )
    }

    /// Writes a report to the configured writer and returns the number of leaked blocks.
    ///
    /// Whatever the writer allocates is not tracked.
    pub fn report_leaks(&self) -> usize {
        let _guard = ReentrancyGuard::enter();
        let report = self.leak_report();
        self.writer.lock().write_report(&report);
        report.leak_count()
    }

    /// Writes a report to `writer` and returns the number of leaked blocks.
    pub fn report_leaks_to(&self, writer: &mut dyn ReportWriter) -> usize {
        let _guard = ReentrancyGuard::enter();
        let report = self.leak_report();
        writer.write_report(&report);
        report.leak_count()
    }

    /// Excludes every currently live block from future reports.
    pub fn mark_all_reported(&self) {
        let _guard = ReentrancyGuard::enter();
        self.table.mark_all_reported();
    }

    /// Excludes live blocks with a serial up to `serial` from future reports.
    pub fn mark_reported_through(&self, serial: u64) {
        let _guard = ReentrancyGuard::enter();
        self.table.mark_reported_through(serial);
    }

    /// Every live tracked record, in serial order.
    pub fn snapshot(&self) -> Vec<AllocationRecord> {
        let _guard = ReentrancyGuard::enter();
        self.table.snapshot()
    }

    pub fn stats(&self) -> TableStats {
        self.table.stats()
    }

    pub fn interceptor(&self) -> &Interceptor {
        &self.interceptor
    }

    /// Routes the module's allocator imports through the replacement thunks.
    pub fn patch_module(&self, module: Arc<dyn ImportTable>) -> Result<usize> {
        let _guard = ReentrancyGuard::enter();
        self.interceptor.patch_module(module)
    }

    /// Restores the module's original allocator imports.
    pub fn restore_module(&self, name: &str) -> bool {
        let _guard = ReentrancyGuard::enter();
        self.interceptor.restore_module(name)
    }
}

#[cfg(unix)]
fn default_patch_table() -> Vec<ModulePatchEntry> {
    crate::patch::crt::patch_table()
}

#[cfg(not(unix))]
fn default_patch_table() -> Vec<ModulePatchEntry> {
    Vec::new()
}

static ACTIVE: AtomicPtr<Detector> = AtomicPtr::new(ptr::null_mut());
static LIFECYCLE: Mutex<()> = Mutex::new(());

/// Attaches a detector built from `config` to the process.
///
/// From now on every intercepted allocation is reported to it. The detector
/// lives for the rest of the process, even after [`detach`], since
/// intercepted calls already in flight may still be using it.
pub fn attach(config: Config) -> Result<&'static Detector> {
    attach_with(Detector::new(config))
}

/// Attaches `detector` to the process, with whatever capturer, resolver and
/// writer it was built with. See [`attach`].
pub fn attach_with(detector: Detector) -> Result<&'static Detector> {
    let _lifecycle = LIFECYCLE.lock();
    if !ACTIVE.load(Ordering::Acquire).is_null() {
        return Err(Error::AlreadyAttached);
    }

    let detector: &'static Detector = Box::leak(Box::new(detector));
    ACTIVE.store(ptr::from_ref(detector).cast_mut(), Ordering::Release);
    tracing::debug!(
        enabled = detector.is_enabled(),
        max_frames = detector.config.max_frames,
        "leak detector attached"
    );
    Ok(detector)
}

/// Detaches the attached detector: patched modules are restored and
/// intercepted calls stop being tracked.
pub fn detach() -> Result<()> {
    let _lifecycle = LIFECYCLE.lock();
    let detector = active().ok_or(Error::NotAttached)?;

    detector.interceptor.restore_all();
    detector.disable();
    detector.detached.store(true, Ordering::Release);
    ACTIVE.store(ptr::null_mut(), Ordering::Release);
    tracing::debug!("leak detector detached");
    Ok(())
}

/// The attached detector, if any.
pub fn active() -> Option<&'static Detector> {
    // SAFETY: only ever set from a leaked box, never freed
    unsafe { ACTIVE.load(Ordering::Acquire).as_ref() }
}

/// Resumes tracking on the attached detector.
pub fn enable() {
    if let Some(detector) = active() {
        detector.enable();
    }
}

/// Stops tracking new allocations on the attached detector.
pub fn disable() {
    if let Some(detector) = active() {
        detector.disable();
    }
}

/// Number of unreported leaked blocks on the attached detector, `0` when detached.
pub fn leaks_count() -> usize {
    active().map_or(0, Detector::leaks_count)
}

/// Reports the attached detector's leaks to its writer, returning how many blocks leaked.
pub fn report_leaks() -> usize {
    active().map_or(0, Detector::report_leaks)
}

/// Marks every leak of the attached detector as reported.
pub fn mark_all_reported() {
    if let Some(detector) = active() {
        detector.mark_all_reported();
    }
}

pub(crate) fn on_alloc(block: BlockId, size: usize) {
    if let Some(detector) = active() {
        detector.track_alloc(block, size);
    }
}

pub(crate) fn on_free(block: BlockId) {
    if let Some(detector) = active() {
        detector.track_free(block);
    }
}

pub(crate) fn begin_realloc(block: BlockId) -> Option<(&'static Detector, ReallocTicket)> {
    active().map(|detector| (detector, detector.begin_realloc(block)))
}

pub(crate) fn finish_realloc(
    ticket: Option<(&'static Detector, ReallocTicket)>,
    outcome: ReallocOutcome,
) {
    match (ticket, outcome) {
        (Some((detector, ticket)), outcome) => detector.finish_realloc(ticket, outcome),
        // attached in between: the old block was never seen
        (None, ReallocOutcome::Moved { block, size }) => on_alloc(block, size),
        (None, _) => {}
    }
}
