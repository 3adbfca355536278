//! Detector configuration.

use crate::stack::MAX_FRAMES;

/// Upper bound on the bytes dumped per leak.
pub const MAX_DUMP_BYTES: usize = 1024;

/// The technique used to walk the stack at allocation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Unwind {
    /// Unwind with the `backtrace` crate (unwind tables).
    #[default]
    Backtrace,
    /// Follow the frame-pointer chain, validating every frame against the
    /// thread's stack bounds. Falls back to [`Unwind::Backtrace`] where it is
    /// not supported.
    FramePointer,
}

/// Configuration for a [`crate::Detector`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of frames captured per allocation (default: 64)
    pub max_frames: usize,

    /// Stack walking technique
    pub unwind: Unwind,

    /// Begin in the disabled state
    pub start_disabled: bool,

    /// Merge leaks with the same call stack into one report entry
    pub aggregate_duplicates: bool,

    /// Keep the detector's and the allocator's own frames in printed stacks
    pub trace_internal_frames: bool,

    /// Resolve addresses to symbols when building a report
    pub resolve_symbols: bool,

    /// Bytes of the first leaked block printed with each leak, `0` to print none
    pub dump_data: usize,

    /// Names of modules which are never patched
    pub ignored_modules: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_frames: 64,
            unwind: Unwind::Backtrace,
            start_disabled: false,
            aggregate_duplicates: true,
            trace_internal_frames: false,
            resolve_symbols: true,
            dump_data: 0,
            ignored_modules: Vec::new(),
        }
    }
}

impl Config {
    /// Builder pattern: set the maximum captured stack depth.
    ///
    /// The value is clamped to `1..=MAX_FRAMES`.
    pub fn with_max_frames(mut self, frames: usize) -> Self {
        self.max_frames = frames.clamp(1, MAX_FRAMES);
        self
    }

    /// Builder pattern: set the unwind technique.
    pub fn with_unwind(mut self, unwind: Unwind) -> Self {
        self.unwind = unwind;
        self
    }

    /// Builder pattern: start disabled.
    pub fn with_start_disabled(mut self, disabled: bool) -> Self {
        self.start_disabled = disabled;
        self
    }

    /// Builder pattern: aggregate duplicate leaks.
    pub fn with_aggregate_duplicates(mut self, aggregate: bool) -> Self {
        self.aggregate_duplicates = aggregate;
        self
    }

    /// Builder pattern: keep internal frames in reports.
    pub fn with_trace_internal_frames(mut self, trace: bool) -> Self {
        self.trace_internal_frames = trace;
        self
    }

    /// Builder pattern: toggle symbol resolution.
    pub fn with_resolve_symbols(mut self, resolve: bool) -> Self {
        self.resolve_symbols = resolve;
        self
    }

    /// Builder pattern: dump up to `bytes` of every leak's first block.
    ///
    /// Contents are read from the live blocks, so only enable it on detectors
    /// fed by intercepted allocations. Clamped to [`MAX_DUMP_BYTES`].
    pub fn with_dump_data(mut self, bytes: usize) -> Self {
        self.dump_data = bytes.min(MAX_DUMP_BYTES);
        self
    }

    /// Builder pattern: exclude a module from interception.
    pub fn with_ignored_module(mut self, module: impl Into<String>) -> Self {
        self.ignored_modules.push(module.into());
        self
    }
}
