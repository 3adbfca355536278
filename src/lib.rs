#![crate_name = "leakwatch"]
#![crate_type = "lib"]

//! # Leakwatch
//!
//! A runtime memory-leak detector: it intercepts the allocations of a running
//! process, keeps a record with the call stack of every block still alive and
//! reports the blocks that were never freed.
//!
//! ## Introduction
//!
//! Leakwatch sits between the program and its allocators. The
//! [`LeakwatchAllocator`] wraps the Rust global allocator, and the
//! [`patch`] module rebinds the `malloc` family imported by foreign modules
//! to replacement thunks. Every intercepted call is forwarded unchanged to
//! the real allocator, and the attached [`Detector`] keeps one
//! [`AllocationRecord`] per live block.
//!
//! When asked, the detector groups the live blocks by call stack, resolves
//! the stacks to symbols and reports each distinct leak once, with the number
//! of blocks and bytes it holds.
//!
//! ## Usage
//!
//! ### Cargo.toml
//!
//! ```toml
//! [dependencies]
//! leakwatch = "0.1"
//! ```
//!
//! ### Setup
//!
//! **Set the allocator** to [`LeakwatchAllocator`] and **attach** a detector
//! at the beginning of `main`:
//!
//! ```rust,no_run
//! use leakwatch::{Config, LeakwatchAllocator};
//!
//! #[global_allocator]
//! static ALLOCATOR: LeakwatchAllocator = LeakwatchAllocator::init();
//!
//! fn main() {
//!     leakwatch::attach(Config::default()).expect("attach leak detector");
//!
//!     let leaked = Box::leak(vec![0u8; 60].into_boxed_slice());
//!     leaked[0] = 1;
//!
//!     // writes the report through `tracing`
//!     let leaks = leakwatch::report_leaks();
//!     assert!(leaks >= 1);
//! }
//! ```
//!
//! ### Controlling the detector
//!
//! - [`enable`] / [`disable`] switch tracking of new allocations for the
//!   whole process. Frees are always honoured.
//! - [`Detector::suppress_thread`] stops tracking on the current thread only.
//! - [`leaks_count`] returns the number of leaked blocks not yet reported.
//! - [`report_leaks`] writes a report and returns the same count. Reports do
//!   not mark anything: call [`mark_all_reported`] to exclude the current
//!   leaks (say, intentionally leaked globals) from future reports.
//!
//! ### Foreign modules
//!
//! A host that loads modules calling into the C runtime hands their import
//! bindings to [`Detector::patch_module`] (or forwards loader notifications
//! to [`Interceptor::handle`]). Calls through the patched bindings reach the
//! thunks in [`patch::crt`], which forward to the real functions.
//!
//! ## Debug only
//!
//! Capturing a stack on every allocation is expensive. Leakwatch is meant
//! for debugging sessions, not for production builds.
//!

#![doc(html_playground_url = "https://play.rust-lang.org")]

mod alloc;
mod config;
mod detector;
mod error;
mod fingerprint;
mod os;
pub mod patch;
mod report;
mod stack;
mod state;
mod symbols;
mod table;

pub use self::alloc::LeakwatchAllocator;
pub use self::config::{Config, MAX_DUMP_BYTES, Unwind};
pub use self::detector::{
    Detector, ReallocOutcome, ReallocTicket, active, attach, attach_with, detach, disable, enable,
    leaks_count, mark_all_reported, report_leaks,
};
pub use self::error::{Error, Result};
pub use self::fingerprint::LeakFingerprint;
pub use self::patch::{ImportTable, Interceptor, ModuleEvent, ModuleImports, ModulePatchEntry};
pub use self::report::{LeakEntry, LeakReport, ReportWriter, TextWriter, TracingWriter};
pub use self::stack::{
    BacktraceCapture, CallStack, FrameContext, FramePointerCapture, MAX_FRAMES, StackBounds,
    StackCapture, walk_frames,
};
pub use self::state::{Suppression, ThreadId};
pub use self::symbols::{BacktraceResolver, Frame, NullResolver, SymbolInfo, SymbolResolver};
pub use self::table::{AllocationRecord, AllocationTable, BlockId, HeapTag, TableStats};
