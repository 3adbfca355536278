//! Replacements for the C runtime's `malloc` family.
//!
//! Each thunk has the exact signature of the function it replaces, forwards
//! to the recorded original (or to the process's libc if none was recorded)
//! and reports the block to the attached detector. `errno` is preserved
//! across the tracking side effects.

use std::sync::atomic::{AtomicUsize, Ordering};

use libc::{c_void, size_t};

use super::ModulePatchEntry;
use crate::detector::{self, ReallocOutcome};
use crate::os::preserve_errno;
use crate::table::{BlockId, HeapTag};

/// Export module name the C runtime imports are bound to.
#[cfg(target_os = "linux")]
pub const EXPORT_MODULE: &str = "libc.so.6";
#[cfg(not(target_os = "linux"))]
pub const EXPORT_MODULE: &str = "libc";

type MallocFn = unsafe extern "C" fn(size_t) -> *mut c_void;
type CallocFn = unsafe extern "C" fn(size_t, size_t) -> *mut c_void;
type ReallocFn = unsafe extern "C" fn(*mut c_void, size_t) -> *mut c_void;
type FreeFn = unsafe extern "C" fn(*mut c_void);

static MALLOC: AtomicUsize = AtomicUsize::new(0);
static CALLOC: AtomicUsize = AtomicUsize::new(0);
static REALLOC: AtomicUsize = AtomicUsize::new(0);
static FREE: AtomicUsize = AtomicUsize::new(0);

/// The patch table intercepting `malloc`, `calloc`, `realloc` and `free`.
pub fn patch_table() -> Vec<ModulePatchEntry> {
    vec![
        ModulePatchEntry::new(
            EXPORT_MODULE,
            "malloc",
            &MALLOC,
            tracked_malloc as *const () as usize,
        ),
        ModulePatchEntry::new(
            EXPORT_MODULE,
            "calloc",
            &CALLOC,
            tracked_calloc as *const () as usize,
        ),
        ModulePatchEntry::new(
            EXPORT_MODULE,
            "realloc",
            &REALLOC,
            tracked_realloc as *const () as usize,
        ),
        ModulePatchEntry::new(
            EXPORT_MODULE,
            "free",
            &FREE,
            tracked_free as *const () as usize,
        ),
    ]
}

/// Loads a recorded original as a function pointer of type `F`.
fn original<F: Copy>(slot: &AtomicUsize) -> Option<F> {
    debug_assert_eq!(std::mem::size_of::<F>(), std::mem::size_of::<usize>());
    let address = slot.load(Ordering::Acquire);
    (address != 0).then(|| unsafe { std::mem::transmute_copy::<usize, F>(&address) })
}

fn block(ptr: *mut c_void) -> BlockId {
    BlockId::new(HeapTag::CRT, ptr as usize)
}

/// Replacement for `malloc`.
///
/// # Safety
///
/// Same contract as `malloc`.
pub unsafe extern "C" fn tracked_malloc(size: size_t) -> *mut c_void {
    let malloc: MallocFn = original(&MALLOC).unwrap_or(libc::malloc);
    let ptr = unsafe { malloc(size) };
    if !ptr.is_null() {
        preserve_errno(|| detector::on_alloc(block(ptr), size));
    }
    ptr
}

/// Replacement for `calloc`.
///
/// # Safety
///
/// Same contract as `calloc`.
pub unsafe extern "C" fn tracked_calloc(count: size_t, size: size_t) -> *mut c_void {
    let calloc: CallocFn = original(&CALLOC).unwrap_or(libc::calloc);
    let ptr = unsafe { calloc(count, size) };
    if !ptr.is_null() {
        preserve_errno(|| detector::on_alloc(block(ptr), count.saturating_mul(size)));
    }
    ptr
}

/// Replacement for `realloc`.
///
/// # Safety
///
/// Same contract as `realloc`.
pub unsafe extern "C" fn tracked_realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    let realloc: ReallocFn = original(&REALLOC).unwrap_or(libc::realloc);
    if ptr.is_null() {
        let new = unsafe { realloc(ptr, size) };
        if !new.is_null() {
            preserve_errno(|| detector::on_alloc(block(new), size));
        }
        return new;
    }

    let ticket = preserve_errno(|| detector::begin_realloc(block(ptr)));
    let new = unsafe { realloc(ptr, size) };
    let outcome = match (new.is_null(), size) {
        (false, _) => ReallocOutcome::Moved {
            block: block(new),
            size,
        },
        // realloc(p, 0) may release p and return null
        (true, 0) => ReallocOutcome::Released,
        (true, _) => ReallocOutcome::Failed,
    };
    preserve_errno(|| detector::finish_realloc(ticket, outcome));
    new
}

/// Replacement for `free`.
///
/// # Safety
///
/// Same contract as `free`.
pub unsafe extern "C" fn tracked_free(ptr: *mut c_void) {
    let free: FreeFn = original(&FREE).unwrap_or(libc::free);
    if !ptr.is_null() {
        preserve_errno(|| detector::on_free(block(ptr)));
    }
    unsafe { free(ptr) }
}
