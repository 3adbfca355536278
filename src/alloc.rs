use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::detector::{self, ReallocOutcome};
use crate::os::preserve_errno;
use crate::table::{BlockId, HeapTag};

/// A [`GlobalAlloc`] wrapper which reports every allocation and
/// deallocation of the wrapped allocator to the attached detector.
///
/// Until a detector is attached with [`crate::attach`] (and again after
/// [`crate::detach`]) it only forwards.
///
/// ## Example
///
/// ```rust
/// use leakwatch::LeakwatchAllocator;
///
/// #[global_allocator]
/// static ALLOCATOR: LeakwatchAllocator = LeakwatchAllocator::init();
/// ```
pub struct LeakwatchAllocator<A = System> {
    inner: A,
    allocated: AtomicUsize,
}

impl LeakwatchAllocator {
    /// Creates a new [`LeakwatchAllocator`] over the [`System`] allocator.
    pub const fn init() -> Self {
        Self::with_allocator(System)
    }
}

impl<A> LeakwatchAllocator<A> {
    /// Creates a new [`LeakwatchAllocator`] over `inner`.
    pub const fn with_allocator(inner: A) -> Self {
        LeakwatchAllocator {
            inner,
            allocated: AtomicUsize::new(0),
        }
    }

    /// Returns the number of bytes currently allocated through this allocator,
    /// tracked or not.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    fn allocated_block(&self, ptr: *mut u8, size: usize) {
        if !ptr.is_null() {
            self.allocated.fetch_add(size, Ordering::Relaxed);
            preserve_errno(|| detector::on_alloc(block(ptr), size));
        }
    }
}

fn block(ptr: *mut u8) -> BlockId {
    BlockId::new(HeapTag::RUST, ptr as usize)
}

unsafe impl<A: GlobalAlloc> GlobalAlloc for LeakwatchAllocator<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.inner.alloc(layout) };
        self.allocated_block(ptr, layout.size());
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.inner.alloc_zeroed(layout) };
        self.allocated_block(ptr, layout.size());
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if !ptr.is_null() {
            self.allocated.fetch_sub(layout.size(), Ordering::Relaxed);
            preserve_errno(|| detector::on_free(block(ptr)));
        }
        unsafe { self.inner.dealloc(ptr, layout) };
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let ticket = preserve_errno(|| detector::begin_realloc(block(ptr)));
        let new = unsafe { self.inner.realloc(ptr, layout, new_size) };
        let outcome = if new.is_null() {
            ReallocOutcome::Failed
        } else {
            self.allocated.fetch_sub(layout.size(), Ordering::Relaxed);
            self.allocated.fetch_add(new_size, Ordering::Relaxed);
            ReallocOutcome::Moved {
                block: block(new),
                size: new_size,
            }
        };
        preserve_errno(|| detector::finish_realloc(ticket, outcome));
        new
    }
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn test_should_count_allocated_bytes() {
        let allocator = LeakwatchAllocator::init();
        let layout = Layout::from_size_align(64, 8).expect("layout");
        unsafe {
            let ptr = allocator.alloc(layout);
            assert!(!ptr.is_null());
            assert_eq!(allocator.allocated(), 64);

            let ptr = allocator.realloc(ptr, layout, 128);
            assert!(!ptr.is_null());
            assert_eq!(allocator.allocated(), 128);

            allocator.dealloc(ptr, Layout::from_size_align(128, 8).expect("layout"));
            assert_eq!(allocator.allocated(), 0);
        }
    }

    #[test]
    fn test_should_zero_memory() {
        let allocator = LeakwatchAllocator::init();
        let layout = Layout::from_size_align(32, 8).expect("layout");
        unsafe {
            let ptr = allocator.alloc_zeroed(layout);
            assert!(std::slice::from_raw_parts(ptr, 32).iter().all(|b| *b == 0));
            allocator.dealloc(ptr, layout);
        }
    }
}
