use std::cell::Cell;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};

use parking_lot::{Mutex, MutexGuard};

use crate::stack::CallStack;
use crate::state::{ReentrancyGuard, ThreadId};

thread_local! {
    static HOLDING: Cell<bool> = const { Cell::new(false) };
}

/// Whether the calling thread currently holds a table lock.
pub(crate) fn held_by_current_thread() -> bool {
    HOLDING.with(Cell::get)
}

/// Identifies the allocator a block belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct HeapTag(pub u32);

impl HeapTag {
    /// Blocks served by the Rust global allocator.
    pub const RUST: HeapTag = HeapTag(0);
    /// Blocks served by the C runtime (`malloc` family).
    pub const CRT: HeapTag = HeapTag(1);
}

/// Identity of a live block: the owning heap and the block address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct BlockId {
    pub heap: HeapTag,
    pub address: usize,
}

impl BlockId {
    pub const fn new(heap: HeapTag, address: usize) -> Self {
        Self { heap, address }
    }
}

/// Tracking record of one outstanding allocation.
#[derive(Debug, Clone)]
pub struct AllocationRecord {
    pub block: BlockId,
    pub size: usize,
    pub thread: ThreadId,
    pub stack: CallStack,
    /// Allocation order; unique for the lifetime of the table.
    pub serial: u64,
    /// Already surfaced by a previous report.
    pub reported: bool,
}

/// Leading bytes of live blocks, by serial number.
pub(crate) type BlockContents = HashMap<u64, Box<[u8]>>;

/// Counters maintained by the [`AllocationTable`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct TableStats {
    /// Blocks ever inserted.
    pub total_blocks: u64,
    /// Bytes ever inserted.
    pub total_bytes: u64,
    /// Bytes held by live records.
    pub live_bytes: usize,
    /// High-water mark of `live_bytes`.
    pub peak_bytes: usize,
}

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<BlockId, AllocationRecord>,
    next_serial: u64,
    stats: TableStats,
}

impl Inner {
    fn put(&mut self, record: AllocationRecord) -> Option<AllocationRecord> {
        self.stats.live_bytes += record.size;
        self.stats.peak_bytes = self.stats.peak_bytes.max(self.stats.live_bytes);
        let previous = self.records.insert(record.block, record);
        if let Some(previous) = &previous {
            self.stats.live_bytes -= previous.size;
        }
        previous
    }

    fn take(&mut self, block: &BlockId) -> Option<AllocationRecord> {
        let record = self.records.remove(block)?;
        self.stats.live_bytes -= record.size;
        Some(record)
    }
}

fn untracked(block: &BlockId) {
    tracing::trace!(
        address = format_args!("{:#x}", block.address),
        heap = block.heap.0,
        "free of untracked block"
    );
}

/// A held table lock.
///
/// Anything allocated or freed while it is alive belongs to the table itself,
/// so it also holds the re-entrancy guard.
struct Locked<'a> {
    inner: MutexGuard<'a, Inner>,
    _guard: ReentrancyGuard,
}

impl Deref for Locked<'_> {
    type Target = Inner;

    fn deref(&self) -> &Inner {
        &self.inner
    }
}

impl DerefMut for Locked<'_> {
    fn deref_mut(&mut self) -> &mut Inner {
        &mut self.inner
    }
}

impl Drop for Locked<'_> {
    fn drop(&mut self) {
        HOLDING.with(|holding| holding.set(false));
    }
}

/// The set of currently outstanding tracked allocations.
///
/// Every operation holds one table-wide lock for the duration of the
/// structural change only; callers capture stacks before calling in.
#[derive(Debug, Default)]
pub struct AllocationTable {
    inner: Mutex<Inner>,
}

impl AllocationTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Locked<'_> {
        let guard = ReentrancyGuard::enter();
        let inner = self.inner.lock();
        HOLDING.with(|holding| holding.set(true));
        Locked {
            inner,
            _guard: guard,
        }
    }

    /// Records a new live block and returns its serial number.
    ///
    /// A live record for the same block means interception saw two
    /// allocations without a free in between; the old record is replaced.
    pub fn insert(&self, block: BlockId, size: usize, thread: ThreadId, stack: CallStack) -> u64 {
        let (serial, previous) = {
            let mut inner = self.lock();
            inner.next_serial += 1;
            let serial = inner.next_serial;
            inner.stats.total_blocks += 1;
            inner.stats.total_bytes += size as u64;
            let previous = inner.put(AllocationRecord {
                block,
                size,
                thread,
                stack,
                serial,
                reported: false,
            });
            (serial, previous)
        };

        if let Some(previous) = previous {
            tracing::warn!(
                address = format_args!("{:#x}", block.address),
                heap = block.heap.0,
                stale_serial = previous.serial,
                serial,
                "block inserted twice without a free, replacing stale record"
            );
        }
        serial
    }

    /// Forgets a live block. Returns `false` if it was not tracked.
    pub fn remove(&self, block: &BlockId) -> bool {
        let mut inner = self.lock();
        // the record's own memory is released while still locked
        let found = inner.take(block).is_some();
        drop(inner);
        if !found {
            untracked(block);
        }
        found
    }

    /// Forgets a live block like [`Self::remove`], without logging.
    pub(crate) fn discard(&self, block: &BlockId) -> bool {
        self.lock().take(block).is_some()
    }

    /// Removes and returns the record of a live block.
    pub fn take(&self, block: &BlockId) -> Option<AllocationRecord> {
        self.lock().take(block)
    }

    /// Puts back a record previously obtained from [`Self::take`], keeping its serial.
    pub fn restore(&self, record: AllocationRecord) {
        let mut inner = self.lock();
        if !inner.records.contains_key(&record.block) {
            inner.put(record);
        }
    }

    /// Returns every live record, ordered by serial number.
    pub fn snapshot(&self) -> Vec<AllocationRecord> {
        let mut records: Vec<_> = self.lock().records.values().cloned().collect();
        records.sort_unstable_by_key(|record| record.serial);
        records
    }

    /// Like [`Self::snapshot`], also copying up to `max_bytes` from the start
    /// of every unreported block while the lock keeps it from being freed.
    ///
    /// # Safety
    ///
    /// The address of every record must be readable for its size: records
    /// must only describe blocks whose release removes them first.
    pub(crate) unsafe fn snapshot_with_contents(
        &self,
        max_bytes: usize,
    ) -> (Vec<AllocationRecord>, BlockContents) {
        let inner = self.lock();
        let mut contents = BlockContents::new();
        for record in inner.records.values().filter(|record| !record.reported) {
            let len = record.size.min(max_bytes);
            if len == 0 || record.block.address == 0 {
                continue;
            }
            let bytes =
                unsafe { std::slice::from_raw_parts(record.block.address as *const u8, len) };
            contents.insert(record.serial, bytes.into());
        }
        let mut records: Vec<_> = inner.records.values().cloned().collect();
        drop(inner);

        records.sort_unstable_by_key(|record| record.serial);
        (records, contents)
    }

    /// Flags every live record as reported.
    pub fn mark_all_reported(&self) {
        self.lock()
            .records
            .values_mut()
            .for_each(|record| record.reported = true);
    }

    /// Flags every live record with a serial up to and including `serial` as reported.
    pub fn mark_reported_through(&self, serial: u64) {
        self.lock()
            .records
            .values_mut()
            .filter(|record| record.serial <= serial)
            .for_each(|record| record.reported = true);
    }

    /// Whether `block` currently has a record.
    pub fn contains(&self, block: &BlockId) -> bool {
        self.lock().records.contains_key(block)
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> TableStats {
        self.lock().stats
    }
}
