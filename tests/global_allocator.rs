//! End-to-end checks with the detector attached behind the global allocator.
//!
//! Runs without the test harness: the harness allocates on its own threads,
//! and everything here shares one process-wide detector. Blocks are told apart
//! by their unusual sizes.

use std::collections::BTreeSet;
use std::sync::Arc;

use leakwatch::{
    AllocationRecord, BlockId, Config, Detector, Error, HeapTag, LeakReport, LeakwatchAllocator,
    ReportWriter, TextWriter,
};
use parking_lot::Mutex;

#[global_allocator]
static ALLOCATOR: LeakwatchAllocator = LeakwatchAllocator::init();

fn main() {
    // stdout buffers are allocated on first use
    println!("running global allocator checks");

    let detector = leakwatch::attach(Config::default().with_dump_data(32)).expect("attach");
    assert!(matches!(
        leakwatch::attach(Config::default()),
        Err(Error::AlreadyAttached)
    ));
    detector.mark_all_reported();

    should_group_leaks_from_same_site(detector);
    should_not_count_freed_blocks(detector);
    should_report_only_leaks_after_mark(detector);
    should_not_track_while_disabled(detector);
    should_follow_reallocated_block(detector);
    should_tolerate_double_free(detector);
    should_track_leaks_of_every_thread(detector);
    #[cfg(unix)]
    should_track_patched_crt_imports(detector);
    should_stop_tracking_after_detach(detector);
    should_attach_detector_with_custom_writer();

    println!("global allocator checks passed");
}

fn unreported(detector: &Detector, heap: HeapTag, size: usize) -> Vec<AllocationRecord> {
    detector
        .snapshot()
        .into_iter()
        .filter(|r| !r.reported && r.block.heap == heap && r.size == size)
        .collect()
}

#[inline(never)]
fn leak(size: usize) {
    let block = Box::leak(vec![0xA5u8; size].into_boxed_slice());
    std::hint::black_box(block);
}

fn should_group_leaks_from_same_site(detector: &Detector) {
    for _ in 0..3 {
        leak(61);
    }
    let records = unreported(detector, HeapTag::RUST, 61);
    assert_eq!(records.len(), 3);

    let report = detector.leak_report();
    let entry = report
        .entries
        .iter()
        .find(|entry| entry.serials.contains(&records[0].serial))
        .expect("leak entry");
    assert_eq!(entry.occurrences(), 3);
    assert_eq!(entry.total_bytes, 183);
    assert!(!entry.frames.is_empty());
    // the detector, errno and allocator frames are hidden
    let top = &entry.frames[0];
    assert!(!top.is_internal());
    assert!(
        top.symbol
            .as_ref()
            .is_none_or(|symbol| !symbol.function.starts_with("leakwatch::")),
        "internal frame on top: {top}"
    );
    assert_eq!(entry.contents, vec![0xA5u8; 32]);
    println!("{entry}");
}

fn should_not_count_freed_blocks(detector: &Detector) {
    let kept: Vec<_> = (0..10).map(|_| vec![1u8; 63]).collect();
    assert_eq!(unreported(detector, HeapTag::RUST, 63).len(), 10);
    drop(kept);
    assert!(unreported(detector, HeapTag::RUST, 63).is_empty());
}

fn should_report_only_leaks_after_mark(detector: &Detector) {
    leak(67);
    detector.mark_all_reported();
    leak(71);
    assert!(unreported(detector, HeapTag::RUST, 67).is_empty());
    assert_eq!(unreported(detector, HeapTag::RUST, 71).len(), 1);

    // writing a report allocates, untracked
    let before = detector.stats();
    let mut writer = TextWriter::new(Vec::new());
    assert!(detector.report_leaks_to(&mut writer) >= 1);
    assert!(!writer.into_inner().is_empty());
    assert_eq!(detector.stats().total_blocks, before.total_blocks);

    // reporting does not mark
    let first = detector.report_leaks();
    let second = detector.report_leaks();
    assert!(first >= 1);
    assert_eq!(unreported(detector, HeapTag::RUST, 71).len(), 1);
    assert!(second >= 1);
}

fn should_not_track_while_disabled(detector: &Detector) {
    leakwatch::disable();
    assert!(!detector.is_enabled());
    leak(73);
    leakwatch::enable();
    leak(79);
    assert!(unreported(detector, HeapTag::RUST, 73).is_empty());
    assert_eq!(unreported(detector, HeapTag::RUST, 79).len(), 1);

    {
        let _quiet = detector.suppress_thread();
        leak(81);
    }
    assert!(unreported(detector, HeapTag::RUST, 81).is_empty());
}

fn should_follow_reallocated_block(detector: &Detector) {
    let mut buffer: Vec<u8> = Vec::with_capacity(109);
    assert_eq!(unreported(detector, HeapTag::RUST, 109).len(), 1);
    buffer.reserve_exact(113);
    assert!(unreported(detector, HeapTag::RUST, 109).is_empty());
    assert_eq!(unreported(detector, HeapTag::RUST, 113).len(), 1);
    drop(buffer);
    assert!(unreported(detector, HeapTag::RUST, 113).is_empty());
}

fn should_tolerate_double_free(detector: &Detector) {
    let block = BlockId::new(HeapTag(7), 0x7000);
    assert!(detector.track_alloc(block, 8).is_some());
    assert!(detector.track_free(block));
    assert!(!detector.track_free(block));
    assert!(unreported(detector, HeapTag(7), 8).is_empty());
}

fn should_track_leaks_of_every_thread(detector: &Detector) {
    let handles: Vec<_> = (0..4)
        .map(|_| {
            std::thread::spawn(|| {
                leak(103);
                leak(103);
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("thread panicked");
    }

    let records = unreported(detector, HeapTag::RUST, 103);
    assert_eq!(records.len(), 8);
    let threads: BTreeSet<_> = records.iter().map(|r| r.thread).collect();
    assert_eq!(threads.len(), 4);
    let serials: BTreeSet<_> = records.iter().map(|r| r.serial).collect();
    assert_eq!(serials.len(), 8);
}

#[cfg(unix)]
fn should_track_patched_crt_imports(detector: &Detector) {
    use leakwatch::ModuleImports;
    use leakwatch::patch::crt::EXPORT_MODULE;
    use libc::{c_void, size_t};

    type MallocFn = unsafe extern "C" fn(size_t) -> *mut c_void;
    type ReallocFn = unsafe extern "C" fn(*mut c_void, size_t) -> *mut c_void;
    type FreeFn = unsafe extern "C" fn(*mut c_void);

    let malloc_address = libc::malloc as MallocFn as usize;
    let module = Arc::new(
        ModuleImports::new("plugin.so")
            .with_import(EXPORT_MODULE, "malloc", malloc_address)
            .with_import(EXPORT_MODULE, "realloc", libc::realloc as ReallocFn as usize)
            .with_import(EXPORT_MODULE, "free", libc::free as FreeFn as usize),
    );
    assert_eq!(detector.patch_module(module.clone()).expect("patch"), 3);
    assert!(detector.interceptor().is_patched("plugin.so"));

    let target = |symbol: &str| module.target(EXPORT_MODULE, symbol).expect("import");
    // SAFETY: the slots hold functions with these signatures
    let (malloc, realloc, free) = unsafe {
        (
            std::mem::transmute::<usize, MallocFn>(target("malloc")),
            std::mem::transmute::<usize, ReallocFn>(target("realloc")),
            std::mem::transmute::<usize, FreeFn>(target("free")),
        )
    };
    assert_ne!(target("malloc"), malloc_address);

    unsafe {
        let block = malloc(89);
        assert!(!block.is_null());
        assert_eq!(unreported(detector, HeapTag::CRT, 89).len(), 1);

        let block = realloc(block, 97);
        assert!(!block.is_null());
        assert!(unreported(detector, HeapTag::CRT, 89).is_empty());
        assert_eq!(unreported(detector, HeapTag::CRT, 97).len(), 1);

        free(block);
        assert!(unreported(detector, HeapTag::CRT, 97).is_empty());

        std::hint::black_box(malloc(101));
    }
    assert_eq!(unreported(detector, HeapTag::CRT, 101).len(), 1);

    assert!(detector.restore_module("plugin.so"));
    assert_eq!(target("malloc"), malloc_address);
}

fn should_stop_tracking_after_detach(detector: &Detector) {
    leakwatch::detach().expect("detach");
    assert!(leakwatch::active().is_none());
    assert!(!detector.is_enabled());
    leak(107);
    assert!(unreported(detector, HeapTag::RUST, 107).is_empty());
    assert_eq!(leakwatch::leaks_count(), 0);
    assert!(matches!(leakwatch::detach(), Err(Error::NotAttached)));

    // a new detector starts from an empty table
    let second = leakwatch::attach(Config::default()).expect("attach again");
    assert!(unreported(second, HeapTag::RUST, 61).is_empty());
    leak(127);
    assert_eq!(unreported(second, HeapTag::RUST, 127).len(), 1);
    leakwatch::detach().expect("detach again");
}

#[derive(Clone, Default)]
struct Collect(Arc<Mutex<Vec<usize>>>);

impl ReportWriter for Collect {
    fn write_report(&mut self, report: &LeakReport) {
        self.0.lock().push(report.leak_count());
    }
}

fn should_attach_detector_with_custom_writer() {
    let reports = Collect::default();
    let detector = Detector::new(Config::default()).with_writer(reports.clone());
    let attached = leakwatch::attach_with(detector).expect("attach custom detector");
    leak(131);
    assert_eq!(unreported(attached, HeapTag::RUST, 131).len(), 1);

    let leaks = leakwatch::report_leaks();
    assert!(leaks >= 1);
    assert_eq!(*reports.0.lock(), vec![leaks]);
    leakwatch::detach().expect("detach custom detector");
}
