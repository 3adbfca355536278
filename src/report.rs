//! Leak report building and writers.

use std::collections::HashMap;
use std::fmt;
use std::io;

use crate::fingerprint::LeakFingerprint;
use crate::state::ThreadId;
use crate::symbols::{Frame, SymbolCache, SymbolResolver};
use crate::table::{AllocationRecord, BlockContents, TableStats};

/// One reported leak: every unreported block sharing a call stack.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct LeakEntry {
    pub fingerprint: LeakFingerprint,
    pub total_bytes: usize,
    /// Serial numbers of the leaked blocks, ascending.
    pub serials: Vec<u64>,
    /// Distinct allocating threads, ascending.
    pub threads: Vec<ThreadId>,
    /// Call stack of the first block, innermost first.
    pub frames: Vec<Frame>,
    /// Leading bytes of the first block; empty unless data dumps are configured.
    pub contents: Vec<u8>,
}

impl LeakEntry {
    /// Number of leaked blocks in this entry.
    pub fn occurrences(&self) -> usize {
        self.serials.len()
    }
}

/// A complete leak report.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct LeakReport {
    /// Entries ordered by their first serial number.
    pub entries: Vec<LeakEntry>,
    pub stats: TableStats,
}

impl LeakReport {
    /// Total number of leaked blocks.
    pub fn leak_count(&self) -> usize {
        self.entries.iter().map(LeakEntry::occurrences).sum()
    }

    /// Total number of leaked bytes.
    pub fn leaked_bytes(&self) -> usize {
        self.entries.iter().map(|entry| entry.total_bytes).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Options of [`build_with_contents`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct BuildOptions {
    pub aggregate_duplicates: bool,
    pub trace_internal_frames: bool,
    pub resolve_symbols: bool,
}

struct Group<'r> {
    first: &'r AllocationRecord,
    fingerprint: LeakFingerprint,
    total_bytes: usize,
    serials: Vec<u64>,
    threads: Vec<ThreadId>,
}

/// Groups the unreported records by fingerprint, in first-seen serial order.
fn group(records: &[AllocationRecord], aggregate: bool) -> Vec<Group<'_>> {
    let mut groups: Vec<Group<'_>> = Vec::new();
    let mut index: HashMap<LeakFingerprint, usize> = HashMap::new();

    let mut unreported: Vec<&AllocationRecord> = records.iter().filter(|r| !r.reported).collect();
    unreported.sort_unstable_by_key(|record| record.serial);

    for record in unreported {
        let fingerprint = LeakFingerprint::of(&record.stack);
        let slot = match index.get(&fingerprint) {
            Some(&slot) if aggregate => slot,
            _ => {
                index.insert(fingerprint, groups.len());
                groups.push(Group {
                    first: record,
                    fingerprint,
                    total_bytes: 0,
                    serials: Vec::new(),
                    threads: Vec::new(),
                });
                groups.len() - 1
            }
        };
        let group = &mut groups[slot];
        group.total_bytes += record.size;
        group.serials.push(record.serial);
        if !group.threads.contains(&record.thread) {
            group.threads.push(record.thread);
        }
    }

    groups
}

/// Counts unreported blocks in `records`.
pub(crate) fn count(records: &[AllocationRecord]) -> usize {
    records.iter().filter(|record| !record.reported).count()
}

/// Builds a report from a table snapshot. Never touches the table itself.
#[cfg(test)]
pub(crate) fn build(
    records: &[AllocationRecord],
    stats: TableStats,
    resolver: &dyn SymbolResolver,
    options: BuildOptions,
) -> LeakReport {
    build_with_contents(records, &BlockContents::new(), stats, resolver, options)
}

/// Builds a report from a table snapshot, attaching the captured contents of
/// each entry's first block. Never touches the table itself.
pub(crate) fn build_with_contents(
    records: &[AllocationRecord],
    contents: &BlockContents,
    stats: TableStats,
    resolver: &dyn SymbolResolver,
    options: BuildOptions,
) -> LeakReport {
    let mut cache = SymbolCache::new(resolver);

    let entries = group(records, options.aggregate_duplicates)
        .into_iter()
        .map(|group| {
            let mut frames: Vec<Frame> = group
                .first
                .stack
                .frames()
                .iter()
                .map(|&address| {
                    if options.resolve_symbols {
                        cache.frame(address)
                    } else {
                        Frame {
                            address,
                            symbol: None,
                        }
                    }
                })
                .collect();
            if !options.trace_internal_frames {
                let skip = frames.iter().take_while(|frame| frame.is_internal()).count();
                // keep something to look at if the whole stack is internal
                if skip < frames.len() {
                    frames.drain(..skip);
                }
            }

            let mut threads = group.threads;
            threads.sort_unstable();
            LeakEntry {
                fingerprint: group.fingerprint,
                total_bytes: group.total_bytes,
                serials: group.serials,
                threads,
                frames,
                contents: contents
                    .get(&group.first.serial)
                    .map(|bytes| bytes.to_vec())
                    .unwrap_or_default(),
            }
        })
        .collect();

    LeakReport { entries, stats }
}

impl fmt::Display for LeakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return writeln!(f, "leakwatch: no memory leaks detected.");
        }

        writeln!(
            f,
            "leakwatch: detected {} memory leaks ({} bytes) in {} groups.",
            self.leak_count(),
            self.leaked_bytes(),
            self.entries.len()
        )?;
        writeln!(
            f,
            "Largest number used: {} bytes. Total allocations: {} bytes.",
            self.stats.peak_bytes, self.stats.total_bytes
        )?;
        for entry in &self.entries {
            write!(f, "{entry}")?;
        }
        Ok(())
    }
}

impl fmt::Display for LeakEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "---------- Leak 0x{}: {} block(s), {} bytes ----------",
            self.fingerprint,
            self.occurrences(),
            self.total_bytes
        )?;
        writeln!(f, "  Serials: {}", join(&self.serials))?;
        writeln!(f, "  Threads: {}", join(&self.threads))?;
        writeln!(f, "  Call stack:")?;
        for frame in &self.frames {
            writeln!(f, "    {frame}")?;
        }
        if !self.contents.is_empty() {
            writeln!(f, "  Data:")?;
            for line in self.contents.chunks(16) {
                writeln!(f, "    {}", dump_line(line))?;
            }
        }
        Ok(())
    }
}

/// One hex dump line of up to 16 bytes, split in two halves, then the printable characters.
fn dump_line(bytes: &[u8]) -> String {
    let mut hex = String::with_capacity(50);
    for (i, byte) in bytes.iter().enumerate() {
        if i == 8 {
            hex.push(' ');
        }
        hex.push_str(&format!("{byte:02X} "));
    }
    let text: String = bytes
        .iter()
        .map(|&byte| {
            if byte.is_ascii_graphic() || byte == b' ' {
                char::from(byte)
            } else {
                '.'
            }
        })
        .collect();
    format!("{hex:<49} {text}")
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Destination of leak reports.
pub trait ReportWriter: Send {
    fn write_report(&mut self, report: &LeakReport);
}

/// Emits reports as `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWriter;

impl ReportWriter for TracingWriter {
    fn write_report(&mut self, report: &LeakReport) {
        if report.is_empty() {
            tracing::info!(target: "leakwatch::report", "no memory leaks detected");
            return;
        }

        tracing::warn!(
            target: "leakwatch::report",
            leaks = report.leak_count(),
            bytes = report.leaked_bytes(),
            groups = report.entries.len(),
            peak_bytes = report.stats.peak_bytes,
            "memory leaks detected"
        );
        for entry in &report.entries {
            tracing::warn!(target: "leakwatch::report", "{entry}");
        }
    }
}

/// Writes the text form of reports to any [`io::Write`].
#[derive(Debug)]
pub struct TextWriter<W> {
    out: W,
}

impl<W: io::Write + Send> TextWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: io::Write + Send> ReportWriter for TextWriter<W> {
    fn write_report(&mut self, report: &LeakReport) {
        if let Err(err) = write!(self.out, "{report}").and_then(|()| self.out.flush()) {
            tracing::error!("failed to write leak report: {err}");
        }
    }
}

#[cfg(test)]
mod test {

    use std::path::PathBuf;

    use super::*;
    use crate::stack::CallStack;
    use crate::symbols::{NullResolver, SymbolInfo};
    use crate::table::{BlockId, HeapTag};

    const OPTIONS: BuildOptions = BuildOptions {
        aggregate_duplicates: true,
        trace_internal_frames: false,
        resolve_symbols: true,
    };

    struct FakeResolver;

    impl SymbolResolver for FakeResolver {
        fn resolve(&self, address: usize) -> Option<SymbolInfo> {
            let function = match address {
                0x10 => "leakwatch::stack::BacktraceCapture::capture",
                0x20 => "__rust_alloc",
                0x30 => "app::make_widget",
                0x40 => "app::main",
                _ => return None,
            };
            Some(SymbolInfo {
                module: Some("app".to_string()),
                function: function.to_string(),
                file: Some(PathBuf::from("src/main.rs")),
                line: Some(address as u32),
            })
        }
    }

    fn record(serial: u64, size: usize, thread: u64, stack: &[usize]) -> AllocationRecord {
        AllocationRecord {
            block: BlockId::new(HeapTag::RUST, serial as usize * 0x100),
            size,
            thread: ThreadId(thread),
            stack: CallStack::new(stack.to_vec()),
            serial,
            reported: false,
        }
    }

    #[test]
    fn test_should_group_by_call_stack() {
        let records = vec![
            record(1, 60, 1, &[0x30, 0x40]),
            record(2, 60, 2, &[0x30, 0x40]),
            record(3, 60, 1, &[0x30, 0x40]),
        ];
        let report = build(&records, TableStats::default(), &NullResolver, OPTIONS);
        assert_eq!(report.entries.len(), 1);
        let entry = &report.entries[0];
        assert_eq!(entry.occurrences(), 3);
        assert_eq!(entry.total_bytes, 180);
        assert_eq!(entry.serials, vec![1, 2, 3]);
        assert_eq!(entry.threads, vec![ThreadId(1), ThreadId(2)]);
        assert_eq!(report.leak_count(), 3);
    }

    #[test]
    fn test_should_order_groups_by_first_serial() {
        let records = vec![
            record(5, 1, 1, &[0x40]),
            record(2, 1, 1, &[0x30]),
            record(3, 1, 1, &[0x40]),
            record(9, 1, 1, &[0x30]),
        ];
        let report = build(&records, TableStats::default(), &NullResolver, OPTIONS);
        let firsts: Vec<_> = report.entries.iter().map(|e| e.serials[0]).collect();
        assert_eq!(firsts, vec![2, 3]);
        assert_eq!(report.entries[0].serials, vec![2, 9]);
    }

    #[test]
    fn test_should_skip_reported_records() {
        let mut old = record(1, 50, 1, &[0x30]);
        old.reported = true;
        let records = vec![old, record(2, 60, 1, &[0x40])];
        assert_eq!(count(&records), 1);
        let report = build(&records, TableStats::default(), &NullResolver, OPTIONS);
        assert_eq!(report.leak_count(), 1);
        assert_eq!(report.entries[0].total_bytes, 60);
    }

    #[test]
    fn test_should_not_aggregate_when_disabled() {
        let records = vec![record(1, 8, 1, &[0x30]), record(2, 8, 1, &[0x30])];
        let options = BuildOptions {
            aggregate_duplicates: false,
            ..OPTIONS
        };
        let report = build(&records, TableStats::default(), &NullResolver, options);
        assert_eq!(report.entries.len(), 2);
        assert_eq!(report.entries[0].fingerprint, report.entries[1].fingerprint);
    }

    #[test]
    fn test_should_hide_leading_internal_frames() {
        let records = vec![record(1, 8, 1, &[0x10, 0x20, 0x30, 0x40])];
        let report = build(&records, TableStats::default(), &FakeResolver, OPTIONS);
        let addresses: Vec<_> = report.entries[0].frames.iter().map(|f| f.address).collect();
        assert_eq!(addresses, vec![0x30, 0x40]);

        let options = BuildOptions {
            trace_internal_frames: true,
            ..OPTIONS
        };
        let report = build(&records, TableStats::default(), &FakeResolver, options);
        assert_eq!(report.entries[0].frames.len(), 4);
    }

    #[test]
    fn test_should_leave_frames_unresolved_when_asked() {
        let records = vec![record(1, 8, 1, &[0x30])];
        let options = BuildOptions {
            resolve_symbols: false,
            ..OPTIONS
        };
        let report = build(&records, TableStats::default(), &FakeResolver, options);
        assert!(report.entries[0].frames[0].symbol.is_none());
    }

    #[test]
    fn test_should_format_text_report() {
        let records = vec![record(1, 60, 1, &[0x30, 0x99]), record(2, 60, 1, &[0x30, 0x99])];
        let stats = TableStats {
            total_blocks: 2,
            total_bytes: 120,
            live_bytes: 120,
            peak_bytes: 120,
        };
        let report = build(&records, stats, &FakeResolver, OPTIONS);
        let text = report.to_string();
        assert!(text.starts_with("leakwatch: detected 2 memory leaks (120 bytes) in 1 groups."));
        assert!(text.contains("Largest number used: 120 bytes. Total allocations: 120 bytes."));
        assert!(text.contains("2 block(s), 120 bytes"));
        assert!(text.contains("  Serials: 1, 2"));
        assert!(text.contains("src/main.rs(48): app!app::make_widget"));
        assert!(text.contains("0x99 (unknown)"));
    }

    #[test]
    fn test_should_attach_contents_of_first_block() {
        let records = vec![record(1, 24, 1, &[0x30]), record(2, 24, 1, &[0x30])];
        let pattern: Vec<u8> = (0..24u8).map(|n| 0x30 + n / 10).collect();
        let mut contents = BlockContents::new();
        contents.insert(1, pattern.clone().into_boxed_slice());
        contents.insert(2, vec![0u8; 24].into_boxed_slice());

        let report = build_with_contents(
            &records,
            &contents,
            TableStats::default(),
            &NullResolver,
            OPTIONS,
        );
        assert_eq!(report.entries[0].contents, pattern);

        let text = report.to_string();
        assert!(text.contains("  Data:\n"));
        assert!(text.contains(
            "    30 30 30 30 30 30 30 30  30 30 31 31 31 31 31 31  0000000000111111\n"
        ));
        assert!(text.contains("    31 31 31 31 32 32 32 32"));
        assert!(text.ends_with(" 11112222\n"));
    }

    #[test]
    fn test_should_omit_data_without_contents() {
        let records = vec![record(1, 8, 1, &[0x30])];
        let report = build(&records, TableStats::default(), &NullResolver, OPTIONS);
        assert!(report.entries[0].contents.is_empty());
        assert!(!report.to_string().contains("Data:"));
    }

    #[test]
    fn test_should_format_empty_report() {
        let report = LeakReport::default();
        assert_eq!(report.to_string(), "leakwatch: no memory leaks detected.\n");
    }

    #[test]
    fn test_should_write_text_report() {
        let records = vec![record(1, 8, 1, &[0x40])];
        let report = build(&records, TableStats::default(), &NullResolver, OPTIONS);
        let mut writer = TextWriter::new(Vec::new());
        writer.write_report(&report);
        let text = String::from_utf8(writer.into_inner()).expect("utf8");
        assert_eq!(text, report.to_string());
    }

    #[test]
    #[cfg(feature = "serde")]
    fn test_should_serialize_report() {
        let records = vec![record(1, 8, 1, &[0x40])];
        let report = build(&records, TableStats::default(), &FakeResolver, OPTIONS);
        let json = serde_json::to_value(&report).expect("serialize");
        assert_eq!(json["entries"][0]["total_bytes"], 8);
        assert_eq!(json["entries"][0]["frames"][0]["symbol"]["function"], "app::main");
    }
}
