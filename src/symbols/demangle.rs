use backtrace::SymbolName;

/// Frames of the detector and of the allocator plumbing, as demangled path prefixes.
const INTERNAL_PREFIXES: &[&str] = &[
    "leakwatch::stack::",
    "leakwatch::detector::Detector::track",
    "leakwatch::detector::Detector::begin_realloc",
    "leakwatch::detector::Detector::finish_realloc",
    "leakwatch::detector::on_",
    "leakwatch::patch::crt::",
    "leakwatch::os::",
    "<leakwatch::alloc::",
    "<leakwatch::stack::",
    "leakwatch::alloc::",
    "backtrace::",
    "alloc::alloc::",
    "<alloc::alloc::",
    "alloc::raw_vec::",
    "<alloc::raw_vec::",
    "std::alloc::",
    "__rustc::",
    "__rust_alloc",
    "__rust_realloc",
    "__rdl_",
];

/// Demangled function name, without the trailing hash.
pub fn function_name(name: &SymbolName<'_>) -> String {
    format!("{name:#}")
}

/// Whether `function` is part of the detector or the allocator plumbing.
pub fn is_internal(function: &str) -> bool {
    INTERNAL_PREFIXES
        .iter()
        .any(|prefix| function.starts_with(prefix))
}

/// First path segment of a demangled Rust path (`my_crate::a::b` -> `my_crate`).
pub fn crate_of(function: &str) -> Option<&str> {
    let path = function.trim_start_matches('<');
    let (head, _) = path.split_once("::")?;
    (!head.is_empty()).then_some(head)
}
