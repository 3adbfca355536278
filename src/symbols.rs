mod demangle;

use std::collections::HashMap;
use std::path::PathBuf;

pub(crate) use self::demangle::is_internal;

/// Symbolic description of a code address.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SymbolInfo {
    /// Loaded object or crate the address belongs to.
    pub module: Option<String>,
    pub function: String,
    pub file: Option<PathBuf>,
    pub line: Option<u32>,
}

/// One frame of a reported call stack. `symbol` is `None` when unknown.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Frame {
    pub address: usize,
    pub symbol: Option<SymbolInfo>,
}

impl Frame {
    /// Whether the frame belongs to the detector or the allocator plumbing.
    pub fn is_internal(&self) -> bool {
        self.symbol
            .as_ref()
            .is_some_and(|symbol| is_internal(&symbol.function))
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Some(symbol) = &self.symbol else {
            return write!(f, "{:#x} (unknown)", self.address);
        };

        match (&symbol.file, symbol.line) {
            (Some(file), Some(line)) => write!(f, "{}({line}): ", file.display())?,
            (Some(file), None) => write!(f, "{}: ", file.display())?,
            _ => write!(f, "{:#x}: ", self.address)?,
        }
        if let Some(module) = &symbol.module {
            write!(f, "{module}!")?;
        }
        write!(f, "{}", symbol.function)
    }
}

/// Turns return addresses into symbols.
pub trait SymbolResolver: Send + Sync {
    /// Resolves `address`, or returns `None` when nothing is known about it.
    fn resolve(&self, address: usize) -> Option<SymbolInfo>;
}

/// Resolves with the `backtrace` crate's debug-info readers.
#[derive(Debug, Default, Clone, Copy)]
pub struct BacktraceResolver;

impl SymbolResolver for BacktraceResolver {
    fn resolve(&self, address: usize) -> Option<SymbolInfo> {
        let mut info = None;
        backtrace::resolve(address as *mut std::ffi::c_void, |symbol| {
            if info.is_some() {
                return;
            }
            let Some(name) = symbol.name() else {
                return;
            };
            let function = demangle::function_name(&name);
            let module = crate::os::module_of(address)
                .or_else(|| demangle::crate_of(&function).map(str::to_string));
            info = Some(SymbolInfo {
                module,
                function,
                file: symbol.filename().map(PathBuf::from),
                line: symbol.lineno(),
            });
        });
        info
    }
}

/// Resolves nothing; every frame is reported as unknown.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullResolver;

impl SymbolResolver for NullResolver {
    fn resolve(&self, _address: usize) -> Option<SymbolInfo> {
        None
    }
}

/// Memoizes a resolver for the duration of one report.
pub(crate) struct SymbolCache<'a> {
    resolver: &'a dyn SymbolResolver,
    symbols: HashMap<usize, Option<SymbolInfo>>,
}

impl<'a> SymbolCache<'a> {
    pub(crate) fn new(resolver: &'a dyn SymbolResolver) -> Self {
        Self {
            resolver,
            symbols: HashMap::new(),
        }
    }

    pub(crate) fn frame(&mut self, address: usize) -> Frame {
        let symbol = self
            .symbols
            .entry(address)
            .or_insert_with(|| self.resolver.resolve(address))
            .clone();
        Frame { address, symbol }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.symbols.len()
    }
}
