/// Errors returned by the detector's control surface.
///
/// Intercepted allocation paths never produce these: failures there are
/// absorbed and at most logged.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("a detector is already attached to this process")]
    AlreadyAttached,

    #[error("no detector is attached to this process")]
    NotAttached,

    #[error("module `{module}` does not import `{symbol}`")]
    ImportNotFound {
        module: String,
        symbol: &'static str,
    },

    #[error("module `{0}` is excluded from interception")]
    ModuleIgnored(String),
}

/// Result type of the detector's control surface.
pub type Result<T> = std::result::Result<T, Error>;
