use thiserror::Error;

/// Canonical result type for loader operations
pub type Result<T> = std::result::Result<T, LoaderError>;

/// Runtime loading errors.
///
/// `Clone` matters: a failed bundle is terminal, and every later caller for
/// its URL receives the same rejection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoaderError {
    #[error("invalid module path '{0}'")]
    BadPath(String),

    #[error("no module registered for '{0}'")]
    NoMatch(String),

    #[error("no registered version satisfies '{request}' (available: {available})")]
    NoSatisfying { request: String, available: String },

    #[error("failed to load bundle '{url}': {reason}")]
    BundleLoadFailed { url: String, reason: String },
}
