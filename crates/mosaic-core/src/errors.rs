use thiserror::Error;

/// Raised when a string does not match the `name@version[/subpath]` grammar.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid versioned path '{0}'")]
pub struct PathError(pub String);
