use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Canonical result type for rewriter operations
pub type Result<T> = std::result::Result<T, RewriteError>;

/// Build-fatal errors raised while rewriting a compilation
#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("invalid versioned path '{0}'")]
    BadPath(String),

    #[error("no package descriptor found above {}", .0.display())]
    NotInPackage(PathBuf),

    #[error("module '{0}' is an external reference; versioned chunks cannot carry externals")]
    ExternalNotAllowed(String),

    #[error("async require references unknown chunk id {0}")]
    UnresolvableAsyncChunk(String),

    #[error("require call references unknown module id {0}")]
    UnknownModule(String),

    #[error("package '{issuer}' does not declare a dependency on '{target}'")]
    UndeclaredDependency { issuer: String, target: String },

    #[error("chunk '{0}' has no output files")]
    ChunkWithoutFiles(String),

    #[error("invalid package descriptor {}: {message}", path.display())]
    Descriptor { path: PathBuf, message: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
