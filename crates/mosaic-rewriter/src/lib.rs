pub mod compilation;
pub mod errors;
pub mod probe;
pub mod rewrite;

// Re-export commonly used items
pub use compilation::{Chunk, ChunkModule, Compilation, ModuleSource};
pub use errors::{Result, RewriteError};
pub use probe::{PackageDescriptor, PackageProbe};
pub use rewrite::{INTERNAL_REQUIRE, RewriterOptions, RewrittenChunk, rewrite_compilation};
