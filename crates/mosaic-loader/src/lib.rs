pub mod bundles;
pub mod errors;
pub mod exports;
pub mod registry;

// Re-export commonly used items
pub use bundles::{
    BundleCompletion, BundleFetcher, FetchError, FetchFuture, HttpFetcher, ScriptEvaluator,
};
pub use errors::{LoaderError, Result};
pub use exports::{ExportValue, Exports, ModuleInstance};
pub use registry::{ModuleFactory, Registry, Require};
