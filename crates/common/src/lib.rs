//! Apiprobe Common Library
//!
//! The core engine shared by the runner and the CLI: the per-suite
//! datastore, the PathSpec resolver, the manifest template renderer,
//! the semantic JSON comparator, and the hierarchical report tree.

pub mod compare;
pub mod datastore;
pub mod error;
pub mod filesystem;
pub mod lenient;
pub mod pathspec;
pub mod query;
pub mod report;
pub mod template;

// Re-export commonly used types
pub use compare::{compare, CompareResult, Failure};
pub use datastore::Datastore;
pub use error::{Error, Result};
pub use filesystem::{DiskFs, Filesystem, MemFs};
pub use pathspec::PathSpec;
pub use report::{Report, ReportElement, ReportResult};
pub use template::Loader;

/// Apiprobe version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
