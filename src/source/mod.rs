//! Source documents and where they come from.
//!
//! - [`SourceDocument`]: an immutable parsed source plus its models
//! - [`SourceLoader`]: raw text access (filesystem, optionally gzip)
//! - [`SourceProvider`]: load + parse with concurrent-request coalescing

mod document;
mod loader;
mod provider;

pub use document::{normalize_key, Model, SourceDocument};
pub use loader::{FsLoader, SourceLoader};
pub use provider::{LoadHook, LoadOrigin, LoadedDocument, SourceProvider};
