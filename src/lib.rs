//! ModelServer - serves subsets of macromolecular coordinate files
//!
//! Sources are CIF text files (optionally gzip-compressed). A request names
//! a source and an output format; the server answers with the selected
//! models and categories as CIF text or as a BinaryCIF container.
//!
//! # Architecture
//!
//! - [`source`] loads and parses sources, coalescing concurrent loads of
//!   the same key into one read
//! - [`cache`] keeps parsed documents in a size- and TTL-bounded LRU
//! - [`model`] describes categories and the contexts they are rendered in
//! - [`encoding`] holds the column encoder chains behind the binary format
//! - [`writer`] renders categories as text or binary
//! - [`service`] ties them together behind a [`ServerContext`]
//!
//! ```no_run
//! use modelserver::{OutputFormat, QueryRequest, ServerConfig, ServerContext};
//!
//! # async fn run() -> modelserver::Result<()> {
//! let ctx = ServerContext::new(ServerConfig::default())?;
//! let mut out: Vec<u8> = Vec::new();
//! ctx.respond(&QueryRequest::new("1cbs", OutputFormat::Binary), &mut out).await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod cif;
pub mod config;
pub mod encoding;
pub mod error;
pub mod metrics;
pub mod model;
pub mod service;
pub mod source;
pub mod writer;

pub use cache::DocumentCache;
pub use config::ServerConfig;
pub use error::{LoadError, Result, ServerError};
pub use metrics::{Metrics, MetricsSnapshot};
pub use service::{write_error_document, QueryRequest, ResponseOutcome, ServerContext};
pub use source::{LoadOrigin, LoadedDocument, SourceDocument, SourceLoader, SourceProvider};
pub use writer::{create_writer, OutputFormat, OutputSink, Writer, WriterOptions};
