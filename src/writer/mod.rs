//! Writers: render category instances as CIF text or as a binary
//! container.
//!
//! Both implement [`Writer`]. A writer is single use: categories are
//! written into the current data block, `encode` seals it, `flush` sends
//! the sealed output to a sink. Writing after `encode` fails with
//! [`ServerError::WriterSealed`](crate::error::ServerError::WriterSealed).

pub mod binary;
pub mod sink;
pub mod text;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{CategoryProvider, Context};

pub use binary::{BinaryWriter, EncodedCategory, EncodedColumn, EncodedDataBlock, EncodedFile};
pub use sink::{BufferedText, OutputSink, WriteSink};
pub use text::TextWriter;

/// Version string written into binary containers.
pub const FORMAT_VERSION: &str = "0.3.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum OutputFormat {
    #[default]
    Text,
    Binary,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Text => "text",
            OutputFormat::Binary => "binary",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "cif" => Some(OutputFormat::Text),
            "binary" | "bcif" => Some(OutputFormat::Binary),
            _ => None,
        }
    }
}

pub trait Writer {
    /// Open a data block; categories written afterwards belong to it.
    fn start_data_block(&mut self, header: &str) -> Result<()>;

    /// Render `provider` once per context (once with an empty context when
    /// `contexts` is empty). Categories with no rows are skipped.
    fn write_category<'p>(&mut self, provider: &'p dyn CategoryProvider, contexts: &[Context<'p>]) -> Result<()>;

    /// Seal the writer.
    fn encode(&mut self) -> Result<()>;

    /// Send the sealed output to `sink`. Does not call `sink.end()`.
    fn flush(&mut self, sink: &mut dyn OutputSink) -> Result<()>;

    fn format(&self) -> OutputFormat;
}

/// Writer settings that come from the server configuration.
#[derive(Debug, Clone)]
pub struct WriterOptions {
    pub encoder_tag: String,
    pub text_chunk_capacity: usize,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            encoder_tag: format!("modelserver {}", env!("CARGO_PKG_VERSION")),
            text_chunk_capacity: sink::DEFAULT_CHUNK_CAPACITY,
        }
    }
}

pub fn create_writer(format: OutputFormat, options: &WriterOptions) -> Box<dyn Writer> {
    match format {
        OutputFormat::Text => Box::new(TextWriter::new(options.text_chunk_capacity)),
        OutputFormat::Binary => Box::new(BinaryWriter::new(options.encoder_tag.clone())),
    }
}
