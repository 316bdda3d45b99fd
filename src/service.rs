//! Request handling: the process-wide [`ServerContext`] and the path from a
//! [`QueryRequest`] to a finished response on an [`OutputSink`].
//!
//! Every successful response is one data block holding, in order:
//! `model_server_result`, `model_server_stats`, then the source categories
//! (atom_site split per selected model). A source that fails to parse gets
//! an error document in the requested format instead; an unreadable source
//! gets nothing but a closed sink and a `NOT_FOUND` error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::DocumentCache;
use crate::config::ServerConfig;
use crate::error::{LoadError, Result, ServerError};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::model::source::SourceCategory;
use crate::model::{Cell, CategoryDescriptor, Context, FieldDescriptor, StaticTable};
use crate::source::{FsLoader, LoadHook, LoadOrigin, LoadedDocument, SourceLoader, SourceProvider};
use crate::writer::{create_writer, OutputFormat, OutputSink, Writer, WriterOptions};

/// Category split per model in responses.
const ATOM_SITE: &str = "atom_site";

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub source_id: String,
    #[serde(default)]
    pub format: OutputFormat,
    /// Only these models; all models when absent.
    #[serde(default)]
    pub model_nums: Option<Vec<i32>>,
    /// Only these categories (names with or without the leading `_`);
    /// every category when absent.
    #[serde(default)]
    pub categories: Option<Vec<String>>,
}

impl QueryRequest {
    pub fn new(source_id: impl Into<String>, format: OutputFormat) -> Self {
        Self {
            source_id: source_id.into(),
            format,
            ..Self::default()
        }
    }

    pub fn with_models(mut self, model_nums: Vec<i32>) -> Self {
        self.model_nums = Some(model_nums);
        self
    }

    pub fn with_categories<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.categories = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Short description written into `model_server_result.query`.
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(models) = &self.model_nums {
            let nums: Vec<String> = models.iter().map(i32::to_string).collect();
            parts.push(format!("models={}", nums.join(",")));
        }
        if let Some(categories) = &self.categories {
            parts.push(format!("categories={}", categories.join(",")));
        }
        if parts.is_empty() {
            "full".to_string()
        } else {
            parts.join(";")
        }
    }

    fn wants_category(&self, name: &str) -> bool {
        match &self.categories {
            None => true,
            Some(wanted) => wanted
                .iter()
                .any(|w| w.trim_start_matches('_').eq_ignore_ascii_case(name)),
        }
    }
}

/// What a response ended up containing.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    Document { origin: LoadOrigin },
    ErrorDocument { message: String },
}

// ============================================================================
// Server context
// ============================================================================

/// Load hook that inserts every freshly parsed document into `cache` and
/// records its timings. Holds the cache weakly so an in-flight load cannot
/// outlive the context's cache.
fn cache_on_load(cache: &Arc<DocumentCache>, metrics: Option<Arc<Metrics>>) -> LoadHook {
    let cache = Arc::downgrade(cache);
    Arc::new(move |loaded: &LoadedDocument| {
        if let Some(cache) = cache.upgrade() {
            cache.add(loaded.document.clone());
        }
        if let (Some(m), LoadOrigin::Loaded { io_time, parse_time }) = (&metrics, loaded.origin) {
            m.record_load(io_time, parse_time);
        }
    })
}

/// Everything a request handler needs, built once at startup and shared
/// behind an `Arc`.
pub struct ServerContext {
    config: ServerConfig,
    options: WriterOptions,
    cache: Arc<DocumentCache>,
    provider: SourceProvider,
    metrics: Option<Arc<Metrics>>,
}

impl ServerContext {
    /// Context reading sources from `config.source_root`.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let loader = Arc::new(FsLoader::new(config.source_root.clone()));
        Self::with_loader(config, loader)
    }

    pub fn with_loader(config: ServerConfig, loader: Arc<dyn SourceLoader>) -> Result<Self> {
        config.validate()?;
        let metrics = config.metrics.then(|| Arc::new(Metrics::new()));
        let cache = Arc::new(DocumentCache::new(config.cache_max_bytes, config.entry_ttl()));
        let provider = SourceProvider::new(loader).with_load_hook(cache_on_load(&cache, metrics.clone()));
        Ok(Self {
            options: config.writer_options(),
            cache,
            provider,
            metrics,
            config,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn cache(&self) -> &DocumentCache {
        &self.cache
    }

    pub fn provider(&self) -> &SourceProvider {
        &self.provider
    }

    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }

    pub fn metrics_snapshot(&self) -> Option<MetricsSnapshot> {
        self.metrics.as_ref().map(|m| m.snapshot())
    }

    /// Cached document if there is one, otherwise a (possibly coalesced)
    /// load. The load task itself caches the document, whether or not the
    /// caller that started it is still waiting.
    pub async fn resolve(&self, source_id: &str) -> std::result::Result<LoadedDocument, LoadError> {
        if let Some(hit) = self.cache.get(source_id) {
            if let Some(m) = &self.metrics {
                m.record_cache_hit();
            }
            return Ok(hit);
        }
        if let Some(m) = &self.metrics {
            m.record_cache_miss();
        }

        self.provider.load(source_id).await
    }

    /// Answer one query into `sink`. The sink is ended on every path.
    pub async fn respond<S: OutputSink + Send>(
        &self,
        request: &QueryRequest,
        sink: &mut S,
    ) -> Result<ResponseOutcome> {
        let started = Instant::now();
        let outcome = self.respond_inner(request, sink).await;

        if let Some(m) = &self.metrics {
            let kind = match &outcome {
                Ok(ResponseOutcome::Document { .. }) => request.format.as_str(),
                _ => "error",
            };
            m.record_request(kind, started.elapsed().as_millis() as u64);
        }
        outcome
    }

    async fn respond_inner<S: OutputSink + Send>(
        &self,
        request: &QueryRequest,
        sink: &mut S,
    ) -> Result<ResponseOutcome> {
        let loaded = match self.resolve(&request.source_id).await {
            Ok(loaded) => loaded,
            Err(err @ LoadError::Io { .. }) => {
                if let Err(e) = sink.end() {
                    debug!(error = %e, "Failed to end sink after unreadable source");
                }
                return Err(err.into());
            }
            Err(err @ LoadError::Parse { .. }) => {
                return self.fallback_to_error_document(request, sink, err.to_string());
            }
        };

        match self.render(request, &loaded, sink) {
            Ok(()) => Ok(ResponseOutcome::Document { origin: loaded.origin }),
            // The sink may have seen partial output; it has been ended.
            Err(err @ ServerError::Flush(_)) => Err(err),
            Err(err) => {
                warn!(source = %request.source_id, error = %err, "Response failed, sending error document");
                self.fallback_to_error_document(request, sink, err.to_string())
            }
        }
    }

    fn fallback_to_error_document(
        &self,
        request: &QueryRequest,
        sink: &mut dyn OutputSink,
        message: String,
    ) -> Result<ResponseOutcome> {
        let writer = create_writer(request.format, &self.options);
        write_error_document(writer, sink, &request.source_id, &message)?;
        Ok(ResponseOutcome::ErrorDocument { message })
    }

    /// Write the full response for an already resolved document. Ends the
    /// sink once flushing starts; leaves it untouched on earlier failures.
    fn render(&self, request: &QueryRequest, loaded: &LoadedDocument, sink: &mut dyn OutputSink) -> Result<()> {
        let query_started = Instant::now();
        let document = &loaded.document;

        let contexts: Vec<Context<'_>> = document
            .models
            .iter()
            .filter(|m| {
                request
                    .model_nums
                    .as_ref()
                    .map_or(true, |nums| nums.contains(&m.model_num))
            })
            .map(Context::for_model)
            .collect();
        let query_time = query_started.elapsed();

        let mut writer = create_writer(request.format, &self.options);
        writer.start_data_block(&document.block.header)?;

        let result = result_table(&document.source_id, &request.describe(), contexts.len());
        writer.write_category(&result, &[])?;
        let stats = stats_table(loaded.origin, query_time);
        writer.write_category(&stats, &[])?;

        for category in document.block.categories() {
            if !request.wants_category(&category.name) {
                continue;
            }
            if category.name == ATOM_SITE {
                // An empty context list would mean "all rows".
                if contexts.is_empty() {
                    continue;
                }
                let provider = SourceCategory::new(category).with_row_selection();
                writer.write_category(&provider, &contexts)?;
            } else {
                let provider = SourceCategory::new(category);
                writer.write_category(&provider, &[])?;
            }
        }

        writer.encode()?;
        finish(writer.as_mut(), sink)
    }
}

/// Flush then always end the sink. A flush failure wins over an end
/// failure.
fn finish(writer: &mut dyn Writer, sink: &mut dyn OutputSink) -> Result<()> {
    let flushed = writer.flush(sink);
    let ended = sink.end().map_err(ServerError::Flush);
    flushed.and(ended)
}

// ============================================================================
// Meta categories
// ============================================================================

fn result_table(source_id: &str, query: &str, model_count: usize) -> StaticTable {
    StaticTable::new(CategoryDescriptor::new(
        "model_server_result",
        vec![
            FieldDescriptor::str("source_id"),
            FieldDescriptor::str("query"),
            FieldDescriptor::str("server_version"),
            FieldDescriptor::int("model_count"),
        ],
    ))
    .row(vec![
        source_id.into(),
        query.into(),
        env!("CARGO_PKG_VERSION").into(),
        Cell::Int(i32::try_from(model_count).unwrap_or(i32::MAX)),
    ])
}

fn stats_table(origin: LoadOrigin, query_time: Duration) -> StaticTable {
    StaticTable::new(CategoryDescriptor::new(
        "model_server_stats",
        vec![
            FieldDescriptor::int("io_time_ms"),
            FieldDescriptor::int("parse_time_ms"),
            FieldDescriptor::int("query_time_ms"),
        ],
    ))
    .row(vec![
        Cell::Int(millis_i32(origin.io_time())),
        Cell::Int(millis_i32(origin.parse_time())),
        Cell::Int(millis_i32(query_time)),
    ])
}

/// Whole milliseconds, saturating at `i32::MAX`.
fn millis_i32(d: Duration) -> i32 {
    i32::try_from(d.as_millis()).unwrap_or(i32::MAX)
}

fn error_table(message: &str) -> StaticTable {
    StaticTable::new(CategoryDescriptor::new(
        "model_server_error",
        vec![FieldDescriptor::str("message")],
    ))
    .row(vec![message.into()])
}

/// Render a one-category error document with `writer` and end the sink.
///
/// The sink is ended whether or not rendering succeeds. A failure here is
/// returned as-is (`Encode` before any byte reached the sink, `Flush` after)
/// and never retried.
pub fn write_error_document(
    mut writer: Box<dyn Writer>,
    sink: &mut dyn OutputSink,
    header: &str,
    message: &str,
) -> Result<()> {
    let rendered = render_error(writer.as_mut(), sink, header, message);
    let ended = sink.end().map_err(ServerError::Flush);

    if let Err(err) = &rendered {
        warn!(header = %header, error = %err, "Error document could not be written");
    }
    rendered.and(ended)
}

fn render_error(writer: &mut dyn Writer, sink: &mut dyn OutputSink, header: &str, message: &str) -> Result<()> {
    writer.start_data_block(header)?;
    writer.write_category(&error_table(message), &[])?;
    writer.encode()?;
    writer.flush(sink)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod service_tests {
    use super::*;
    use crate::model::{CategoryData, CategoryProvider};
    use crate::writer::{EncodedFile, TextWriter};
    use futures_util::future::BoxFuture;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TWO_MODELS: &str = "data_1abc
_entry.id 1ABC
loop_
_atom_site.id
_atom_site.label_comp_id
_atom_site.pdbx_PDB_model_num
1 ALA 1
2 GLY 1
3 ALA 2
";

    struct MapLoader {
        reads: AtomicUsize,
    }

    impl SourceLoader for MapLoader {
        fn read<'a>(&'a self, source_id: &'a str) -> BoxFuture<'a, io::Result<String>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                match source_id.to_lowercase().as_str() {
                    "1abc" => Ok(TWO_MODELS.to_string()),
                    "broken" => Ok("data_x\nloop_\n".to_string()),
                    _ => Err(io::Error::new(io::ErrorKind::NotFound, "no such source")),
                }
            })
        }
    }

    fn context(metrics: bool) -> (ServerContext, Arc<MapLoader>) {
        let loader = Arc::new(MapLoader { reads: AtomicUsize::new(0) });
        let config = ServerConfig { metrics, ..ServerConfig::default() };
        let ctx = ServerContext::with_loader(config, loader.clone()).unwrap();
        (ctx, loader)
    }

    /// Records writes and whether `end` was called; optionally refuses
    /// every write.
    #[derive(Default)]
    struct RecordingSink {
        data: Vec<u8>,
        ended: usize,
        fail_writes: bool,
    }

    impl OutputSink for RecordingSink {
        fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
            if self.fail_writes {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "client went away"));
            }
            self.data.extend_from_slice(bytes);
            Ok(())
        }

        fn end(&mut self) -> io::Result<()> {
            self.ended += 1;
            Ok(())
        }
    }

    impl RecordingSink {
        fn text(&self) -> String {
            String::from_utf8(self.data.clone()).unwrap()
        }
    }

    /// Writer whose encode step always fails.
    struct FailingWriter;

    impl Writer for FailingWriter {
        fn start_data_block(&mut self, _header: &str) -> Result<()> {
            Ok(())
        }

        fn write_category<'p>(&mut self, _provider: &'p dyn CategoryProvider, _contexts: &[Context<'p>]) -> Result<()> {
            Ok(())
        }

        fn encode(&mut self) -> Result<()> {
            Err(ServerError::encode("string table overflow"))
        }

        fn flush(&mut self, _sink: &mut dyn OutputSink) -> Result<()> {
            Err(ServerError::NotEncoded)
        }

        fn format(&self) -> OutputFormat {
            OutputFormat::Binary
        }
    }

    // ========================================================================
    // Requests
    // ========================================================================

    #[test]
    fn test_request_describe() {
        assert_eq!(QueryRequest::new("1abc", OutputFormat::Text).describe(), "full");
        let req = QueryRequest::new("1abc", OutputFormat::Text)
            .with_models(vec![1, 2])
            .with_categories(["atom_site"]);
        assert_eq!(req.describe(), "models=1,2;categories=atom_site");
    }

    #[test]
    fn test_request_from_json() {
        let req: QueryRequest =
            serde_json::from_str(r#"{"sourceId": "1ABC", "format": "binary", "categories": ["_entry"]}"#).unwrap();
        assert_eq!(req.format, OutputFormat::Binary);
        assert!(req.wants_category("entry"));
        assert!(!req.wants_category("atom_site"));
        assert!(req.model_nums.is_none());
    }

    // ========================================================================
    // Responses
    // ========================================================================

    #[tokio::test]
    async fn test_text_response_layout() {
        let (ctx, _) = context(false);
        let mut sink = RecordingSink::default();

        let outcome = ctx
            .respond(&QueryRequest::new("1abc", OutputFormat::Text), &mut sink)
            .await
            .unwrap();

        assert!(matches!(outcome, ResponseOutcome::Document { origin: LoadOrigin::Loaded { .. } }));
        assert_eq!(sink.ended, 1);
        let text = sink.text();
        assert!(text.starts_with("data_1ABC\n#\n_model_server_result.source_id"));
        assert!(text.contains("_model_server_result.model_count    2 \n"));
        assert!(text.contains("_model_server_stats.io_time_ms"));
        assert!(text.contains("_entry.id 1ABC \n"));
        assert!(text.contains("1 ALA 1 \n2 GLY 1 \n3 ALA 2 \n"));
    }

    #[tokio::test]
    async fn test_model_filter_selects_rows() {
        let (ctx, _) = context(false);
        let mut sink = RecordingSink::default();
        let req = QueryRequest::new("1abc", OutputFormat::Text).with_models(vec![2]);

        ctx.respond(&req, &mut sink).await.unwrap();

        let text = sink.text();
        // One atom left, so atom_site becomes a single record.
        assert!(text.contains("_atom_site.label_comp_id      ALA \n"));
        assert!(!text.contains("GLY"));
    }

    #[tokio::test]
    async fn test_unknown_model_omits_atoms() {
        let (ctx, _) = context(false);
        let mut sink = RecordingSink::default();
        let req = QueryRequest::new("1abc", OutputFormat::Text).with_models(vec![9]);

        ctx.respond(&req, &mut sink).await.unwrap();

        assert!(!sink.text().contains("_atom_site"));
        assert!(sink.text().contains("_entry.id"));
    }

    #[tokio::test]
    async fn test_category_filter() {
        let (ctx, _) = context(false);
        let mut sink = RecordingSink::default();
        let req = QueryRequest::new("1abc", OutputFormat::Text).with_categories(["ATOM_SITE"]);

        ctx.respond(&req, &mut sink).await.unwrap();

        let text = sink.text();
        assert!(text.contains("_atom_site.id"));
        assert!(!text.contains("_entry.id"));
        assert!(text.contains("_model_server_result"));
    }

    #[tokio::test]
    async fn test_binary_response_decodes() {
        let (ctx, _) = context(false);
        let mut sink = RecordingSink::default();

        ctx.respond(&QueryRequest::new("1abc", OutputFormat::Binary), &mut sink)
            .await
            .unwrap();

        let file: EncodedFile = rmp_serde::from_slice(&sink.data).unwrap();
        let block = &file.data_blocks[0];
        assert_eq!(block.header, "1ABC");
        assert_eq!(block.category("atom_site").unwrap().row_count, 3);
        assert_eq!(block.category("model_server_result").unwrap().row_count, 1);
    }

    #[tokio::test]
    async fn test_second_request_is_cached() {
        let (ctx, loader) = context(true);
        let req = QueryRequest::new("1ABC", OutputFormat::Text);

        ctx.respond(&req, &mut RecordingSink::default()).await.unwrap();
        let outcome = ctx.respond(&req, &mut RecordingSink::default()).await.unwrap();

        assert_eq!(outcome, ResponseOutcome::Document { origin: LoadOrigin::Cached });
        assert_eq!(loader.reads.load(Ordering::SeqCst), 1);

        let snap = ctx.metrics_snapshot().unwrap();
        assert_eq!(snap.cache_hits, 1);
        assert_eq!(snap.cache_misses, 1);
        assert_eq!(snap.loads, 1);
        assert_eq!(snap.text_requests, 2);
    }

    // ========================================================================
    // Failures
    // ========================================================================

    #[tokio::test]
    async fn test_missing_source_is_not_found() {
        let (ctx, _) = context(true);
        let mut sink = RecordingSink::default();

        let err = ctx
            .respond(&QueryRequest::new("nope", OutputFormat::Text), &mut sink)
            .await
            .unwrap_err();

        assert_eq!(err.code(), "NOT_FOUND");
        assert!(sink.data.is_empty());
        assert_eq!(sink.ended, 1);
        assert_eq!(ctx.metrics_snapshot().unwrap().failed_requests, 1);
    }

    #[tokio::test]
    async fn test_parse_error_becomes_error_document() {
        let (ctx, _) = context(false);
        let mut sink = RecordingSink::default();

        let outcome = ctx
            .respond(&QueryRequest::new("broken", OutputFormat::Text), &mut sink)
            .await
            .unwrap();

        assert!(matches!(outcome, ResponseOutcome::ErrorDocument { .. }));
        let text = sink.text();
        assert!(text.starts_with("data_BROKEN\n#\n_model_server_error.message"));
        assert_eq!(sink.ended, 1);
        assert!(!ctx.cache().contains("broken"));
    }

    #[tokio::test]
    async fn test_flush_failure_still_ends_sink() {
        let (ctx, _) = context(false);
        let mut sink = RecordingSink { fail_writes: true, ..Default::default() };

        let err = ctx
            .respond(&QueryRequest::new("1abc", OutputFormat::Binary), &mut sink)
            .await
            .unwrap_err();

        assert_eq!(err.code(), "FLUSH_ERROR");
        assert_eq!(sink.ended, 1);
    }

    #[test]
    fn test_error_document_encode_failure_ends_sink() {
        let mut sink = RecordingSink::default();

        let err = write_error_document(Box::new(FailingWriter), &mut sink, "1abc", "bad source").unwrap_err();

        assert_eq!(err.code(), "ENCODE_ERROR");
        assert!(sink.data.is_empty());
        assert_eq!(sink.ended, 1);
    }

    #[test]
    fn test_error_document_flush_failure_ends_sink() {
        let mut sink = RecordingSink { fail_writes: true, ..Default::default() };

        let err = write_error_document(Box::new(TextWriter::new(64)), &mut sink, "1abc", "bad").unwrap_err();

        assert_eq!(err.code(), "FLUSH_ERROR");
        assert_eq!(sink.ended, 1);
    }

    #[test]
    fn test_error_document_binary() {
        let mut sink = RecordingSink::default();
        let options = WriterOptions::default();

        write_error_document(create_writer(OutputFormat::Binary, &options), &mut sink, "1abc", "bad").unwrap();

        let file: EncodedFile = rmp_serde::from_slice(&sink.data).unwrap();
        let category = file.data_blocks[0].category("model_server_error").unwrap();
        assert_eq!(category.row_count, 1);
        assert!(category.column("message").is_some());
    }

    #[test]
    fn test_stats_times_saturate() {
        let origin = LoadOrigin::Loaded {
            io_time: Duration::from_secs(30 * 24 * 3600),
            parse_time: Duration::from_millis(12),
        };
        let stats = stats_table(origin, Duration::from_millis(3));

        assert_eq!(stats.int_value(0, 0), i32::MAX);
        assert_eq!(stats.int_value(1, 0), 12);
        assert_eq!(stats.int_value(2, 0), 3);
    }
}
