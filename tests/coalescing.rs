//! Integration test: concurrent loads of one source share a single read.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{join_all, BoxFuture};

use modelserver::{
    LoadError, LoadOrigin, OutputFormat, QueryRequest, ServerConfig, ServerContext, SourceLoader,
    SourceProvider,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const SOURCE: &str = "data_1crn
loop_
_atom_site.id
_atom_site.label_comp_id
1 THR
2 THR
";

/// Serves `SOURCE` for every id except "missing", after a delay, counting
/// physical reads.
struct SlowLoader {
    reads: AtomicUsize,
    delay: Duration,
}

impl SlowLoader {
    fn new(delay_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            reads: AtomicUsize::new(0),
            delay: Duration::from_millis(delay_ms),
        })
    }

    fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl SourceLoader for SlowLoader {
    fn read<'a>(&'a self, source_id: &'a str) -> BoxFuture<'a, io::Result<String>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            if source_id == "missing" {
                Err(io::Error::new(io::ErrorKind::NotFound, "no such file"))
            } else {
                Ok(SOURCE.to_string())
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn five_concurrent_loads_read_once() {
    let loader = SlowLoader::new(50);
    let provider = SourceProvider::new(loader.clone());

    let results = join_all((0..5).map(|_| provider.load("1crn"))).await;

    assert_eq!(loader.reads(), 1);
    assert_eq!(provider.in_flight(), 0);

    let loaded: Vec<_> = results.into_iter().map(Result::unwrap).collect();
    assert!(loaded[0].origin.is_fresh());
    for waiter in &loaded[1..] {
        assert_eq!(waiter.origin, LoadOrigin::Coalesced);
        assert_eq!(waiter.origin.io_time(), Duration::ZERO);
        assert!(Arc::ptr_eq(&waiter.document, &loaded[0].document));
    }
}

#[tokio::test(start_paused = true)]
async fn keys_coalesce_after_normalization() {
    let loader = SlowLoader::new(10);
    let provider = SourceProvider::new(loader.clone());

    let results = join_all(["1crn", "1CRN", " 1Crn "].map(|id| provider.load(id))).await;

    assert_eq!(loader.reads(), 1);
    assert!(results.iter().all(Result::is_ok));
}

#[tokio::test(start_paused = true)]
async fn errors_fan_out_to_every_waiter() {
    let loader = SlowLoader::new(20);
    let provider = SourceProvider::new(loader.clone());

    let results = join_all((0..4).map(|_| provider.load("missing"))).await;

    assert_eq!(loader.reads(), 1);
    for result in results {
        let err = result.unwrap_err();
        assert!(matches!(err, LoadError::Io { .. }));
        assert_eq!(err.source_id(), "missing");
    }
}

#[tokio::test(start_paused = true)]
async fn finished_load_is_not_reused_by_provider() {
    let loader = SlowLoader::new(5);
    let provider = SourceProvider::new(loader.clone());

    provider.load("1crn").await.unwrap();
    let second = provider.load("1crn").await.unwrap();

    assert_eq!(loader.reads(), 2);
    assert!(second.origin.is_fresh());
}

// ---------------------------------------------------------------------------
// Through the server context
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn concurrent_requests_read_once_and_cache_once() {
    let loader = SlowLoader::new(30);
    let config = ServerConfig {
        metrics: true,
        ..ServerConfig::default()
    };
    let ctx = ServerContext::with_loader(config, loader.clone()).unwrap();

    let request = QueryRequest::new("1crn", OutputFormat::Text);
    let responses = join_all((0..5).map(|_| {
        let ctx = &ctx;
        let request = &request;
        async move {
            let mut out: Vec<u8> = Vec::new();
            let outcome = ctx.respond(request, &mut out).await;
            (outcome, out)
        }
    }))
    .await;

    assert_eq!(loader.reads(), 1);
    assert_eq!(ctx.cache().len(), 1);

    let first = String::from_utf8(responses[0].1.clone()).unwrap();
    for (outcome, out) in &responses {
        assert!(outcome.is_ok());
        // Same document, same atoms; only the timing category differs.
        let text = String::from_utf8(out.clone()).unwrap();
        assert!(text.contains("1 THR \n2 THR \n"));
        assert_eq!(text.lines().count(), first.lines().count());
    }

    let snap = ctx.metrics_snapshot().unwrap();
    assert_eq!(snap.loads, 1);
    assert_eq!(snap.cache_misses, 5);

    // Later requests are cache hits.
    let mut out: Vec<u8> = Vec::new();
    ctx.respond(&request, &mut out).await.unwrap();
    assert_eq!(loader.reads(), 1);
    assert_eq!(ctx.metrics_snapshot().unwrap().cache_hits, 1);
}

#[tokio::test(start_paused = true)]
async fn load_is_cached_when_first_requester_goes_away() {
    let loader = SlowLoader::new(50);
    let config = ServerConfig {
        metrics: true,
        ..ServerConfig::default()
    };
    let ctx = Arc::new(ServerContext::with_loader(config, loader.clone()).unwrap());
    let request = QueryRequest::new("1crn", OutputFormat::Text);

    let spawn_request = |ctx: Arc<ServerContext>, request: QueryRequest| {
        tokio::spawn(async move {
            let mut out: Vec<u8> = Vec::new();
            ctx.respond(&request, &mut out).await.map(|_| out)
        })
    };

    // The first request starts the read, the second joins it.
    let first = spawn_request(ctx.clone(), request.clone());
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = spawn_request(ctx.clone(), request.clone());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(ctx.provider().in_flight(), 1);

    first.abort();
    assert!(first.await.unwrap_err().is_cancelled());

    let out = second.await.unwrap().unwrap();
    assert!(String::from_utf8(out).unwrap().contains("1 THR \n2 THR \n"));
    assert_eq!(ctx.cache().len(), 1);
    assert_eq!(ctx.metrics_snapshot().unwrap().loads, 1);

    let mut out: Vec<u8> = Vec::new();
    ctx.respond(&request, &mut out).await.unwrap();
    assert_eq!(loader.reads(), 1);
    assert_eq!(ctx.metrics_snapshot().unwrap().cache_hits, 1);
}
