//! Load + parse with request coalescing.
//!
//! The first `load` for a key spawns the read; later calls for the same key
//! register a waiter and share its outcome. Every waiter is answered exactly
//! once, in registration order, after which the key is forgotten and the
//! next `load` reads again (the document cache sits in front of this).
//!
//! An optional [`LoadHook`] runs inside the load task after a successful
//! read and before any waiter is answered, so its side effects do not depend
//! on which callers are still waiting.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::{normalize_key, SourceDocument, SourceLoader};
use crate::error::LoadError;

/// How a caller got its document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOrigin {
    /// This caller triggered the read.
    Loaded { io_time: Duration, parse_time: Duration },
    /// Joined a read another caller started.
    Coalesced,
    /// Served from the document cache.
    Cached,
}

impl LoadOrigin {
    pub fn is_fresh(&self) -> bool {
        matches!(self, LoadOrigin::Loaded { .. })
    }

    pub fn io_time(&self) -> Duration {
        match self {
            LoadOrigin::Loaded { io_time, .. } => *io_time,
            _ => Duration::ZERO,
        }
    }

    pub fn parse_time(&self) -> Duration {
        match self {
            LoadOrigin::Loaded { parse_time, .. } => *parse_time,
            _ => Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadedDocument {
    pub document: Arc<SourceDocument>,
    pub origin: LoadOrigin,
}

type LoadOutcome = Result<LoadedDocument, LoadError>;
type PendingMap = HashMap<String, Vec<oneshot::Sender<LoadOutcome>>>;

/// Called once per physical read that parsed successfully, with the origin
/// set to `Loaded`.
pub type LoadHook = Arc<dyn Fn(&LoadedDocument) + Send + Sync>;

pub struct SourceProvider {
    loader: Arc<dyn SourceLoader>,
    pending: Arc<Mutex<PendingMap>>,
    on_loaded: Option<LoadHook>,
}

impl SourceProvider {
    pub fn new(loader: Arc<dyn SourceLoader>) -> Self {
        Self {
            loader,
            pending: Arc::new(Mutex::new(HashMap::new())),
            on_loaded: None,
        }
    }

    pub fn with_load_hook(mut self, hook: LoadHook) -> Self {
        self.on_loaded = Some(hook);
        self
    }

    /// Number of keys with a read in flight.
    pub fn in_flight(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Load and parse `source_id`, joining an in-flight read for the same
    /// normalized key if there is one.
    pub async fn load(&self, source_id: &str) -> LoadOutcome {
        let source_id = source_id.trim();
        let key = normalize_key(source_id);
        let (tx, rx) = oneshot::channel();

        let first = {
            let mut pending = self.pending.lock().unwrap();
            match pending.get_mut(&key) {
                Some(waiters) => {
                    waiters.push(tx);
                    debug!(key = %key, waiters = waiters.len(), "Joined in-flight load");
                    false
                }
                None => {
                    pending.insert(key.clone(), vec![tx]);
                    true
                }
            }
        };

        if first {
            let loader = self.loader.clone();
            let pending = self.pending.clone();
            let on_loaded = self.on_loaded.clone();
            let id = source_id.to_string();
            // Runs to completion even if every caller has gone away.
            tokio::spawn(async move {
                let outcome = read_and_parse(loader.as_ref(), &id).await;
                let waiters = pending.lock().unwrap().remove(&key).unwrap_or_default();
                deliver(&key, waiters, outcome, on_loaded.as_ref());
            });
        }

        rx.await.unwrap_or_else(|_| {
            Err(LoadError::Io {
                source_id: source_id.to_string(),
                message: "load task ended without delivering a result".to_string(),
            })
        })
    }
}

struct ReadResult {
    document: SourceDocument,
    io_time: Duration,
    parse_time: Duration,
}

async fn read_and_parse(loader: &dyn SourceLoader, source_id: &str) -> Result<ReadResult, LoadError> {
    let io_start = Instant::now();
    let text = loader
        .read(source_id)
        .await
        .map_err(|e| LoadError::io(source_id, &e))?;
    let io_time = io_start.elapsed();

    let parse_start = Instant::now();
    let id = source_id.to_string();
    let document = tokio::task::spawn_blocking(move || SourceDocument::from_text(&id, &text))
        .await
        .map_err(|e| LoadError::parse(source_id, format!("parse task failed: {}", e)))??;
    let parse_time = parse_start.elapsed();

    info!(
        key = %document.key,
        bytes = document.raw_size,
        io_ms = io_time.as_millis() as u64,
        parse_ms = parse_time.as_millis() as u64,
        models = document.models.len(),
        "Loaded source"
    );

    Ok(ReadResult {
        document,
        io_time,
        parse_time,
    })
}

fn deliver(
    key: &str,
    waiters: Vec<oneshot::Sender<LoadOutcome>>,
    outcome: Result<ReadResult, LoadError>,
    on_loaded: Option<&LoadHook>,
) {
    let count = waiters.len();
    match outcome {
        Ok(read) => {
            let loaded = LoadedDocument {
                document: Arc::new(read.document),
                origin: LoadOrigin::Loaded {
                    io_time: read.io_time,
                    parse_time: read.parse_time,
                },
            };
            if let Some(hook) = on_loaded {
                hook(&loaded);
            }
            for (i, waiter) in waiters.into_iter().enumerate() {
                let origin = if i == 0 { loaded.origin } else { LoadOrigin::Coalesced };
                let _ = waiter.send(Ok(LoadedDocument {
                    document: loaded.document.clone(),
                    origin,
                }));
            }
        }
        Err(err) => {
            warn!(key = %key, waiters = count, error = %err, "Source load failed");
            for waiter in waiters {
                let _ = waiter.send(Err(err.clone()));
            }
        }
    }
    if count > 1 {
        debug!(key = %key, waiters = count, "Delivered coalesced load");
    }
}

#[cfg(test)]
mod provider_tests {
    use super::*;
    use futures_util::future::{BoxFuture, FutureExt};
    use std::io;

    struct StaticLoader(&'static str);

    impl SourceLoader for StaticLoader {
        fn read<'a>(&'a self, _source_id: &'a str) -> BoxFuture<'a, io::Result<String>> {
            let text = self.0.to_string();
            async move { Ok(text) }.boxed()
        }
    }

    struct MissingLoader;

    impl SourceLoader for MissingLoader {
        fn read<'a>(&'a self, source_id: &'a str) -> BoxFuture<'a, io::Result<String>> {
            async move {
                Err(io::Error::new(io::ErrorKind::NotFound, format!("{} is gone", source_id)))
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_single_load_is_fresh() {
        let provider = SourceProvider::new(Arc::new(StaticLoader("data_a\n_x.y 1\n")));
        let loaded = provider.load(" A ").await.unwrap();

        assert!(loaded.origin.is_fresh());
        assert_eq!(loaded.document.key, "a");
        assert_eq!(provider.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_io_error_is_delivered() {
        let provider = SourceProvider::new(Arc::new(MissingLoader));
        let err = provider.load("1abc").await.unwrap_err();
        assert!(!err.is_parse());
        assert!(err.to_string().contains("1abc is gone"));
    }

    #[tokio::test]
    async fn test_parse_error_is_delivered() {
        let provider = SourceProvider::new(Arc::new(StaticLoader("no blocks here")));
        let err = provider.load("x").await.unwrap_err();
        assert!(err.is_parse());
    }

    #[tokio::test]
    async fn test_sequential_loads_read_again() {
        let provider = SourceProvider::new(Arc::new(StaticLoader("data_a\n")));
        let first = provider.load("a").await.unwrap();
        let second = provider.load("a").await.unwrap();
        assert!(first.origin.is_fresh());
        assert!(second.origin.is_fresh());
        assert!(!Arc::ptr_eq(&first.document, &second.document));
    }

    #[tokio::test]
    async fn test_load_hook_runs_once_per_read() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let provider = SourceProvider::new(Arc::new(StaticLoader("data_a\n"))).with_load_hook(Arc::new(
            move |loaded: &LoadedDocument| {
                assert!(loaded.origin.is_fresh());
                seen.fetch_add(1, Ordering::SeqCst);
            },
        ));

        provider.load("a").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_load_hook_skipped_on_error() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let provider = SourceProvider::new(Arc::new(MissingLoader)).with_load_hook(Arc::new(
            move |_: &LoadedDocument| {
                seen.fetch_add(1, Ordering::SeqCst);
            },
        ));

        assert!(provider.load("gone").await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_origin_times() {
        let origin = LoadOrigin::Loaded {
            io_time: Duration::from_millis(5),
            parse_time: Duration::from_millis(7),
        };
        assert_eq!(origin.io_time(), Duration::from_millis(5));
        assert_eq!(LoadOrigin::Coalesced.parse_time(), Duration::ZERO);
        assert!(!LoadOrigin::Cached.is_fresh());
    }
}
