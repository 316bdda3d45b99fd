//! Model Server - Unix socket server for coordinate queries
//!
//! Usage:
//!   model-server [--config server.json] [--source-root DIR] [--socket PATH]
//!                [--cache-bytes N] [--ttl-ms N] [--metrics] [--auto-tune]
//!
//! Protocol:
//!   Request:  [4-byte length BE] [MessagePack payload]
//!   Response: [4-byte length BE] [MessagePack payload]
//!
//! Each request is a map with a `cmd` field (`query`, `stats`,
//! `expireCache`, `ping`, `shutdown`) and an optional `requestId` that is
//! echoed back on the response.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::{bail, Context as _};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing_subscriber::EnvFilter;

use modelserver::metrics::SLOW_REQUEST_THRESHOLD_MS;
use modelserver::{MetricsSnapshot, QueryRequest, ResponseOutcome, ServerConfig, ServerContext};

static NEXT_CLIENT_ID: AtomicUsize = AtomicUsize::new(1);

/// Frames larger than this are rejected before reading the payload.
const MAX_MESSAGE_BYTES: usize = 100 * 1024 * 1024;

// ============================================================================
// Wire Protocol Types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
pub enum Request {
    /// Render a source as text or binary.
    Query(QueryRequest),
    /// Metrics (when enabled) and cache occupancy.
    Stats,
    /// Drop every cached document.
    ExpireCache,
    Ping,
    Shutdown,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Response {
    Payload {
        format: String,
        #[serde(rename = "errorDocument")]
        error_document: bool,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    Stats {
        #[serde(rename = "cachedDocuments")]
        cached_documents: usize,
        #[serde(rename = "cacheBytes")]
        cache_bytes: usize,
        #[serde(rename = "inFlight")]
        in_flight: usize,
        metrics: Option<MetricsSnapshot>,
    },
    Expired { expired: usize },
    Pong { pong: bool, version: String },
    Ok { ok: bool },
    Error { error: String, code: String },
}

#[derive(Debug, Deserialize)]
struct RequestEnvelope {
    #[serde(default, rename = "requestId")]
    request_id: Option<String>,
    #[serde(flatten)]
    request: Request,
}

#[derive(Serialize)]
struct ResponseEnvelope {
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
    #[serde(flatten)]
    response: Response,
}

fn request_kind(request: &Request) -> &'static str {
    match request {
        Request::Query(_) => "query",
        Request::Stats => "stats",
        Request::ExpireCache => "expireCache",
        Request::Ping => "ping",
        Request::Shutdown => "shutdown",
    }
}

// ============================================================================
// Request Handling
// ============================================================================

async fn handle_request(ctx: &ServerContext, request: Request) -> Response {
    match request {
        Request::Query(query) => {
            let mut data: Vec<u8> = Vec::new();
            match ctx.respond(&query, &mut data).await {
                Ok(outcome) => Response::Payload {
                    format: query.format.as_str().to_string(),
                    error_document: matches!(outcome, ResponseOutcome::ErrorDocument { .. }),
                    data,
                },
                Err(e) => Response::Error {
                    error: e.to_string(),
                    code: e.code().to_string(),
                },
            }
        }

        Request::Stats => Response::Stats {
            cached_documents: ctx.cache().len(),
            cache_bytes: ctx.cache().total_bytes(),
            in_flight: ctx.provider().in_flight(),
            metrics: ctx.metrics_snapshot(),
        },

        Request::ExpireCache => Response::Expired {
            expired: ctx.cache().expire_all(),
        },

        Request::Ping => Response::Pong {
            pong: true,
            version: env!("CARGO_PKG_VERSION").to_string(),
        },

        Request::Shutdown => Response::Ok { ok: true },
    }
}

// ============================================================================
// Client Connection Handler
// ============================================================================

async fn read_message(stream: &mut UnixStream) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Message too large: {} bytes", len),
        ));
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

async fn write_message(stream: &mut UnixStream, data: &[u8]) -> std::io::Result<()> {
    let len = data.len() as u32;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(data).await?;
    stream.flush().await
}

fn encode_envelope(request_id: Option<String>, response: Response) -> Option<Vec<u8>> {
    let envelope = ResponseEnvelope { request_id, response };
    match rmp_serde::to_vec_named(&envelope) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            eprintln!("[model-server] Serialize error: {}", e);
            None
        }
    }
}

async fn handle_client(mut stream: UnixStream, ctx: Arc<ServerContext>, client_id: usize) {
    tracing::debug!(client_id, "Client connected");

    loop {
        let msg = match read_message(&mut stream).await {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                tracing::debug!(client_id, "Client disconnected");
                break;
            }
            Err(e) => {
                eprintln!("[model-server] Client {} read error: {}", client_id, e);
                break;
            }
        };

        let (request_id, request) = match rmp_serde::from_slice::<RequestEnvelope>(&msg) {
            Ok(env) => (env.request_id, env.request),
            Err(e) => {
                let response = Response::Error {
                    error: format!("Invalid request: {}", e),
                    code: "INVALID_REQUEST".to_string(),
                };
                if let Some(bytes) = encode_envelope(None, response) {
                    let _ = write_message(&mut stream, &bytes).await;
                }
                continue;
            }
        };

        let is_shutdown = matches!(request, Request::Shutdown);
        let kind = request_kind(&request);
        let start = Instant::now();

        let response = handle_request(&ctx, request).await;

        let duration_ms = start.elapsed().as_millis() as u64;
        if duration_ms >= SLOW_REQUEST_THRESHOLD_MS {
            tracing::warn!(client_id, kind, duration_ms, "Slow request");
        }

        if let Some(bytes) = encode_envelope(request_id, response) {
            if let Err(e) = write_message(&mut stream, &bytes).await {
                eprintln!("[model-server] Client {} write error: {}", client_id, e);
                break;
            }
        }

        if is_shutdown {
            eprintln!("[model-server] Shutdown requested by client {}", client_id);
            ctx.cache().shutdown();
            let _ = std::fs::remove_file(&ctx.config().socket_path);
            std::process::exit(0);
        }
    }
}

// ============================================================================
// Main
// ============================================================================

const USAGE: &str = "Usage: model-server [--config <file>] [--source-root <dir>] [--socket <path>]
                    [--cache-bytes <n>] [--ttl-ms <n>] [--metrics] [--auto-tune]

Options:
  --config       JSON configuration file (flags override it)
  --source-root  Directory that source ids resolve against
  --socket       Unix socket path (default: /tmp/model-server.sock)
  --cache-bytes  Document cache budget in bytes
  --ttl-ms       Idle time before a cached document expires
  --metrics      Enable request metrics collection
  --auto-tune    Size the cache from available memory";

/// `--config` first, then the remaining flags on top of it.
fn load_config(args: &[String]) -> anyhow::Result<ServerConfig> {
    let mut rest: Vec<String> = Vec::with_capacity(args.len());
    let mut config_path = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            config_path = Some(iter.next().context("--config requires a value")?);
        } else {
            rest.push(arg.clone());
        }
    }

    let mut config = match config_path {
        Some(path) => ServerConfig::from_file(Path::new(path))
            .with_context(|| format!("Failed to load config '{}'", path))?,
        None => ServerConfig::default(),
    };

    let unknown = config.apply_args(&rest)?;
    if let Some(arg) = unknown.first() {
        bail!("Unknown argument '{}'", arg);
    }
    config.validate()?;
    Ok(config)
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("modelserver=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("{}", USAGE);
        return;
    }

    init_logging();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("[model-server] {:#}", e);
            eprintln!();
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    };

    eprintln!("[model-server] Starting model-server v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("[model-server] Source root: {:?}", config.source_root);
    eprintln!(
        "[model-server] Cache: {} MB, entry TTL {} ms",
        config.cache_max_bytes / (1024 * 1024),
        config.cache_entry_ttl_ms
    );
    if config.metrics {
        eprintln!("[model-server] Metrics collection enabled");
    }

    let socket_path = config.socket_path.clone();
    let ctx = match ServerContext::new(config) {
        Ok(ctx) => Arc::new(ctx),
        Err(e) => {
            eprintln!("[model-server] {}", e);
            std::process::exit(2);
        }
    };

    // A stale socket from a previous run would make bind fail.
    let _ = std::fs::remove_file(&socket_path);
    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("[model-server] Failed to bind {:?}: {}", socket_path, e);
            std::process::exit(1);
        }
    };
    eprintln!("[model-server] Listening on {:?}", socket_path);

    let ctx_for_signal = Arc::clone(&ctx);
    let socket_for_signal = socket_path.clone();
    let mut signals = match signal_hook::iterator::Signals::new([
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
    ]) {
        Ok(signals) => signals,
        Err(e) => {
            eprintln!("[model-server] Failed to register signal handlers: {}", e);
            std::process::exit(1);
        }
    };

    thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            eprintln!("[model-server] Received signal {}, shutting down...", sig);
            ctx_for_signal.cache().shutdown();
            let _ = std::fs::remove_file(&socket_for_signal);
            eprintln!("[model-server] Exiting");
            std::process::exit(0);
        }
    });

    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(handle_client(stream, Arc::clone(&ctx), client_id));
            }
            Err(e) => {
                eprintln!("[model-server] Accept error: {}", e);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
