//! Server configuration.
//!
//! Loaded from an optional JSON file, then overridden from the command
//! line. Every field has a default, so an empty file (`{}`) is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::{MemoryRefreshKind, RefreshKind, System};

use crate::error::{Result, ServerError};
use crate::writer::sink::DEFAULT_CHUNK_CAPACITY;
use crate::writer::WriterOptions;

// ── Constants ───────────────────────────────────────────────────────

const MB: usize = 1024 * 1024;
const GB: usize = 1024 * 1024 * 1024;

const DEFAULT_CACHE_BYTES: usize = 2 * GB;
const DEFAULT_ENTRY_TTL_MS: u64 = 10 * 60 * 1000;

/// Auto-tuned cache floor (256 MB).
const AUTO_CACHE_MIN: usize = 256 * MB;

/// Auto-tuned cache ceiling (8 GB).
const AUTO_CACHE_MAX: usize = 8 * GB;

/// Fraction of available memory given to the document cache.
const AUTO_CACHE_FRACTION: f64 = 0.25;

// ── ServerConfig ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    /// Directory that source ids resolve against.
    pub source_root: PathBuf,
    /// Unix socket the server binary listens on.
    pub socket_path: PathBuf,
    pub cache_max_bytes: usize,
    pub cache_entry_ttl_ms: u64,
    pub text_chunk_capacity: usize,
    /// Collect request metrics.
    pub metrics: bool,
    /// Written into every binary container.
    pub encoder_tag: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            source_root: PathBuf::from("."),
            socket_path: PathBuf::from("/tmp/model-server.sock"),
            cache_max_bytes: DEFAULT_CACHE_BYTES,
            cache_entry_ttl_ms: DEFAULT_ENTRY_TTL_MS,
            text_chunk_capacity: DEFAULT_CHUNK_CAPACITY,
            metrics: false,
            encoder_tag: format!("modelserver {}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ServerConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Defaults with the cache sized from the memory available right now.
    pub fn auto_tuned() -> Self {
        let mut config = Self::default();
        config.apply_auto_tune();
        config
    }

    pub fn apply_auto_tune(&mut self) {
        let mut sys = System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
        );
        sys.refresh_memory();
        self.cache_max_bytes = cache_bytes_for(sys.available_memory());
    }

    /// Apply command-line overrides. `args` excludes the program name.
    /// Unrecognised arguments are returned for the caller to handle.
    pub fn apply_args(&mut self, args: &[String]) -> Result<Vec<String>> {
        let mut rest = Vec::new();
        let mut i = 0;
        while i < args.len() {
            let flag = args[i].as_str();
            match flag {
                "--source-root" => self.source_root = PathBuf::from(flag_value(args, i)?),
                "--socket" => self.socket_path = PathBuf::from(flag_value(args, i)?),
                "--cache-bytes" => self.cache_max_bytes = parse_number(flag, flag_value(args, i)?)?,
                "--ttl-ms" => self.cache_entry_ttl_ms = parse_number(flag, flag_value(args, i)?)?,
                "--metrics" => {
                    self.metrics = true;
                    i += 1;
                    continue;
                }
                "--auto-tune" => {
                    self.apply_auto_tune();
                    i += 1;
                    continue;
                }
                _ => {
                    rest.push(args[i].clone());
                    i += 1;
                    continue;
                }
            }
            i += 2;
        }
        Ok(rest)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache_max_bytes == 0 {
            return Err(ServerError::InvalidConfig("cacheMaxBytes must be positive".into()));
        }
        if self.cache_entry_ttl_ms == 0 {
            return Err(ServerError::InvalidConfig("cacheEntryTtlMs must be positive".into()));
        }
        if self.text_chunk_capacity == 0 {
            return Err(ServerError::InvalidConfig("textChunkCapacity must be positive".into()));
        }
        Ok(())
    }

    pub fn entry_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_entry_ttl_ms)
    }

    pub fn writer_options(&self) -> WriterOptions {
        WriterOptions {
            encoder_tag: self.encoder_tag.clone(),
            text_chunk_capacity: self.text_chunk_capacity,
        }
    }
}

fn flag_value(args: &[String], i: usize) -> Result<&str> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| ServerError::InvalidConfig(format!("{} requires a value", args[i])))
}

fn parse_number<T: std::str::FromStr>(flag: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| ServerError::InvalidConfig(format!("{} expects a number, got '{}'", flag, value)))
}

/// 25% of available memory, clamped to [256 MB, 8 GB].
pub fn cache_bytes_for(available_memory_bytes: u64) -> usize {
    let raw = (available_memory_bytes as f64 * AUTO_CACHE_FRACTION) as usize;
    raw.clamp(AUTO_CACHE_MIN, AUTO_CACHE_MAX)
}

// ── Tests ───────────────────────────────────────────────────────────
