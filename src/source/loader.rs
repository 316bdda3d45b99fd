use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use futures_util::future::{BoxFuture, FutureExt};
use tracing::debug;

/// Raw text access for source ids.
pub trait SourceLoader: Send + Sync {
    fn read<'a>(&'a self, source_id: &'a str) -> BoxFuture<'a, io::Result<String>>;
}

/// Reads sources from a directory. `<id>`, `<id>.cif` and `<id>.cif.gz`
/// are tried in that order; a `.gz` suffix means gzip.
#[derive(Debug, Clone)]
pub struct FsLoader {
    root: PathBuf,
}

impl FsLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn candidates(&self, source_id: &str) -> io::Result<Vec<PathBuf>> {
        let relative = Path::new(source_id);
        let safe = !source_id.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("source id '{}' is not a relative file name", source_id),
            ));
        }

        let mut ids = vec![source_id.to_string()];
        let lower = source_id.to_lowercase();
        if lower != source_id {
            ids.push(lower);
        }

        let mut paths = Vec::with_capacity(ids.len() * 3);
        for id in &ids {
            paths.push(self.root.join(id));
            paths.push(self.root.join(format!("{}.cif", id)));
            paths.push(self.root.join(format!("{}.cif.gz", id)));
        }
        Ok(paths)
    }

    async fn resolve(&self, source_id: &str) -> io::Result<PathBuf> {
        for path in self.candidates(source_id)? {
            if let Ok(meta) = tokio::fs::metadata(&path).await {
                if meta.is_file() {
                    return Ok(path);
                }
            }
        }
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no source file for '{}' under {}", source_id, self.root.display()),
        ))
    }
}

impl SourceLoader for FsLoader {
    fn read<'a>(&'a self, source_id: &'a str) -> BoxFuture<'a, io::Result<String>> {
        async move {
            let path = self.resolve(source_id).await?;
            let bytes = tokio::fs::read(&path).await?;
            let gzipped = path.extension().map_or(false, |ext| ext == "gz");
            debug!(path = %path.display(), bytes = bytes.len(), gzipped, "Read source");

            if gzipped {
                tokio::task::spawn_blocking(move || gunzip(&bytes))
                    .await
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
            } else {
                into_text(bytes)
            }
        }
        .boxed()
    }
}

fn gunzip(bytes: &[u8]) -> io::Result<String> {
    let mut decoder = flate2::read::GzDecoder::new(bytes);
    let mut out = Vec::with_capacity(bytes.len() * 4);
    decoder.read_to_end(&mut out)?;
    into_text(out)
}

fn into_text(bytes: Vec<u8>) -> io::Result<String> {
    String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
