//! Artifact lookup over an ordered list of candidate sources.
//!
//! The scan stage writes its report asynchronously, so the locator walks the
//! candidates in priority order and can repeat the whole scan a bounded
//! number of times before giving up with the full list of places it tried.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::errors::LocateError;
use crate::util::sleep_or_cancel;

/// One place an artifact might live.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Human-readable location, used in diagnostics.
    fn describe(&self) -> String;

    /// Full content, or `None` if the source is absent or unreadable.
    /// Must never return a partial read.
    async fn fetch(&self) -> Option<String>;
}

/// A plain-text file on disk.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Absolute candidates are kept as-is; relative ones resolve against `base`.
    pub fn resolve(base: &Path, candidate: &str) -> Self {
        let candidate = Path::new(candidate);
        if candidate.is_absolute() {
            Self::new(candidate)
        } else {
            Self::new(base.join(candidate))
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ArtifactSource for FileSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn fetch(&self) -> Option<String> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Some(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "artifact candidate unreadable");
                None
            }
        }
    }
}

/// In-memory source whose content can appear later; used to embed the
/// locator without touching the filesystem.
#[derive(Debug, Clone)]
pub struct MemorySource {
    label: String,
    content: Arc<RwLock<Option<String>>>,
}

impl MemorySource {
    pub fn empty(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            content: Arc::new(RwLock::new(None)),
        }
    }

    pub fn with_content(label: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            content: Arc::new(RwLock::new(Some(content.into()))),
        }
    }

    pub async fn set(&self, content: impl Into<String>) {
        *self.content.write().await = Some(content.into());
    }
}

#[async_trait]
impl ArtifactSource for MemorySource {
    fn describe(&self) -> String {
        self.label.clone()
    }

    async fn fetch(&self) -> Option<String> {
        self.content.read().await.clone()
    }
}

/// Retrieved artifact text and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactContent {
    pub location: String,
    pub text: String,
}

/// Ordered candidate search. The first existing candidate wins even if
/// later ones exist too.
#[derive(Clone, Default)]
pub struct ArtifactLocator {
    sources: Vec<Arc<dyn ArtifactSource>>,
}

impl ArtifactLocator {
    pub fn new(sources: Vec<Arc<dyn ArtifactSource>>) -> Self {
        Self { sources }
    }

    /// File candidates, relative ones resolved against `base`.
    pub fn from_paths<S: AsRef<str>>(base: &Path, candidates: &[S]) -> Self {
        let sources = candidates
            .iter()
            .map(|c| Arc::new(FileSource::resolve(base, c.as_ref())) as Arc<dyn ArtifactSource>)
            .collect();
        Self { sources }
    }

    pub fn candidates(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.describe()).collect()
    }

    /// Single pass over the candidates.
    pub async fn locate(&self) -> Result<ArtifactContent, LocateError> {
        match self.scan().await {
            Some(found) => Ok(found),
            None => Err(LocateError::NotFound {
                attempted: self.candidates(),
                attempts: 1,
            }),
        }
    }

    /// Repeat the scan up to `attempts` times, `delay` apart.
    pub async fn locate_with_retry(
        &self,
        attempts: u32,
        delay: Duration,
        cancel: &CancellationToken,
    ) -> Result<ArtifactContent, LocateError> {
        let attempts = attempts.max(1);
        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(LocateError::Cancelled);
            }
            if let Some(found) = self.scan().await {
                tracing::info!(location = %found.location, attempt, "artifact located");
                return Ok(found);
            }
            tracing::debug!(attempt, attempts, "artifact not present yet");
            if attempt < attempts && !sleep_or_cancel(delay, cancel).await {
                return Err(LocateError::Cancelled);
            }
        }
        Err(LocateError::NotFound {
            attempted: self.candidates(),
            attempts,
        })
    }

    async fn scan(&self) -> Option<ArtifactContent> {
        for source in &self.sources {
            if let Some(text) = source.fetch().await {
                return Some(ArtifactContent {
                    location: source.describe(),
                    text,
                });
            }
        }
        None
    }
}
