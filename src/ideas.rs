use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

use crate::storage::{BlobStore, StorageError};
use crate::LOG;

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq)]
pub struct Idea {
    pub time: DateTime<Utc>,
    pub idea: String,
}

#[derive(Debug)]
pub enum IdeaError {
    /// the submitted idea can't be stored, reported back to the client
    Invalid(String),
    Storage(StorageError),
}

impl fmt::Display for IdeaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdeaError::Invalid(msg) => write!(f, "invalid idea: {}", msg),
            IdeaError::Storage(e) => write!(f, "ideas storage error: {}", e),
        }
    }
}

impl std::error::Error for IdeaError {}

impl From<StorageError> for IdeaError {
    fn from(e: StorageError) -> Self {
        IdeaError::Storage(e)
    }
}

/// Parse a stored blob, newest idea first.
///
/// The current format is one json array kept newest first. Older blobs
/// are newline delimited json objects appended oldest first, so those
/// get reversed.
fn decode(data: &[u8]) -> Result<Vec<Idea>, StorageError> {
    let text = std::str::from_utf8(data).map_err(|e| se!("ideas blob is not utf8 {}", e))?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(vec![]);
    }
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed)
            .map_err(|e| se!("ideas blob json error {}", e).into());
    }
    let mut ideas = trimmed
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str::<Idea>(line))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| se!("legacy ideas blob json error {}", e))?;
    ideas.reverse();
    Ok(ideas)
}

/// All ideas, newest first, stored as a single json blob
pub struct IdeasStore {
    blobs: Arc<dyn BlobStore>,
    max_attempts: u32,
}

impl IdeasStore {
    pub fn new(blobs: Arc<dyn BlobStore>, max_attempts: u32) -> Self {
        Self {
            blobs,
            max_attempts: max_attempts.max(1),
        }
    }

    async fn load(&self) -> Result<(Vec<Idea>, i64), StorageError> {
        match self.blobs.get().await {
            Ok(blob) => Ok((decode(&blob.data)?, blob.generation)),
            // nothing has been written yet
            Err(StorageError::NotFound) => Ok((vec![], 0)),
            Err(e) => Err(e),
        }
    }

    /// Up to `limit` ideas starting `offset` from the newest
    pub async fn list(&self, offset: usize, limit: usize) -> Result<Vec<Idea>, IdeaError> {
        let (ideas, _) = self.load().await?;
        Ok(ideas.into_iter().skip(offset).take(limit).collect())
    }

    /// Store a new idea as the newest entry.
    ///
    /// Writes are conditional on the generation that was read, so two
    /// concurrent appends can't drop each other's idea. A lost race is
    /// retried against the newer contents.
    pub async fn append(&self, text: &str) -> Result<Idea, IdeaError> {
        if text.trim().is_empty() {
            return Err(IdeaError::Invalid("idea must not be empty".to_string()));
        }
        let idea = Idea {
            time: Utc::now(),
            idea: text.to_string(),
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let (mut ideas, generation) = self.load().await?;
            ideas.insert(0, idea.clone());
            let data = serde_json::to_vec(&ideas)
                .map_err(|e| StorageError::from(se!("ideas encode error {}", e)))?;
            match self.blobs.put(data, Some(generation)).await {
                Ok(generation) => {
                    slog::info!(
                        LOG, "stored new idea";
                        "count" => ideas.len(), "generation" => generation, "attempt" => attempt,
                    );
                    return Ok(idea);
                }
                Err(StorageError::PreconditionFailed) if attempt < self.max_attempts => {
                    slog::debug!(LOG, "ideas changed while appending, retrying"; "attempt" => attempt);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
