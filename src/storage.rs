/*!
Single-object blob storage

A `BlobStore` is bound to exactly one object. Writes can be made
conditional on the generation observed by an earlier read, which is
how the ideas list avoids losing concurrent appends.
*/
use std::fmt;
use std::sync::Arc;
use surf::StatusCode;

use crate::config::Config;
use crate::token::{Grant, StaleToken, TokenCache, TokenSource};
use crate::LOG;

/// Object contents and the generation they were read at
#[derive(Debug, Clone)]
pub struct Blob {
    pub data: Vec<u8>,
    pub generation: i64,
}

#[derive(Debug)]
pub enum StorageError {
    NotFound,
    // a conditional write lost against another writer
    PreconditionFailed,
    Other(crate::Error),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::NotFound => write!(f, "object not found"),
            StorageError::PreconditionFailed => write!(f, "object generation changed"),
            StorageError::Other(e) => write!(f, "storage error: {}", e),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<String> for StorageError {
    fn from(s: String) -> Self {
        StorageError::Other(s.into())
    }
}

#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Read the object; `NotFound` if it was never written
    async fn get(&self) -> Result<Blob, StorageError>;

    /// Replace the object contents, returning the new generation.
    ///
    /// With `if_generation: Some(g)` the write only succeeds if the object is
    /// currently at generation `g`, where `0` means "does not exist yet".
    async fn put(&self, data: Vec<u8>, if_generation: Option<i64>) -> Result<i64, StorageError>;
}

/// Access tokens for the default service account from the
/// GCE / Cloud Run metadata server
pub struct MetadataServer {
    token_url: String,
}

impl MetadataServer {
    pub fn new(token_url: &str) -> Self {
        Self {
            token_url: token_url.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl TokenSource for MetadataServer {
    fn name(&self) -> &'static str {
        "gce-metadata"
    }

    async fn fetch(&self) -> crate::Result<Grant> {
        let mut resp = surf::get(&self.token_url)
            .header("metadata-flavor", "Google")
            .send()
            .await
            .map_err(|e| se!("metadata token request error {}", e))?;
        if !resp.status().is_success() {
            let body = resp.body_string().await.unwrap_or_default();
            return Err(se!(
                "metadata token request failed with {}: {}",
                resp.status(),
                body
            )
            .into());
        }
        let grant: Grant = resp
            .body_json()
            .await
            .map_err(|e| se!("metadata token json error {}", e))?;
        Ok(grant)
    }
}

#[derive(serde::Deserialize)]
struct ObjectMetadata {
    // the json api encodes int64 fields as strings
    generation: String,
}

/// One object in a Google Cloud Storage bucket, via the JSON api
pub struct GcsObject {
    base_url: String,
    bucket: String,
    object: String,
    // `None` when talking to an emulator
    tokens: Option<Arc<TokenCache<MetadataServer>>>,
}

impl GcsObject {
    pub fn new(
        base_url: &str,
        bucket: &str,
        object: &str,
        tokens: Option<Arc<TokenCache<MetadataServer>>>,
    ) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            bucket: bucket.to_string(),
            object: object.to_string(),
            tokens,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let tokens = match config.storage_emulator_host {
            Some(_) => None,
            None => Some(Arc::new(TokenCache::new(
                MetadataServer::new(&config.metadata_token_url()),
                chrono::Duration::seconds(config.token_expiry_buffer_seconds),
            ))),
        };
        Self::new(
            &config.gcs_url(),
            &config.gcs_bucket,
            &config.gcs_object,
            tokens,
        )
    }

    fn location(&self) -> String {
        format!("gs://{}/{}", self.bucket, self.object)
    }

    fn url(&self, segments: &[&str]) -> Result<surf::Url, StorageError> {
        let mut url = surf::Url::parse(&self.base_url)
            .map_err(|e| se!("invalid storage url {} {}", self.base_url, e))?;
        url.path_segments_mut()
            .map_err(|_| se!("storage url {} cannot be a base", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn download_url(&self) -> Result<surf::Url, StorageError> {
        let mut url = self.url(&["storage", "v1", "b", &self.bucket, "o", &self.object])?;
        url.query_pairs_mut().append_pair("alt", "media");
        Ok(url)
    }

    fn upload_url(&self, if_generation: Option<i64>) -> Result<surf::Url, StorageError> {
        let mut url = self.url(&["upload", "storage", "v1", "b", &self.bucket, "o"])?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("uploadType", "media")
                .append_pair("name", &self.object);
            if let Some(generation) = if_generation {
                query.append_pair("ifGenerationMatch", &generation.to_string());
            }
        }
        Ok(url)
    }

    async fn authorization(&self) -> Result<Option<String>, StorageError> {
        let tokens = match &self.tokens {
            None => return Ok(None),
            Some(tokens) => tokens,
        };
        match tokens.get_token().await {
            Ok(token) => Ok(Some(format!("Bearer {}", token))),
            Err(StaleToken { token, source }) if !token.is_empty() => {
                slog::warn!(LOG, "using possibly expired storage token"; "error" => %source);
                Ok(Some(format!("Bearer {}", token)))
            }
            Err(e) => Err(StorageError::Other(Box::new(e))),
        }
    }
}

#[async_trait::async_trait]
impl BlobStore for GcsObject {
    async fn get(&self) -> Result<Blob, StorageError> {
        let mut req = surf::get(self.download_url()?);
        if let Some(auth) = self.authorization().await? {
            req = req.header("authorization", auth);
        }
        let mut resp = req
            .send()
            .await
            .map_err(|e| se!("error reading {} {}", self.location(), e))?;
        match resp.status() {
            StatusCode::NotFound => return Err(StorageError::NotFound),
            s if !s.is_success() => {
                let body = resp.body_string().await.unwrap_or_default();
                return Err(se!("error reading {}: {} {}", self.location(), s, body).into());
            }
            _ => (),
        }
        let generation = resp
            .header("x-goog-generation")
            .ok_or_else(|| se!("missing generation header reading {}", self.location()))?
            .last()
            .as_str()
            .parse::<i64>()
            .map_err(|e| se!("invalid generation header reading {} {}", self.location(), e))?;
        let data = resp
            .body_bytes()
            .await
            .map_err(|e| se!("error reading body of {} {}", self.location(), e))?;
        Ok(Blob { data, generation })
    }

    async fn put(&self, data: Vec<u8>, if_generation: Option<i64>) -> Result<i64, StorageError> {
        let mut body = surf::Body::from_bytes(data);
        body.set_mime(surf::http::mime::JSON);
        let mut req = surf::post(self.upload_url(if_generation)?).body(body);
        if let Some(auth) = self.authorization().await? {
            req = req.header("authorization", auth);
        }
        let mut resp = req
            .send()
            .await
            .map_err(|e| se!("error writing {} {}", self.location(), e))?;
        match resp.status() {
            StatusCode::PreconditionFailed => return Err(StorageError::PreconditionFailed),
            s if !s.is_success() => {
                let body = resp.body_string().await.unwrap_or_default();
                return Err(se!("error writing {}: {} {}", self.location(), s, body).into());
            }
            _ => (),
        }
        let meta: ObjectMetadata = resp
            .body_json()
            .await
            .map_err(|e| se!("object metadata json error for {} {}", self.location(), e))?;
        let generation = meta
            .generation
            .parse::<i64>()
            .map_err(|e| se!("invalid generation for {} {}", self.location(), e))?;
        slog::debug!(LOG, "wrote object"; "object" => self.location(), "generation" => generation);
        Ok(generation)
    }
}

/// An in-process object with the same generation rules as GCS
#[cfg(test)]
pub struct MemoryBlob {
    inner: async_mutex::Mutex<Option<Blob>>,
}

#[cfg(test)]
impl MemoryBlob {
    pub fn new() -> Self {
        Self {
            inner: async_mutex::Mutex::new(None),
        }
    }

    pub fn with_contents(data: Vec<u8>) -> Self {
        Self {
            inner: async_mutex::Mutex::new(Some(Blob {
                data,
                generation: 1,
            })),
        }
    }
}

#[cfg(test)]
#[async_trait::async_trait]
impl BlobStore for MemoryBlob {
    async fn get(&self) -> Result<Blob, StorageError> {
        let lock = self.inner.lock().await;
        lock.clone().ok_or(StorageError::NotFound)
    }

    async fn put(&self, data: Vec<u8>, if_generation: Option<i64>) -> Result<i64, StorageError> {
        let mut lock = self.inner.lock().await;
        let current = lock.as_ref().map(|b| b.generation).unwrap_or(0);
        if let Some(expected) = if_generation {
            if expected != current {
                return Err(StorageError::PreconditionFailed);
            }
        }
        let generation = current + 1;
        *lock = Some(Blob { data, generation });
        Ok(generation)
    }
}
