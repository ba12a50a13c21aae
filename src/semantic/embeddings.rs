//! Embedding providers.
//!
//! - `OpenAiEmbedder`: remote `/embeddings` endpoint (OpenAI or Azure style)
//! - `LocalEmbedder`: fastembed model running in-process

use serde_json::Value;
use std::time::Duration;

use crate::{
    bookmarks::truncate_chars,
    config::{Config, EmbeddingProvider},
    llm::api_url,
    scrape::{with_retries, Transient},
};

/// Inputs longer than this are cut before embedding.
pub const MAX_EMBEDDING_CHARS: usize = 30000;

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Embedding model initialization failed: {0}")]
    InitFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Embedding request returned status {0}")]
    Status(u16),

    #[error("Embedding request timed out")]
    Timeout,

    #[error("Embedding index error: {0}")]
    Index(String),
}

impl Transient for EmbeddingError {
    fn is_transient(&self) -> bool {
        match self {
            EmbeddingError::Timeout => true,
            EmbeddingError::Status(code) => *code == 429 || *code >= 500,
            _ => false,
        }
    }
}

pub trait Embedder: Send + Sync {
    /// Identifies the vector space; vectors from different models never mix.
    fn model_name(&self) -> &str;
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

/// Reads `data[].embedding` from an `/embeddings` response, honoring `index`.
pub fn parse_embedding_response(json: Value) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let malformed = |msg: &str| EmbeddingError::EmbeddingFailed(msg.to_string());
    let data = json
        .get("data")
        .and_then(|v| v.as_array())
        .ok_or_else(|| malformed("response is missing data array"))?;

    let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
    for (fallback_index, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(fallback_index);
        let embedding = item
            .get("embedding")
            .and_then(|v| v.as_array())
            .ok_or_else(|| malformed("item is missing embedding array"))?;

        let vec = embedding
            .iter()
            .map(|value| value.as_f64().map(|n| n as f32))
            .collect::<Option<Vec<f32>>>()
            .ok_or_else(|| malformed("embedding values must be numeric"))?;
        indexed.push((index, vec));
    }

    indexed.sort_by_key(|(index, _)| *index);

    Ok(indexed.into_iter().map(|(_, vec)| vec).collect())
}

pub struct OpenAiEmbedder {
    url: String,
    model: String,
    api_key: String,
    azure: bool,
    timeout: Duration,
}

impl OpenAiEmbedder {
    pub fn from_config(config: &Config) -> Result<Self, EmbeddingError> {
        let settings = &config.embeddings;
        let api_key = settings
            .api_key
            .clone()
            .or_else(|| config.llm.api_key.clone())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| EmbeddingError::InitFailed("missing api key".to_string()))?;

        let endpoint = settings
            .endpoint
            .clone()
            .unwrap_or_else(|| config.llm.endpoint.clone());
        let api_version = config.llm.api_version.as_deref();

        Ok(OpenAiEmbedder {
            url: api_url(&endpoint, api_version, &settings.model, "embeddings"),
            model: settings.model.clone(),
            api_key,
            azure: api_version.is_some(),
            timeout: Duration::from_secs(settings.timeout_secs),
        })
    }
}

impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let text = truncate_chars(text, MAX_EMBEDDING_CHARS);
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|err| EmbeddingError::InitFailed(err.to_string()))?;
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });

        let json: Value = with_retries(&self.model, || {
            let mut req = client.post(&self.url).json(&body);
            req = if self.azure {
                req.header("api-key", &self.api_key)
            } else {
                req.bearer_auth(&self.api_key)
            };

            let resp = req.send().map_err(|err| {
                if err.is_timeout() {
                    EmbeddingError::Timeout
                } else {
                    EmbeddingError::EmbeddingFailed(err.to_string())
                }
            })?;
            if !resp.status().is_success() {
                return Err(EmbeddingError::Status(resp.status().as_u16()));
            }
            resp.json()
                .map_err(|err| EmbeddingError::EmbeddingFailed(err.to_string()))
        })?;

        parse_embedding_response(json)?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("No embedding returned".to_string()))
    }
}

/// On-device embeddings through fastembed, selected with `provider: local`.
/// `TextEmbedding::embed` takes `&mut self`, hence the mutex.
#[cfg(feature = "local-embeddings")]
pub struct LocalEmbedder {
    model: std::sync::Mutex<fastembed::TextEmbedding>,
    model_name: String,
}

#[cfg(feature = "local-embeddings")]
impl LocalEmbedder {
    /// Loads (downloading on first use) a fastembed model cached under `cache_dir/models`.
    pub fn new(model_name: &str, cache_dir: std::path::PathBuf) -> Result<Self, EmbeddingError> {
        let model_enum = Self::parse_model_name(model_name)?;

        let models_dir = cache_dir.join("models");
        std::fs::create_dir_all(&models_dir).map_err(|e| {
            EmbeddingError::InitFailed(format!("Failed to create models directory: {}", e))
        })?;

        let options = fastembed::InitOptions::new(model_enum)
            .with_cache_dir(models_dir)
            .with_show_download_progress(false);

        let model = fastembed::TextEmbedding::try_new(options)
            .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

        Ok(Self {
            model: std::sync::Mutex::new(model),
            model_name: model_name.to_string(),
        })
    }

    fn parse_model_name(name: &str) -> Result<fastembed::EmbeddingModel, EmbeddingError> {
        match name.to_lowercase().as_str() {
            "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
            "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
            "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
            "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
            _ => Err(EmbeddingError::InitFailed(format!(
                "Unknown model: {name}. Supported models: all-MiniLM-L6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5"
            ))),
        }
    }
}

#[cfg(feature = "local-embeddings")]
impl Embedder for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let text = truncate_chars(text, MAX_EMBEDDING_CHARS);
        let mut model = self.model.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        model
            .embed(vec![text], None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("No embedding returned".to_string()))
    }
}

/// Builds the configured embedder, or `None` when semantic search is off.
pub fn from_config(
    config: &Config,
) -> Result<Option<std::sync::Arc<dyn Embedder>>, EmbeddingError> {
    match config.embeddings.provider {
        EmbeddingProvider::None => Ok(None),
        EmbeddingProvider::Openai => Ok(Some(std::sync::Arc::new(
            OpenAiEmbedder::from_config(config)?,
        ))),
        #[cfg(feature = "local-embeddings")]
        EmbeddingProvider::Local => Ok(Some(std::sync::Arc::new(LocalEmbedder::new(
            &config.embeddings.model,
            std::path::PathBuf::from(config.base_path()),
        )?))),
        #[cfg(not(feature = "local-embeddings"))]
        EmbeddingProvider::Local => Err(EmbeddingError::InitFailed(
            "built without the local-embeddings feature".to_string(),
        )),
    }
}
