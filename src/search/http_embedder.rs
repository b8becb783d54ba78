//! HTTP client for the sentence-embedding service.
//!
//! Wire format: `POST {base_url}/embeds` with `{"texts": [..]}`, answered by
//! `{"embeddings": [[f32; D], ..]}`. Every request carries a hard timeout and is
//! attempted exactly once.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::embedder::{EmbedderError, EmbedderResult, EmbeddingClient, validate_embeddings};

#[derive(Debug, Clone)]
pub struct HttpEmbedderConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub dimension: usize,
    pub model_id: String,
}

impl Default for HttpEmbedderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000".to_string(),
            timeout: Duration::from_secs(10),
            dimension: 384,
            model_id: "minilm-384".to_string(),
        }
    }
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    texts: &'a [&'a str],
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

pub struct HttpEmbedder {
    config: HttpEmbedderConfig,
    client: reqwest::blocking::Client,
}

impl HttpEmbedder {
    pub fn new(config: HttpEmbedderConfig) -> EmbedderResult<Self> {
        if config.dimension == 0 {
            return Err(EmbedderError::InvalidInput(
                "dimension must be non-zero".into(),
            ));
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .user_agent(concat!("listing-search/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| EmbedderError::Unavailable(format!("building http client: {e}")))?;
        Ok(Self { config, client })
    }

    fn endpoint(&self) -> String {
        format!("{}/embeds", self.config.base_url.trim_end_matches('/'))
    }

    fn map_transport_error(&self, err: reqwest::Error) -> EmbedderError {
        if err.is_timeout() {
            EmbedderError::Timeout(self.config.timeout.as_millis() as u64)
        } else {
            EmbedderError::Unavailable(err.to_string())
        }
    }
}

impl EmbeddingClient for HttpEmbedder {
    fn id(&self) -> &str {
        &self.config.model_id
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }

    fn embed_batch(&self, texts: &[&str]) -> EmbedderResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let start = Instant::now();
        let response = self
            .client
            .post(self.endpoint())
            .json(&EmbedRequest { texts })
            .send()
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(EmbedderError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: EmbedResponse = response.json().map_err(|e| {
            if e.is_timeout() {
                EmbedderError::Timeout(self.config.timeout.as_millis() as u64)
            } else {
                EmbedderError::Unavailable(format!("malformed embedding response: {e}"))
            }
        })?;
        validate_embeddings(&parsed.embeddings, texts.len(), self.config.dimension)?;

        debug!(
            batch_size = texts.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "embedding batch completed"
        );
        Ok(parsed.embeddings)
    }
}
