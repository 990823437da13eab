//! Remote embedding backend for OpenAI-compatible `/v1/embeddings` endpoints.
//!
//! The API key is read from a configurable environment variable (dotenv files
//! included) at construction; a missing key is reported as
//! [`EmbedderError::MissingCredentials`] so the generator can demote to the
//! local backend. The HTTP client is built lazily on first use, which keeps
//! construction free of I/O.

use std::time::Duration;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::embedder::{Embedder, EmbedderError, EmbedderResult, fit_dimension};

const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct RemoteEmbedderConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key_env: String,
    pub timeout: Duration,
    pub retries: u32,
    pub dimension: usize,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

pub struct RemoteEmbedder {
    config: RemoteEmbedderConfig,
    api_key: String,
    client: OnceCell<reqwest::blocking::Client>,
}

impl RemoteEmbedder {
    pub fn new(config: RemoteEmbedderConfig) -> EmbedderResult<Self> {
        let api_key = dotenvy::var(&config.api_key_env)
            .ok()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
            .ok_or_else(|| EmbedderError::MissingCredentials(config.api_key_env.clone()))?;
        if config.endpoint.trim().is_empty() {
            return Err(EmbedderError::Unavailable(
                "remote endpoint is empty".to_string(),
            ));
        }
        Ok(Self {
            config,
            api_key,
            client: OnceCell::new(),
        })
    }

    fn client(&self) -> EmbedderResult<&reqwest::blocking::Client> {
        self.client.get_or_try_init(|| {
            reqwest::blocking::Client::builder()
                .timeout(self.config.timeout)
                .build()
                .map_err(|e| EmbedderError::Unavailable(format!("build HTTP client: {e}")))
        })
    }

    fn request_once(&self, text: &str) -> EmbedderResult<Vec<f32>> {
        let body = EmbeddingRequest {
            model: &self.config.model,
            input: text,
        };
        let response = self
            .client()?
            .post(&self.config.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    EmbedderError::Timeout(self.config.timeout)
                } else {
                    EmbedderError::EmbeddingFailed(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(EmbedderError::EmbeddingFailed(format!(
                "{} returned HTTP {status}",
                self.config.endpoint
            )));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .map_err(|e| EmbedderError::EmbeddingFailed(format!("decode response: {e}")))?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|datum| datum.embedding)
            .filter(|embedding| !embedding.is_empty())
            .ok_or_else(|| EmbedderError::EmbeddingFailed("response has no embedding".to_string()))
    }
}

impl Embedder for RemoteEmbedder {
    fn embed(&self, text: &str) -> EmbedderResult<Vec<f32>> {
        let mut last_err = None;
        for attempt in 0..=self.config.retries {
            match self.request_once(text) {
                Ok(vector) => return Ok(fit_dimension(vector, self.config.dimension)),
                Err(err) => {
                    debug!(attempt, error = %err, "remote embedding attempt failed");
                    last_err = Some(err);
                    if attempt < self.config.retries {
                        std::thread::sleep(RETRY_BACKOFF_BASE * 2u32.pow(attempt.min(6)));
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            EmbedderError::EmbeddingFailed("no attempt was made".to_string())
        }))
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }

    fn id(&self) -> &str {
        &self.config.model
    }

    fn is_semantic(&self) -> bool {
        true
    }
}

impl std::fmt::Debug for RemoteEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteEmbedder")
            .field("endpoint", &self.config.endpoint)
            .field("model", &self.config.model)
            .field("retries", &self.config.retries)
            .finish_non_exhaustive()
    }
}
