//! Ollama-backed workload loader
//!
//! Ollama keeps models resident on the GPU for `keep_alive` after a request.
//! Loading warms a model with an empty request, unloading sends
//! `keep_alive: 0`, and embedding goes through `/api/embed`.

use crate::slots::{Workload, WorkloadLoader};
use crate::{AgentError, Result};

use async_trait::async_trait;
use idlegpu_core::{WorkloadConfig, WorkloadKind};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// How long Ollama should keep a model resident
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
enum KeepAlive<'a> {
    Duration(&'a str),
    Seconds(u64),
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    keep_alive: KeepAlive<'a>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a str,
    keep_alive: KeepAlive<'a>,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Thin client for the endpoints the loader needs
#[derive(Clone)]
struct OllamaApi {
    client: Client,
    base_url: String,
    keep_alive: String,
}

impl OllamaApi {
    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<reqwest::Response> {
        let url = self.url(path);
        debug!("POST {}", url);

        let response = self.client.post(&url).json(body).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AgentError::Workload(format!(
                "Ollama request to {} failed: {} - {}",
                path, status, error_text
            )));
        }
        Ok(response)
    }

    async fn warm(&self, kind: WorkloadKind, model: &str, keep_alive: KeepAlive<'_>) -> Result<()> {
        match kind {
            WorkloadKind::Conversational => {
                let request = GenerateRequest {
                    model,
                    keep_alive,
                    stream: false,
                };
                self.post("api/generate", &request).await?;
            }
            WorkloadKind::Embedding => {
                let request = EmbedRequest {
                    model,
                    input: "",
                    keep_alive,
                };
                self.post("api/embed", &request).await?;
            }
        }
        Ok(())
    }

    async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>> {
        let request = EmbedRequest {
            model,
            input: text,
            keep_alive: KeepAlive::Duration(&self.keep_alive),
        };
        let response: EmbedResponse = self
            .post("api/embed", &request)
            .await?
            .json()
            .await
            .map_err(|e| AgentError::Workload(format!("Invalid embed response: {}", e)))?;

        first_embedding(response)
    }
}

fn first_embedding(response: EmbedResponse) -> Result<Vec<f32>> {
    response
        .embeddings
        .into_iter()
        .next()
        .filter(|vector| !vector.is_empty())
        .ok_or_else(|| AgentError::Workload("Ollama returned no embedding".to_string()))
}

/// Loads chat and embedding models into a local Ollama server
pub struct OllamaLoader {
    api: OllamaApi,
}

impl OllamaLoader {
    pub fn new(config: &WorkloadConfig) -> Result<Self> {
        info!("Creating Ollama loader for endpoint: {}", config.ollama_url);

        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| AgentError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            api: OllamaApi {
                client,
                base_url: config.ollama_url.clone(),
                keep_alive: config.keep_alive.clone(),
            },
        })
    }
}

#[async_trait]
impl WorkloadLoader for OllamaLoader {
    async fn load(&self, kind: WorkloadKind, name: &str) -> Result<Arc<dyn Workload>> {
        self.api
            .warm(kind, name, KeepAlive::Duration(&self.api.keep_alive))
            .await?;
        info!("Ollama {} model {} is warm", kind, name);

        let workload: Arc<dyn Workload> = Arc::new(OllamaWorkload {
            api: self.api.clone(),
            kind,
            name: name.to_string(),
        });
        Ok(workload)
    }
}

/// A model resident in Ollama
struct OllamaWorkload {
    api: OllamaApi,
    kind: WorkloadKind,
    name: String,
}

#[async_trait]
impl Workload for OllamaWorkload {
    async fn unload(&self) -> Result<()> {
        self.api.warm(self.kind, &self.name, KeepAlive::Seconds(0)).await?;
        info!("Ollama released {} model {}", self.kind, self.name);
        Ok(())
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if self.kind != WorkloadKind::Embedding {
            return Err(AgentError::Workload(format!(
                "{} is a {} model and cannot embed",
                self.name, self.kind
            )));
        }
        self.api.embed(&self.name, text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn api(base_url: &str) -> OllamaApi {
        OllamaApi {
            client: Client::new(),
            base_url: base_url.to_string(),
            keep_alive: "10m".to_string(),
        }
    }

    #[test]
    fn test_url_joining() {
        assert_eq!(
            api("http://localhost:11434").url("api/embed"),
            "http://localhost:11434/api/embed"
        );
        assert_eq!(
            api("http://localhost:11434/").url("/api/generate"),
            "http://localhost:11434/api/generate"
        );
    }

    #[test]
    fn test_keep_alive_serialization() {
        let warm = GenerateRequest {
            model: "llama2",
            keep_alive: KeepAlive::Duration("10m"),
            stream: false,
        };
        assert_eq!(
            serde_json::to_value(&warm).unwrap(),
            json!({"model": "llama2", "keep_alive": "10m", "stream": false})
        );

        let unload = EmbedRequest {
            model: "mpnet",
            input: "",
            keep_alive: KeepAlive::Seconds(0),
        };
        assert_eq!(serde_json::to_value(&unload).unwrap()["keep_alive"], json!(0));
    }

    #[test]
    fn test_first_embedding() {
        let response: EmbedResponse = serde_json::from_value(json!({
            "model": "mpnet",
            "embeddings": [[0.1, 0.2], [0.3, 0.4]]
        }))
        .unwrap();
        assert_eq!(first_embedding(response).unwrap(), vec![0.1, 0.2]);

        let empty: EmbedResponse = serde_json::from_value(json!({"embeddings": []})).unwrap();
        assert!(first_embedding(empty).is_err());
    }

    #[tokio::test]
    async fn test_load_against_unreachable_server_fails() {
        let config = WorkloadConfig {
            ollama_url: "http://127.0.0.1:9".to_string(),
            request_timeout_seconds: 2,
            ..WorkloadConfig::default()
        };
        let loader = OllamaLoader::new(&config).unwrap();
        assert!(loader.load(WorkloadKind::Embedding, "mpnet").await.is_err());
    }

    #[tokio::test]
    async fn test_conversational_workload_cannot_embed() {
        let workload = OllamaWorkload {
            api: api("http://127.0.0.1:9"),
            kind: WorkloadKind::Conversational,
            name: "llama2".to_string(),
        };
        assert!(matches!(workload.embed("hi").await, Err(AgentError::Workload(_))));
    }
}
