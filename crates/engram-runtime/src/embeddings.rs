use futures::future::BoxFuture;
use serde::Deserialize;

use engram_types::Node;

use crate::config::Config;
use crate::{Error, Result};

/// Seam to the embedding provider. Vectors are opaque; callers must only
/// compare vectors carrying the same model tag.
pub trait EmbeddingProvider: Send + Sync {
    fn model(&self) -> &str;
    fn embed<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<Vec<f32>>>;
}

/// HTTP provider speaking the common `/embeddings` shape. Accepts both the
/// bare `{embedding: [...]}` response of local servers and the OpenAI-style
/// `{data: [{embedding: [...]}]}` envelope.
pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    dimensions: usize,
}

#[derive(Deserialize)]
struct BareResponse {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct EnvelopeItem {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct EnvelopeResponse {
    data: Vec<EnvelopeItem>,
}

impl HttpEmbeddingProvider {
    pub fn from_config(config: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.embedding_base_url.trim_end_matches('/').to_string(),
            api_key: config.embedding_api_key.clone(),
            model: config.embedding_model.clone(),
            dimensions: config.embedding_dimensions,
        }
    }

    async fn request(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/embeddings", self.base_url);
        let mut req = self.client.post(&url).json(&serde_json::json!({
            "model": self.model,
            "input": text,
        }));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req
            .send()
            .await
            .map_err(|e| Error::Embedding(format!("request to {}: {}", url, e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Embedding(format!("{} returned {}", url, status)));
        }

        let body = response
            .text()
            .await
            .map_err(|e| Error::Embedding(e.to_string()))?;

        let vector = if let Ok(bare) = serde_json::from_str::<BareResponse>(&body) {
            bare.embedding
        } else if let Ok(envelope) = serde_json::from_str::<EnvelopeResponse>(&body) {
            envelope
                .data
                .into_iter()
                .next()
                .map(|item| item.embedding)
                .unwrap_or_default()
        } else {
            return Err(Error::Embedding("unrecognized embedding response".to_string()));
        };

        if vector.is_empty() || (self.dimensions > 0 && vector.len() != self.dimensions) {
            return Err(Error::Embedding(format!(
                "expected {} dimensions, got {}",
                self.dimensions,
                vector.len()
            )));
        }
        Ok(vector)
    }
}

impl EmbeddingProvider for HttpEmbeddingProvider {
    fn model(&self) -> &str {
        &self.model
    }

    fn embed<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<Vec<f32>>> {
        Box::pin(self.request(text))
    }
}

/// The text embedded for a node: summary plus tags. Decisions and lessons
/// stay in FTS; the vector is for gist-level similarity.
pub fn embedding_text(node: &Node) -> String {
    let mut text = node.content.summary.clone();
    for tag in &node.semantic.tags {
        text.push(' ');
        text.push_str(tag);
    }
    text
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn response_shapes_parse() {
        let bare: BareResponse = serde_json::from_str(r#"{"embedding": [0.1, 0.2]}"#).unwrap();
        assert_eq!(bare.embedding.len(), 2);

        let envelope: EnvelopeResponse =
            serde_json::from_str(r#"{"data": [{"embedding": [0.1]}]}"#).unwrap();
        assert_eq!(envelope.data[0].embedding.len(), 1);
    }
}
