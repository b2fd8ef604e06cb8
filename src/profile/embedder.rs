use super::ProfileText;
use anyhow::Result;
use async_openai::{types::CreateEmbeddingRequestArgs, Client};
use async_trait::async_trait;
use std::time::Instant;

/// Turns profile text into an embedding vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: ProfileText) -> Result<Vec<f32>>;
}

#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client,
    model: String,
}

impl OpenAiEmbedder {
    pub fn new(model: String) -> Self {
        Self {
            client: Client::new(),
            model,
        }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: ProfileText) -> Result<Vec<f32>> {
        let start = Instant::now();
        let request = CreateEmbeddingRequestArgs::default()
            .model(self.model.as_str())
            .input(text)
            .build()?;
        info!("request embedding, wait for response...");
        let vector = self
            .client
            .embeddings()
            .create(request)
            .await?
            .data
            .into_iter()
            .next()
            .map(|e| e.embedding)
            .ok_or_else(|| anyhow::anyhow!("embedding response has no data"))?;
        let elapsed = start.elapsed().as_secs_f64();
        info!("embedding with {} spends {}s", self.model, elapsed);
        Ok(vector)
    }
}
