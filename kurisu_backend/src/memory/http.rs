use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::StatusCode;

use super::{
    AddMemoriesRequest, ChatMemoryResponse, ContextResponse, DeleteMemoryRequest, MemoryChain,
    MemoryStore, StatusResponse,
};
use crate::error::MemoryStoreError;
use crate::http_client::build_http_client;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Client for the memory façade served by `kurisu_memory_server`.
pub struct HttpMemoryStore {
    base_url: String,
    client: reqwest::Client,
}

impl HttpMemoryStore {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: build_http_client(REQUEST_TIMEOUT)?,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, MemoryStoreError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unable to read body".to_string());
    Err(MemoryStoreError::Rejected { status, body })
}

#[async_trait]
impl MemoryStore for HttpMemoryStore {
    async fn connect(&self) -> Result<(), MemoryStoreError> {
        let response = self.client.get(self.url("is_alive")).send().await?;
        let response = check_status(response).await.map_err(|e| {
            MemoryStoreError::Unavailable(format!("memory server is not alive: {}", e))
        })?;
        let status: StatusResponse = response.json().await?;
        tracing::info!("Connected to memory server at {}: {}", self.base_url, status.message);
        Ok(())
    }

    async fn close(&self) {
        tracing::debug!("Disconnected from memory server at {}", self.base_url);
    }

    async fn add_memories(&self, chain: &MemoryChain) -> Result<(), MemoryStoreError> {
        let body = AddMemoriesRequest {
            memory_chain: chain.clone(),
        };
        let response = self
            .client
            .post(self.url("add_memories"))
            .json(&body)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn get_context(&self, query: &str) -> Result<MemoryChain, MemoryStoreError> {
        let response = self
            .client
            .get(self.url("get_context"))
            .query(&[("query", query)])
            .send()
            .await?;
        let body: ContextResponse = check_status(response).await?.json().await?;
        Ok(body.context)
    }

    async fn get_chat_memory(&self, limit: usize) -> Result<MemoryChain, MemoryStoreError> {
        let response = self
            .client
            .get(self.url("get_chat_memory"))
            .query(&[("limit", limit)])
            .send()
            .await?;
        let body: ChatMemoryResponse = check_status(response).await?.json().await?;
        Ok(body.chat_history)
    }

    async fn delete_memory(&self, uuid: &str) -> Result<bool, MemoryStoreError> {
        let response = self
            .client
            .delete(self.url("delete_memory"))
            .json(&DeleteMemoryRequest {
                uuid: uuid.to_string(),
            })
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check_status(response).await?;
        Ok(true)
    }
}
