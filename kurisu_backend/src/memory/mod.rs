//! Memory store port and its wire types.
//!
//! A chain is oldest-first when it comes from `get_chat_memory` and
//! best-match-first when it comes from `get_context`.

pub mod http;
pub mod server;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MemoryStoreError;

pub use http::HttpMemoryStore;
pub use sqlite::SqliteMemoryStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    pub from_name: String,
    pub message: String,
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certainty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

impl MemoryRecord {
    pub fn new(from_name: impl Into<String>, message: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self {
            uuid: None,
            from_name: from_name.into(),
            message: message.into(),
            time,
            distance: None,
            certainty: None,
            score: None,
        }
    }

    /// One line of the persona context block.
    pub fn context_line(&self) -> String {
        format!(
            "{}: {} sent at {}",
            self.from_name,
            self.message,
            self.time.format("%Y-%m-%d %H:%M:%S")
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryChain(pub Vec<MemoryRecord>);

impl MemoryChain {
    pub fn new(records: Vec<MemoryRecord>) -> Self {
        Self(records)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MemoryRecord> {
        self.0.iter()
    }

    pub fn push(&mut self, record: MemoryRecord) {
        self.0.push(record);
    }

    pub fn render_context(&self) -> String {
        self.0
            .iter()
            .map(MemoryRecord::context_line)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl IntoIterator for MemoryChain {
    type Item = MemoryRecord;
    type IntoIter = std::vec::IntoIter<MemoryRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Persistence and retrieval of past exchanges.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn connect(&self) -> Result<(), MemoryStoreError>;

    async fn close(&self);

    /// Store every record; records already present are skipped, not errors.
    async fn add_memories(&self, chain: &MemoryChain) -> Result<(), MemoryStoreError>;

    /// Records similar to `query`, best first. Empty when nothing qualifies.
    async fn get_context(&self, query: &str) -> Result<MemoryChain, MemoryStoreError>;

    /// The most recent `limit` records, oldest first.
    async fn get_chat_memory(&self, limit: usize) -> Result<MemoryChain, MemoryStoreError>;

    /// Returns `false` when no record carries `uuid`.
    async fn delete_memory(&self, uuid: &str) -> Result<bool, MemoryStoreError>;
}

// Wire bodies of the memory HTTP façade, shared by client and server.

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    pub message: String,
}

impl StatusResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status: "ok".to_string(),
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddMemoriesRequest {
    pub memory_chain: MemoryChain,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ContextQuery {
    pub query: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ContextResponse {
    pub context: MemoryChain,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatMemoryQuery {
    pub limit: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatMemoryResponse {
    pub chat_history: MemoryChain,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteMemoryRequest {
    pub uuid: String,
}
