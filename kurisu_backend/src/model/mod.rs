//! Model port: everything the conversation controller needs from a language model.

pub mod format;
pub mod openai;
pub mod pool;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ModelError;

pub use format::ChatFormat;
pub use openai::OpenAiCompatibleModel;
pub use pool::GenerationPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One role-tagged utterance in the conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Result of a single `generate` call.
#[derive(Debug, Clone)]
pub struct Generation {
    pub content: String,
    pub finish_reason: Option<String>,
    pub usage: Usage,
    pub elapsed: Duration,
}

/// Contract the controller consumes. `generate` may take a long time and is
/// always driven from a [`GenerationPool`] thread, never from the bus worker.
#[async_trait]
pub trait ModelPort: Send + Sync {
    /// Bring the model online. Returns `true` if it is usable afterwards;
    /// calling it again once loaded is cheap and returns `true`.
    async fn load(&self) -> bool;

    async fn generate(&self, turns: &[Turn]) -> Result<Generation, ModelError>;

    /// Render turns into the model's textual prompt, used for token budgeting.
    fn format_prompt(&self, turns: &[Turn]) -> String;

    async fn count_tokens(&self, text: &str) -> Result<usize, ModelError>;

    async fn close(&self);
}
