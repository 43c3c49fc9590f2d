use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// What the user sent. Exactly one kind per envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    Text(String),
    Photo(Vec<u8>),
    Voice(Vec<u8>),
}

impl Content {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Content::Text(_) => "text",
            Content::Photo(_) => "photo",
            Content::Voice(_) => "voice",
        }
    }
}

/// Who sent the message, as the originating adapter knows them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sender {
    /// Adapter-specific address used to route the reply (chat id, console, ...).
    pub id: String,
    pub name: String,
}

/// One inbound exchange travelling over the bus and back.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub id: String,
    /// Adapter that created the envelope and will deliver the reply.
    pub origin: String,
    pub sender: Sender,
    pub timestamp: DateTime<Utc>,
    pub content: Content,
    response: Option<String>,
}

impl Envelope {
    pub fn new(origin: impl Into<String>, sender: Sender, content: Content) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            origin: origin.into(),
            sender,
            timestamp: Utc::now(),
            content,
            response: None,
        }
    }

    pub fn text(origin: impl Into<String>, sender: Sender, text: impl Into<String>) -> Self {
        Self::new(origin, sender, Content::Text(text.into()))
    }

    pub fn response(&self) -> Option<&str> {
        self.response.as_deref()
    }

    /// Fill the response slot. It can only be filled once per envelope.
    pub fn set_response(&mut self, response: impl Into<String>) -> Result<()> {
        if self.response.is_some() {
            bail!("envelope {} already carries a response", self.id);
        }
        self.response = Some(response.into());
        Ok(())
    }
}
