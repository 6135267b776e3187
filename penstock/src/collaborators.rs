//! Contracts for the services job handlers talk to.
//!
//! The queue itself never calls these; handlers and the notification bridge
//! do. Production code supplies real implementations, tests supply fakes.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::error::HandlerError;
use crate::events::JobEvent;

/// Error returned by a text completion service.
#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("completion service rate limited the request")]
    RateLimited,
    #[error("completion request timed out")]
    Timeout,
    #[error("invalid completion input: {0}")]
    InvalidInput(String),
    #[error("completion service returned {status}: {message}")]
    Upstream { status: u16, message: String },
}

impl From<CompletionError> for HandlerError {
    fn from(err: CompletionError) -> Self {
        let rendered = err.to_string();
        match err {
            CompletionError::RateLimited => HandlerError::RateLimited(rendered),
            CompletionError::Timeout => HandlerError::Timeout(rendered),
            CompletionError::InvalidInput(message) => HandlerError::Validation(message),
            CompletionError::Upstream { status, message } => {
                HandlerError::Upstream { status, message }
            }
        }
    }
}

/// Turns a prompt into a structured result.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<Value, CompletionError>;
}

/// Persists handler output against a domain entity.
///
/// Implementations must make `save` an upsert: a retried job may write the
/// same update twice.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn save(&self, entity_id: &str, update: Value) -> anyhow::Result<()>;
}

/// Delivers lifecycle events to something outside the process.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn notify(&self, event: &JobEvent) -> anyhow::Result<()>;
}

/// `Storage` kept in a map, merging object fields on every save.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    entities: Mutex<HashMap<String, Value>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, entity_id: &str) -> Option<Value> {
        self.entities.lock().get(entity_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entities.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn save(&self, entity_id: &str, update: Value) -> anyhow::Result<()> {
        let mut entities = self.entities.lock();
        let entry = entities
            .entry(entity_id.to_string())
            .or_insert_with(|| Value::Object(Map::new()));

        match (entry, update) {
            (Value::Object(existing), Value::Object(fields)) => {
                existing.extend(fields);
            }
            (slot, other) => *slot = other,
        }
        Ok(())
    }
}
