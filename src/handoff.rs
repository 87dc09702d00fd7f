//! Short-lived payload handoff for QR codes.
//!
//! A kiosk posts a large payload and gets back a short id that fits in a QR
//! code; a phone then fetches the payload by id. Entries live in process
//! memory only and are pruned lazily on every insert.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;

const ID_LEN: usize = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandoffError {
    #[error("Payload is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("Payload is empty")]
    Empty,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffEntry {
    pub id: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

pub struct HandoffStore {
    ttl: chrono::Duration,
    max_payload_bytes: usize,
    entries: RwLock<HashMap<String, HandoffEntry>>,
}

impl HandoffStore {
    pub fn new(ttl: Duration, max_payload_bytes: usize) -> Self {
        Self {
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(1)),
            max_payload_bytes,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, payload: Value) -> Result<HandoffEntry, HandoffError> {
        self.insert_at(payload, Utc::now()).await
    }

    /// Payload for `id`, or `None` when unknown or expired.
    pub async fn get(&self, id: &str) -> Option<HandoffEntry> {
        self.get_at(id, Utc::now()).await
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    async fn insert_at(
        &self,
        payload: Value,
        now: DateTime<Utc>,
    ) -> Result<HandoffEntry, HandoffError> {
        if is_empty_payload(&payload) {
            return Err(HandoffError::Empty);
        }
        // Cap on the compact JSON encoding, independent of how it was posted.
        let size = payload.to_string().len();
        if size > self.max_payload_bytes {
            return Err(HandoffError::TooLarge {
                size,
                limit: self.max_payload_bytes,
            });
        }

        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        let pruned = before - entries.len();
        if pruned > 0 {
            tracing::debug!(pruned, "Pruned expired handoff entries");
        }

        let id = loop {
            let candidate = random_id();
            if !entries.contains_key(&candidate) {
                break candidate;
            }
        };

        let entry = HandoffEntry {
            id: id.clone(),
            payload,
            created_at: now,
            expires_at: now + self.ttl,
        };
        entries.insert(id, entry.clone());
        Ok(entry)
    }

    async fn get_at(&self, id: &str, now: DateTime<Utc>) -> Option<HandoffEntry> {
        let entries = self.entries.read().await;
        entries
            .get(id)
            .filter(|entry| entry.expires_at > now)
            .cloned()
    }
}

fn is_empty_payload(payload: &Value) -> bool {
    match payload {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn random_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ID_LEN)
        .map(char::from)
        .collect()
}
