//! API key authentication.
//!
//! Each client holds one or more keys; only their SHA-256 digests are
//! configured. Entries are `client_id:sha256hex`, either inline in
//! `API_KEYS` (comma or newline separated) or one per line in
//! `API_KEYS_FILE`. The file is re-read periodically, so keys can be
//! rotated by adding the new digest, moving clients over, then removing
//! the old one.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use metrics::counter;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::ApiConfig;
use crate::error::ApiError;
use crate::state::AppState;

pub const API_KEY_HEADER: &str = "X-API-KEY";

#[derive(Debug, Error)]
pub enum KeyConfigError {
    #[error("Malformed API key entry {entry}: {reason}")]
    Malformed { entry: usize, reason: &'static str },

    #[error("No API keys configured (set API_KEYS or API_KEYS_FILE)")]
    Empty,

    #[error("Failed to read API key file: {0}")]
    Io(#[from] std::io::Error),
}

/// Authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiClient {
    pub client_id: String,
}

/// Hex-encoded SHA-256 of a presented key.
pub fn digest_key(key: &str) -> String {
    format!("{:x}", Sha256::digest(key.as_bytes()))
}

fn parse_entries(text: &str) -> Result<HashMap<String, String>, KeyConfigError> {
    let mut keys = HashMap::new();
    let entries = text
        .split(|c: char| c == ',' || c == '\n')
        .map(str::trim)
        .filter(|e| !e.is_empty() && !e.starts_with('#'));

    for (index, entry) in entries.enumerate() {
        let entry_no = index + 1;
        let (client, digest) = entry.split_once(':').ok_or(KeyConfigError::Malformed {
            entry: entry_no,
            reason: "expected client_id:sha256hex",
        })?;
        let client = client.trim();
        let digest = digest.trim().to_ascii_lowercase();

        if client.is_empty() {
            return Err(KeyConfigError::Malformed {
                entry: entry_no,
                reason: "empty client id",
            });
        }
        if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(KeyConfigError::Malformed {
                entry: entry_no,
                reason: "digest must be 64 hex characters",
            });
        }
        keys.insert(digest, client.to_string());
    }
    Ok(keys)
}

/// Digest → client lookup with periodic reload from the key file.
pub struct ApiKeyRegistry {
    inline: Option<String>,
    file: Option<PathBuf>,
    refresh_every: Duration,
    keys: RwLock<HashMap<String, String>>,
    last_refresh: RwLock<Instant>,
}

impl ApiKeyRegistry {
    /// Load keys from configuration. Fails if none are configured.
    pub async fn from_config(config: &ApiConfig) -> Result<Self, KeyConfigError> {
        let registry = Self {
            inline: config.api_keys.clone(),
            file: config.api_keys_file.clone(),
            refresh_every: config.api_keys_refresh,
            keys: RwLock::new(HashMap::new()),
            last_refresh: RwLock::new(Instant::now()),
        };
        let count = registry.reload().await?;
        if count == 0 {
            return Err(KeyConfigError::Empty);
        }
        info!(keys = count, "API keys loaded");
        Ok(registry)
    }

    /// Fixed key set, never reloaded.
    pub fn from_entries(entries: &str) -> Result<Self, KeyConfigError> {
        let keys = parse_entries(entries)?;
        if keys.is_empty() {
            return Err(KeyConfigError::Empty);
        }
        Ok(Self {
            inline: Some(entries.to_string()),
            file: None,
            refresh_every: Duration::MAX,
            keys: RwLock::new(keys),
            last_refresh: RwLock::new(Instant::now()),
        })
    }

    async fn reload(&self) -> Result<usize, KeyConfigError> {
        let mut keys = match &self.inline {
            Some(inline) => parse_entries(inline)?,
            None => HashMap::new(),
        };
        if let Some(path) = &self.file {
            let text = tokio::fs::read_to_string(path).await?;
            keys.extend(parse_entries(&text)?);
        }

        let count = keys.len();
        *self.keys.write().await = keys;
        *self.last_refresh.write().await = Instant::now();
        Ok(count)
    }

    async fn refresh_if_due(&self) {
        if self.file.is_none() {
            return;
        }
        let due = self.last_refresh.read().await.elapsed() >= self.refresh_every;
        if !due {
            return;
        }
        // Keep serving the previous key set if the file is mid-edit or unreadable.
        match self.reload().await {
            Ok(count) if count > 0 => debug!(keys = count, "Reloaded API keys"),
            Ok(_) => warn!("API key file has no entries; keeping previous keys"),
            Err(e) => warn!("Failed to reload API keys: {}", e),
        }
    }

    /// Resolve a presented key to its client.
    pub async fn authenticate(&self, presented: &str) -> Option<ApiClient> {
        self.refresh_if_due().await;
        let digest = digest_key(presented.trim());
        self.keys
            .read()
            .await
            .get(&digest)
            .map(|client_id| ApiClient {
                client_id: client_id.clone(),
            })
    }
}

#[axum::async_trait]
impl FromRequestParts<AppState> for ApiClient {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let presented = parts
            .headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                counter!("vparser_auth_failures_total", "reason" => "missing").increment(1);
                ApiError::unauthorized("missing API key")
            })?;

        match state.api_keys.authenticate(presented).await {
            Some(client) => Ok(client),
            None => {
                counter!("vparser_auth_failures_total", "reason" => "unknown").increment(1);
                warn!(path = %parts.uri.path(), "Rejected unknown API key");
                Err(ApiError::unauthorized("unknown API key"))
            }
        }
    }
}
