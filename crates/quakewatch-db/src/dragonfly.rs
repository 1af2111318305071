//! `Dragonfly` (Redis-compatible) snapshot storage.
//!
//! The cache is written once per refresh cycle as one JSON array, and the
//! two scheduler timestamps as epoch milliseconds. All keys share a
//! configurable prefix so several deployments can share one instance.
//!
//! # Key Patterns
//!
//! | Pattern | Type | Description |
//! |---------|------|-------------|
//! | `{prefix}:quakes` | JSON | Array of cached event records |
//! | `{prefix}:last-query-time` | Integer | Last successful bulk query (ms) |
//! | `{prefix}:last-full-refresh` | Integer | Last successful full query (ms) |

use fred::prelude::*;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::DbError;

/// Connection handle to a `Dragonfly` (Redis-compatible) instance.
///
/// Wraps a [`fred::prelude::Client`] and scopes every key under a prefix.
#[derive(Clone)]
pub struct DragonflyPool {
    client: Client,
    prefix: String,
}

impl core::fmt::Debug for DragonflyPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DragonflyPool")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl DragonflyPool {
    /// Connect to `Dragonfly` at the given URL.
    ///
    /// The URL should follow the Redis URL scheme:
    /// `redis://host:port` or `redis://host:port/db`
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Config`] if the URL cannot be parsed.
    /// Returns [`DbError::Dragonfly`] if the connection fails.
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, DbError> {
        let config = Config::from_url(url)
            .map_err(|e| DbError::Config(format!("Invalid Dragonfly URL: {e}")))?;

        let client = Builder::from_config(config).build()?;
        client.init().await?;

        tracing::info!(prefix, "Connected to Dragonfly");
        Ok(Self {
            client,
            prefix: prefix.to_owned(),
        })
    }

    fn key(&self, name: &str) -> String {
        format!("{}:{name}", self.prefix)
    }

    /// Serialize `value` as JSON and store it at `{prefix}:{name}`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Serialization`] if serialization fails.
    /// Returns [`DbError::Dragonfly`] if the write fails.
    pub async fn set_json<T: Serialize + Sync>(&self, name: &str, value: &T) -> Result<(), DbError> {
        let json = serde_json::to_string(value)?;
        let _: () = self
            .client
            .set(self.key(name), json.as_str(), None, None, false)
            .await?;
        Ok(())
    }

    /// Read `{prefix}:{name}` and deserialize it from JSON.
    ///
    /// Returns `Ok(None)` when the key does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Serialization`] if deserialization fails.
    /// Returns [`DbError::Dragonfly`] if the read fails.
    pub async fn get_json<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, DbError> {
        let value: Option<String> = self.client.get(self.key(name)).await?;
        value
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(DbError::from)
    }

    /// Store an integer at `{prefix}:{name}`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Dragonfly`] if the write fails.
    pub async fn set_i64(&self, name: &str, value: i64) -> Result<(), DbError> {
        let _: () = self
            .client
            .set(self.key(name), value.to_string().as_str(), None, None, false)
            .await?;
        Ok(())
    }

    /// Read an integer from `{prefix}:{name}`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidValue`] if the stored value is not an integer.
    /// Returns [`DbError::Dragonfly`] if the read fails.
    pub async fn get_i64(&self, name: &str) -> Result<Option<i64>, DbError> {
        let key = self.key(name);
        let value: Option<String> = self.client.get(key.as_str()).await?;
        value
            .map(|s| {
                s.parse::<i64>().map_err(|e| DbError::InvalidValue {
                    key: key.clone(),
                    reason: format!("not a valid i64: {e}"),
                })
            })
            .transpose()
    }

    /// Delete `{prefix}:{name}`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Dragonfly`] if the delete fails.
    pub async fn delete(&self, name: &str) -> Result<(), DbError> {
        let _: u32 = self.client.del(self.key(name)).await?;
        Ok(())
    }
}
