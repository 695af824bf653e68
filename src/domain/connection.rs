//! External database connection descriptors.
//!
//! Credentials are stored and decrypted by the enclosing service; this
//! crate receives them already resolved through `ConnectionProvider`.

use crate::domain::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Resolved connection details for a target PostgreSQL database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: i64,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub ssl_mode: String,
    /// Last-modified marker. Used as the engine-cache version key so
    /// credential rotation invalidates pooled engines.
    pub version_key: Option<String>,
}

/// Source of resolved connections, implemented by the enclosing service.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    /// Returns the connection, or `None` when the id is unknown.
    async fn get_connection(&self, connection_id: i64) -> Result<Option<ConnectionInfo>>;
}
