//! Builtin providers: key/value reads and writes against the persistent store.
//!
//! The store is a SQLite database named by `providers.store.connection`.
//! Without it both providers fail with `MISSING_TOOL: store.connection`.
use std::path::PathBuf;

use async_trait::async_trait;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::action::ActionKind;
use crate::config::{present, StoreConfig};
use crate::providers::{required_str, Provider, ProviderError};

pub(crate) const STORE_CONNECTION: &str = "store.connection";

const DEFAULT_NAMESPACE: &str = "default";

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS kv (
    namespace TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (namespace, key)
)";

/// Parses `sqlite://path`, `sqlite:path` or a bare path.
fn database_path(connection: &str) -> PathBuf {
    let path = connection
        .strip_prefix("sqlite://")
        .or_else(|| connection.strip_prefix("sqlite:"))
        .unwrap_or(connection);
    PathBuf::from(path)
}

fn connection_path(config: &StoreConfig) -> Result<PathBuf, ProviderError> {
    present(&config.connection)
        .map(database_path)
        .ok_or_else(|| ProviderError::missing(&[STORE_CONNECTION]))
}

fn missing(config: &StoreConfig) -> Vec<String> {
    if present(&config.connection).is_some() {
        vec![]
    } else {
        vec![STORE_CONNECTION.to_string()]
    }
}

fn store_failure(e: rusqlite::Error) -> ProviderError {
    ProviderError::failed(format!("store error: {e}"))
}

/// Runs blocking SQLite work off the async runtime.
async fn blocking<T, F>(work: F) -> Result<T, ProviderError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ProviderError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ProviderError::Internal(anyhow::anyhow!("store task failed: {e}")))?
}

pub struct ReadDbProvider {
    config: StoreConfig,
}

impl ReadDbProvider {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

#[async_trait]
impl Provider for ReadDbProvider {
    fn kind(&self) -> ActionKind {
        ActionKind::ReadDb
    }

    fn description(&self) -> &str {
        "Read a value by key from the persistent store."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "key": { "type": "string" },
                "namespace": { "type": "string", "description": "Defaults to 'default'" }
            },
            "required": ["key"]
        })
    }

    fn missing_requirements(&self) -> Vec<String> {
        missing(&self.config)
    }

    async fn invoke(&self, params: &Value) -> Result<Value, ProviderError> {
        let path = connection_path(&self.config)?;
        let key = required_str(params, "key")?.to_string();
        let namespace = params["namespace"].as_str().unwrap_or(DEFAULT_NAMESPACE).to_string();

        blocking(move || {
            let conn = Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_ONLY)
                .map_err(|e| {
                    ProviderError::failed(format!("cannot open store {}: {e}", path.display()))
                })?;

            let has_table: bool = conn
                .query_row(
                    "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'kv'",
                    [],
                    |_| Ok(true),
                )
                .optional()
                .map_err(store_failure)?
                .unwrap_or(false);

            let row: Option<(String, String)> = if has_table {
                conn.query_row(
                    "SELECT value, updated_at FROM kv WHERE namespace = ?1 AND key = ?2",
                    params![namespace, key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(store_failure)?
            } else {
                None
            };

            debug!("Store read {namespace}/{key}: found={}", row.is_some());
            Ok(match row {
                Some((raw, updated_at)) => {
                    let value: Value = serde_json::from_str(&raw)
                        .map_err(|e| ProviderError::failed(format!("corrupt value for {key}: {e}")))?;
                    json!({
                        "namespace": namespace,
                        "key": key,
                        "found": true,
                        "value": value,
                        "updated_at": updated_at,
                    })
                }
                None => json!({ "namespace": namespace, "key": key, "found": false }),
            })
        })
        .await
    }
}

pub struct WriteDbProvider {
    config: StoreConfig,
}

impl WriteDbProvider {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

#[async_trait]
impl Provider for WriteDbProvider {
    fn kind(&self) -> ActionKind {
        ActionKind::WriteDb
    }

    fn description(&self) -> &str {
        "Insert or replace a JSON value by key in the persistent store."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "key": { "type": "string" },
                "value": { "description": "Any JSON value" },
                "namespace": { "type": "string", "description": "Defaults to 'default'" }
            },
            "required": ["key", "value"]
        })
    }

    fn missing_requirements(&self) -> Vec<String> {
        missing(&self.config)
    }

    async fn invoke(&self, params: &Value) -> Result<Value, ProviderError> {
        let path = connection_path(&self.config)?;
        let key = required_str(params, "key")?.to_string();
        if params.get("value").is_none() {
            return Err(ProviderError::InvalidParams(
                "missing required parameter: value".into(),
            ));
        }
        let raw = params["value"].to_string();
        let namespace = params["namespace"].as_str().unwrap_or(DEFAULT_NAMESPACE).to_string();

        blocking(move || {
            let conn = Connection::open(&path).map_err(|e| {
                ProviderError::failed(format!("cannot open store {}: {e}", path.display()))
            })?;
            conn.execute(SCHEMA, []).map_err(store_failure)?;

            let updated_at = chrono::Utc::now().to_rfc3339();
            let changed = conn
                .execute(
                    "INSERT INTO kv (namespace, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(namespace, key) DO UPDATE SET value = excluded.value,
                     updated_at = excluded.updated_at",
                    params![namespace, key, raw, updated_at],
                )
                .map_err(store_failure)?;

            info!("Store write {namespace}/{key} ({} bytes)", raw.len());
            Ok(json!({
                "namespace": namespace,
                "key": key,
                "rows_affected": changed,
                "updated_at": updated_at,
            }))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured(dir: &std::path::Path) -> StoreConfig {
        StoreConfig {
            connection: Some(format!("sqlite://{}", dir.join("store.db").display())),
        }
    }

    #[test]
    fn test_database_path_forms() {
        assert_eq!(database_path("sqlite:///tmp/a.db"), PathBuf::from("/tmp/a.db"));
        assert_eq!(database_path("sqlite:data/a.db"), PathBuf::from("data/a.db"));
        assert_eq!(database_path("/var/a.db"), PathBuf::from("/var/a.db"));
    }

    #[tokio::test]
    async fn test_write_without_connection_is_missing_tool() {
        let provider = WriteDbProvider::new(&StoreConfig::default());
        match provider
            .invoke(&json!({"key": "k", "value": 1}))
            .await
            .unwrap_err()
        {
            ProviderError::MissingTool { missing } => assert_eq!(missing, vec![STORE_CONNECTION]),
            other => panic!("expected MissingTool, got {other:?}"),
        }
        assert_eq!(provider.missing_requirements(), vec![STORE_CONNECTION]);
    }

    #[tokio::test]
    async fn test_blank_connection_is_missing_tool() {
        let provider = ReadDbProvider::new(&StoreConfig {
            connection: Some("   ".into()),
        });
        let err = provider.invoke(&json!({"key": "k"})).await.unwrap_err();
        assert_eq!(err.to_string(), "MISSING_TOOL: store.connection");
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let config = configured(dir.path());

        let out = WriteDbProvider::new(&config)
            .invoke(&json!({"key": "plan", "value": {"steps": 3}}))
            .await
            .unwrap();
        assert_eq!(out["rows_affected"], 1);

        let out = ReadDbProvider::new(&config)
            .invoke(&json!({"key": "plan"}))
            .await
            .unwrap();
        assert_eq!(out["found"], true);
        assert_eq!(out["value"]["steps"], 3);
        assert_eq!(out["namespace"], "default");
    }

    #[tokio::test]
    async fn test_write_replaces_existing_value() {
        let dir = tempfile::tempdir().unwrap();
        let config = configured(dir.path());
        let writer = WriteDbProvider::new(&config);
        writer.invoke(&json!({"key": "k", "value": "v1"})).await.unwrap();
        writer.invoke(&json!({"key": "k", "value": "v2"})).await.unwrap();

        let out = ReadDbProvider::new(&config)
            .invoke(&json!({"key": "k"}))
            .await
            .unwrap();
        assert_eq!(out["value"], "v2");
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let config = configured(dir.path());
        WriteDbProvider::new(&config)
            .invoke(&json!({"key": "k", "value": 1, "namespace": "a"}))
            .await
            .unwrap();
        let out = ReadDbProvider::new(&config)
            .invoke(&json!({"key": "k", "namespace": "b"}))
            .await
            .unwrap();
        assert_eq!(out["found"], false);
    }

    #[tokio::test]
    async fn test_read_unknown_key_reports_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let config = configured(dir.path());
        // Create the database without the table.
        Connection::open(dir.path().join("store.db")).unwrap();

        let out = ReadDbProvider::new(&config)
            .invoke(&json!({"key": "absent"}))
            .await
            .unwrap();
        assert_eq!(out["found"], false);
        assert!(out.get("value").is_none());
    }

    #[tokio::test]
    async fn test_read_nonexistent_database_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = configured(dir.path());
        let err = ReadDbProvider::new(&config)
            .invoke(&json!({"key": "k"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Failed { .. }));
        assert!(!dir.path().join("store.db").exists());
    }

    #[tokio::test]
    async fn test_write_requires_value() {
        let dir = tempfile::tempdir().unwrap();
        let err = WriteDbProvider::new(&configured(dir.path()))
            .invoke(&json!({"key": "k"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidParams(_)));
    }
}
