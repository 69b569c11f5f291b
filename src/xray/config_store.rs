//! xray runtime configuration document
//!
//! The document is plain JSON with an `inbounds` array. Credentials are
//! enabled by listing their short id in the reality settings of the first
//! VLESS inbound that declares a client list:
//!
//! ```json
//! { "inbounds": [ { "protocol": "vless",
//!                   "settings": { "clients": [] },
//!                   "streamSettings": { "realitySettings": { "shortIds": ["..."] } } } ] }
//! ```
//!
//! Writes are two sequential steps (backup, then overwrite) and are not
//! atomic: a crash in between can leave a stale backup or a truncated
//! document. Only one previous generation is ever kept.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigStoreError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("xray config is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("VLESS inbound not found in xray config")]
    InboundNotFound,

    #[error("malformed xray config: {0}")]
    Malformed(String),
}

/// Read/write access to the runtime configuration document
#[async_trait]
pub trait RuntimeConfigStore: Send + Sync {
    async fn load(&self) -> Result<Value, ConfigStoreError>;

    /// Back up the current document, then overwrite it with `document`
    async fn save(&self, document: &Value) -> Result<(), ConfigStoreError>;
}

/// Configuration document stored on the local filesystem
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `<path>.backup`, overwritten on every save
    pub fn backup_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".backup");
        PathBuf::from(name)
    }

    fn io_error(path: &Path, source: std::io::Error) -> ConfigStoreError {
        ConfigStoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[async_trait]
impl RuntimeConfigStore for FileConfigStore {
    async fn load(&self) -> Result<Value, ConfigStoreError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| Self::io_error(&self.path, e))?;
        Ok(serde_json::from_str(&content)?)
    }

    async fn save(&self, document: &Value) -> Result<(), ConfigStoreError> {
        let backup = self.backup_path();
        let previous = tokio::fs::read(&self.path)
            .await
            .map_err(|e| Self::io_error(&self.path, e))?;
        tokio::fs::write(&backup, previous)
            .await
            .map_err(|e| Self::io_error(&backup, e))?;

        let rendered = serde_json::to_string_pretty(document)?;
        tokio::fs::write(&self.path, rendered)
            .await
            .map_err(|e| Self::io_error(&self.path, e))?;

        tracing::debug!(path = %self.path.display(), backup = %backup.display(), "xray config written");
        Ok(())
    }
}

/// In-memory config store for testing
///
/// Yields to the scheduler inside `load` and `save` so unsynchronized
/// read-modify-write sequences interleave under test.
#[cfg(test)]
pub struct MemoryConfigStore {
    document: std::sync::Mutex<Value>,
    saves: std::sync::atomic::AtomicU32,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl MemoryConfigStore {
    pub fn new(document: Value) -> Self {
        Self {
            document: std::sync::Mutex::new(document),
            saves: std::sync::atomic::AtomicU32::new(0),
        }
    }

    pub fn document(&self) -> Value {
        self.document.lock().unwrap().clone()
    }

    pub fn saves(&self) -> u32 {
        self.saves.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
#[allow(clippy::unwrap_used)]
impl RuntimeConfigStore for MemoryConfigStore {
    async fn load(&self) -> Result<Value, ConfigStoreError> {
        tokio::task::yield_now().await;
        Ok(self.document())
    }

    async fn save(&self, document: &Value) -> Result<(), ConfigStoreError> {
        tokio::task::yield_now().await;
        *self.document.lock().unwrap() = document.clone();
        self.saves.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}

/// Locate the first VLESS inbound that declares a client list
pub fn find_reality_inbound(document: &mut Value) -> Option<&mut Value> {
    document
        .get_mut("inbounds")?
        .as_array_mut()?
        .iter_mut()
        .find(|inbound| {
            inbound.get("protocol").and_then(Value::as_str) == Some("vless")
                && inbound
                    .get("settings")
                    .and_then(|s| s.get("clients"))
                    .is_some_and(|c| !c.is_null())
        })
}

/// Append `short_id` to the inbound's short id list
///
/// Missing `streamSettings` / `realitySettings` objects are created, and a
/// `shortIds` value that is not an array is replaced by an empty one.
pub fn add_short_id(document: &mut Value, short_id: &str) -> Result<(), ConfigStoreError> {
    let inbound = find_reality_inbound(document)
        .and_then(Value::as_object_mut)
        .ok_or(ConfigStoreError::InboundNotFound)?;

    let stream = object_child(inbound, "streamSettings")?;
    let reality = object_child(stream, "realitySettings")?;

    let ids = reality
        .entry("shortIds")
        .or_insert_with(|| Value::Array(Vec::new()));
    if !ids.is_array() {
        *ids = Value::Array(Vec::new());
    }
    if let Value::Array(list) = ids {
        list.push(Value::String(short_id.to_string()));
    }
    Ok(())
}

/// Remove every occurrence of `short_id` from the inbound's list
///
/// Returns whether anything was removed. The client id of the credential is
/// not part of the document and is left alone.
pub fn remove_short_id(document: &mut Value, short_id: &str) -> Result<bool, ConfigStoreError> {
    let inbound = find_reality_inbound(document).ok_or(ConfigStoreError::InboundNotFound)?;

    let Some(list) = inbound
        .pointer_mut("/streamSettings/realitySettings/shortIds")
        .and_then(Value::as_array_mut)
    else {
        return Ok(false);
    };

    let before = list.len();
    list.retain(|v| v.as_str() != Some(short_id));
    Ok(list.len() != before)
}

/// Current short ids of the reality inbound (None if there is no such inbound)
pub fn short_ids(document: &Value) -> Option<Vec<String>> {
    let mut copy = document.clone();
    let inbound = find_reality_inbound(&mut copy)?;
    Some(
        inbound
            .pointer("/streamSettings/realitySettings/shortIds")
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default(),
    )
}

fn object_child<'a>(
    parent: &'a mut Map<String, Value>,
    key: &str,
) -> Result<&'a mut Map<String, Value>, ConfigStoreError> {
    parent
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or_else(|| ConfigStoreError::Malformed(format!("{} is not an object", key)))
}
