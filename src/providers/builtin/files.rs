//! Builtin providers: read and write files under the sandbox root.
//!
//! Every requested path is resolved against the canonical sandbox root
//! before the filesystem is touched. Absolute paths, `..` segments and
//! symlinks that land outside the root are refused with
//! `DENY: path escapes sandbox`.
//!
//! All file I/O uses `tokio::fs` so large reads don't block the runtime.
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::action::ActionKind;
use crate::providers::{required_str, Provider, ProviderError};

/// Maximum file size read or written in one action: 5 MB
const MAX_FILE_SIZE: u64 = 5 * 1024 * 1024;

pub(crate) const PATH_ESCAPE: &str = "path escapes sandbox";

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// Resolves `requested` inside `root`, following symlinks.
///
/// Returns the absolute path to operate on. The returned path always
/// starts with the canonical root; anything else is a `Denied` error.
pub(crate) fn resolve_in_root(root: &Path, requested: &str) -> Result<PathBuf, ProviderError> {
    let root = std::fs::canonicalize(root)
        .map_err(|_| ProviderError::missing(&["providers.root"]))?;

    let requested = Path::new(requested);
    let joined = if requested.is_absolute() {
        requested.to_path_buf()
    } else {
        root.join(requested)
    };

    let normalized = normalize_lexically(&joined);
    if !normalized.starts_with(&root) {
        return Err(ProviderError::Denied(PATH_ESCAPE.into()));
    }

    // Canonicalize the deepest existing ancestor so symlinks anywhere
    // along the path are followed before the containment check.
    let mut resolved = None;
    for ancestor in normalized.ancestors() {
        let Ok(meta) = std::fs::symlink_metadata(ancestor) else {
            continue;
        };
        let canonical = match std::fs::canonicalize(ancestor) {
            Ok(c) => c,
            // Dangling symlink: writing through it would create its target.
            Err(_) if meta.file_type().is_symlink() => {
                return Err(ProviderError::Denied(PATH_ESCAPE.into()));
            }
            Err(e) => return Err(ProviderError::Internal(e.into())),
        };
        let rest = normalized
            .strip_prefix(ancestor)
            .map_err(|e| ProviderError::Internal(e.into()))?;
        resolved = Some(canonical.join(rest));
        break;
    }

    match resolved {
        Some(path) if path.starts_with(&root) => Ok(path),
        _ => {
            warn!("Path escapes sandbox: {}", joined.display());
            Err(ProviderError::Denied(PATH_ESCAPE.into()))
        }
    }
}

/// Collapses `.` and `..` without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

/// Path relative to the root, for results and logs.
fn display_relative(root: &Path, path: &Path) -> String {
    let root = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
    path.strip_prefix(&root)
        .unwrap_or(path)
        .display()
        .to_string()
}

fn io_failure(action: &str, path: &str, e: std::io::Error) -> ProviderError {
    match e.kind() {
        std::io::ErrorKind::NotFound => ProviderError::failed(format!("{action} failed: {path} not found")),
        std::io::ErrorKind::PermissionDenied => {
            ProviderError::failed(format!("{action} failed: permission denied for {path}"))
        }
        _ => ProviderError::Internal(anyhow::anyhow!("{action} {path}: {e}")),
    }
}

/// Builtin provider that reads a file under the sandbox root.
pub struct FileReadProvider {
    root: PathBuf,
}

impl FileReadProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Provider for FileReadProvider {
    fn kind(&self) -> ActionKind {
        ActionKind::FileRead
    }

    fn description(&self) -> &str {
        "Read a file inside the sandbox root. UTF-8 content is returned as text, \
         anything else base64-encoded."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path relative to the sandbox root"
                }
            },
            "required": ["path"]
        })
    }

    fn missing_requirements(&self) -> Vec<String> {
        if self.root.is_dir() {
            vec![]
        } else {
            vec!["providers.root".to_string()]
        }
    }

    async fn invoke(&self, params: &Value) -> Result<Value, ProviderError> {
        let requested = required_str(params, "path")?;
        let path = resolve_in_root(&self.root, requested)?;

        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| io_failure("read", requested, e))?;
        if !meta.is_file() {
            return Err(ProviderError::failed(format!("read failed: {requested} is not a file")));
        }
        if meta.len() > MAX_FILE_SIZE {
            return Err(ProviderError::failed(format!(
                "read failed: file too large ({} bytes, limit is {} bytes)",
                meta.len(),
                MAX_FILE_SIZE
            )));
        }

        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| io_failure("read", requested, e))?;
        debug!("Read {} bytes from {}", data.len(), path.display());

        let bytes = data.len();
        let (encoding, content) = match String::from_utf8(data) {
            Ok(text) => ("utf8", text),
            Err(e) => ("base64", B64.encode(e.as_bytes())),
        };

        Ok(json!({
            "path": display_relative(&self.root, &path),
            "bytes": bytes,
            "encoding": encoding,
            "content": content,
        }))
    }
}

/// Builtin provider that writes a file under the sandbox root.
pub struct FileWriteProvider {
    root: PathBuf,
}

impl FileWriteProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Provider for FileWriteProvider {
    fn kind(&self) -> ActionKind {
        ActionKind::FileWrite
    }

    fn description(&self) -> &str {
        "Write (or append to) a file inside the sandbox root, creating parent \
         directories as needed."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path relative to the sandbox root" },
                "data": { "type": "string", "description": "Content to write" },
                "encoding": { "type": "string", "enum": ["utf8", "base64"] },
                "append": { "type": "boolean" }
            },
            "required": ["path", "data"]
        })
    }

    fn missing_requirements(&self) -> Vec<String> {
        if self.root.is_dir() {
            vec![]
        } else {
            vec!["providers.root".to_string()]
        }
    }

    async fn invoke(&self, params: &Value) -> Result<Value, ProviderError> {
        let requested = required_str(params, "path")?;
        let data = required_str(params, "data")?;
        let append = params["append"].as_bool().unwrap_or(false);

        let bytes = match params["encoding"].as_str().unwrap_or("utf8") {
            "utf8" => data.as_bytes().to_vec(),
            "base64" => B64
                .decode(data)
                .map_err(|e| ProviderError::InvalidParams(format!("data is not valid base64: {e}")))?,
            other => {
                return Err(ProviderError::InvalidParams(format!(
                    "unsupported encoding '{other}' (utf8 or base64)"
                )))
            }
        };
        if bytes.len() as u64 > MAX_FILE_SIZE {
            return Err(ProviderError::InvalidParams(format!(
                "data too large ({} bytes, limit is {} bytes)",
                bytes.len(),
                MAX_FILE_SIZE
            )));
        }

        let path = resolve_in_root(&self.root, requested)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_failure("write", requested, e))?;
        }

        if append {
            use tokio::io::AsyncWriteExt;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .map_err(|e| io_failure("write", requested, e))?;
            file.write_all(&bytes)
                .await
                .map_err(|e| io_failure("write", requested, e))?;
            file.flush()
                .await
                .map_err(|e| io_failure("write", requested, e))?;
        } else {
            tokio::fs::write(&path, &bytes)
                .await
                .map_err(|e| io_failure("write", requested, e))?;
        }

        let relative = display_relative(&self.root, &path);
        info!("Wrote {} bytes to {relative}", bytes.len());

        Ok(json!({
            "path": relative,
            "bytes_written": bytes.len(),
            "append": append,
        }))
    }
}
