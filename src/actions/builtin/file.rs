//! `file_operation`: filesystem operations confined to a root directory.
//!
//! Parameters:
//! - `operation`: one of `read`, `write`, `append`, `delete`, `copy`, `move`,
//!   `list`, `exists`, `mkdir`
//! - `path` (string, required): relative to the file root
//! - `content` (string): for `write` / `append`
//! - `destination` (string): for `copy` / `move`

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::actions::handler::{
    ActionContext, ActionHandler, ActionOutput, optional_str, require_str,
};
use crate::error::ActionError;

pub const ACTION: &str = "file_operation";

/// Maximum file size returned by `read` (1MB).
const MAX_READ_SIZE: u64 = 1024 * 1024;

/// Normalize a path lexically (resolve `.` and `..` without touching the filesystem).
fn normalize_lexical(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                if components
                    .last()
                    .is_some_and(|c| matches!(c, std::path::Component::Normal(_)))
                {
                    components.pop();
                }
            }
            std::path::Component::CurDir => {}
            other => components.push(other),
        }
    }
    components.iter().collect()
}

/// Canonicalize the longest existing prefix of `path` and re-append the rest,
/// so symlinks in existing parents are resolved.
fn canonical_prefix(path: &Path) -> PathBuf {
    let mut ancestor = path;
    let mut tail = Vec::new();
    loop {
        if let Ok(canonical) = ancestor.canonicalize() {
            return tail
                .into_iter()
                .rev()
                .fold(canonical, |acc: PathBuf, part| acc.join(part));
        }
        match (ancestor.file_name(), ancestor.parent()) {
            (Some(name), Some(parent)) => {
                tail.push(name);
                ancestor = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
}

/// Filesystem handler sandboxed to `root`.
#[derive(Debug, Clone)]
pub struct FileOperationHandler {
    root: PathBuf,
}

impl FileOperationHandler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `path_str` under the root, refusing anything that escapes it.
    fn resolve(&self, path_str: &str) -> Result<PathBuf, ActionError> {
        let relative = Path::new(path_str);
        let joined = if relative.is_absolute() {
            relative.to_path_buf()
        } else {
            self.root.join(relative)
        };
        let resolved = normalize_lexical(&joined);

        let root = canonical_prefix(&normalize_lexical(&self.root));
        if !canonical_prefix(&resolved).starts_with(&root) {
            return Err(ActionError::SecurityViolation {
                pattern: format!("path escapes file root: {path_str}"),
            });
        }
        Ok(resolved)
    }
}

fn io_error(op: &str, path: &Path, e: std::io::Error) -> ActionError {
    let reason = format!("{op} {}: {e}", path.display());
    match e.kind() {
        std::io::ErrorKind::NotFound
        | std::io::ErrorKind::PermissionDenied
        | std::io::ErrorKind::AlreadyExists
        | std::io::ErrorKind::InvalidInput => ActionError::permanent(ACTION, reason),
        _ => ActionError::transient(ACTION, reason),
    }
}

#[async_trait]
impl ActionHandler for FileOperationHandler {
    fn action(&self) -> &str {
        ACTION
    }

    async fn execute(
        &self,
        params: &Map<String, Value>,
        ctx: ActionContext,
    ) -> Result<ActionOutput, ActionError> {
        let op = require_str(ACTION, params, "operation")?;
        let path = self.resolve(require_str(ACTION, params, "path")?)?;

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| io_error("create root", &self.root, e))?;

        let result = match op {
            "read" => {
                let meta = tokio::fs::metadata(&path)
                    .await
                    .map_err(|e| io_error("read", &path, e))?;
                if meta.len() > MAX_READ_SIZE {
                    return Err(ActionError::permanent(
                        ACTION,
                        format!("{} is larger than {MAX_READ_SIZE} bytes", path.display()),
                    ));
                }
                let content = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| io_error("read", &path, e))?;
                json!({ "path": path, "content": content, "size": meta.len() })
            }
            "write" | "append" => {
                let content = optional_str(ACTION, params, "content")?.unwrap_or("");
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| io_error("mkdir", parent, e))?;
                }
                if op == "write" {
                    tokio::fs::write(&path, content)
                        .await
                        .map_err(|e| io_error("write", &path, e))?;
                } else {
                    use tokio::io::AsyncWriteExt;
                    let mut file = tokio::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&path)
                        .await
                        .map_err(|e| io_error("append", &path, e))?;
                    file.write_all(content.as_bytes())
                        .await
                        .map_err(|e| io_error("append", &path, e))?;
                    file.flush().await.map_err(|e| io_error("append", &path, e))?;
                }
                json!({ "path": path, "bytes_written": content.len() })
            }
            "delete" => {
                let meta = tokio::fs::metadata(&path)
                    .await
                    .map_err(|e| io_error("delete", &path, e))?;
                let removed = if meta.is_dir() {
                    tokio::fs::remove_dir_all(&path).await
                } else {
                    tokio::fs::remove_file(&path).await
                };
                removed.map_err(|e| io_error("delete", &path, e))?;
                json!({ "path": path, "deleted": true })
            }
            "copy" | "move" => {
                let dest = self.resolve(require_str(ACTION, params, "destination")?)?;
                if let Some(parent) = dest.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| io_error("mkdir", parent, e))?;
                }
                if op == "copy" {
                    tokio::fs::copy(&path, &dest)
                        .await
                        .map_err(|e| io_error("copy", &path, e))?;
                } else {
                    tokio::fs::rename(&path, &dest)
                        .await
                        .map_err(|e| io_error("move", &path, e))?;
                }
                json!({ "path": path, "destination": dest })
            }
            "list" => {
                let mut entries = tokio::fs::read_dir(&path)
                    .await
                    .map_err(|e| io_error("list", &path, e))?;
                let mut names = Vec::new();
                while let Some(entry) = entries
                    .next_entry()
                    .await
                    .map_err(|e| io_error("list", &path, e))?
                {
                    let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
                    names.push(json!({
                        "name": entry.file_name().to_string_lossy(),
                        "is_dir": is_dir,
                    }));
                }
                names.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
                json!({ "path": path, "entries": names })
            }
            "exists" => {
                let exists = tokio::fs::try_exists(&path)
                    .await
                    .map_err(|e| io_error("exists", &path, e))?;
                json!({ "path": path, "exists": exists })
            }
            "mkdir" => {
                tokio::fs::create_dir_all(&path)
                    .await
                    .map_err(|e| io_error("mkdir", &path, e))?;
                json!({ "path": path, "created": true })
            }
            other => {
                return Err(ActionError::InvalidParameters {
                    action: ACTION.to_string(),
                    reason: format!("unknown operation `{other}`"),
                });
            }
        };

        ctx.progress.report(100);
        Ok(ActionOutput::new(result))
    }
}
