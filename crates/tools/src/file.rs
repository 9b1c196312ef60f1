//! Shared state for the file tools: workspace sandbox, snapshot store,
//! per-path write locks, and the stale-write check.

use codeloom_config::ToolsConfig;
use codeloom_core::error::ToolError;
use codeloom_core::store::{FileSnapshot, Store};
use codeloom_core::tool::ToolResponse;
use codeloom_security::Workspace;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Everything a tool needs besides its call arguments.
pub struct ToolEnv {
    pub workspace: Workspace,
    pub store: Arc<dyn Store>,
    pub locks: FileLocks,
    pub limits: ToolsConfig,
}

impl ToolEnv {
    pub fn new(workspace: Workspace, store: Arc<dyn Store>, limits: ToolsConfig) -> Self {
        Self {
            workspace,
            store,
            locks: FileLocks::default(),
            limits,
        }
    }

    /// Resolve a model-supplied path, or describe why it was refused.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, ToolResponse> {
        self.workspace
            .resolve(path)
            .map_err(|e| ToolResponse::error(e.to_string()))
    }

    /// Record `content` as the last observed state of `path`.
    pub async fn record(&self, path: &Path, content: &str) -> Result<(), ToolError> {
        self.store
            .upsert_file(FileSnapshot::new(path.display().to_string(), content))
            .await?;
        Ok(())
    }

    /// Refuse to overwrite a file the model has not seen in its current
    /// form. Returns the on-disk content when the write may proceed.
    pub async fn check_fresh(&self, path: &Path) -> Result<Result<String, ToolResponse>, ToolError> {
        let disk = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) => {
                return Ok(Err(ToolResponse::error(format!(
                    "failed to read {}: {e}",
                    path.display()
                ))));
            }
        };
        let shown = self.workspace.relative(path);
        match self.store.get_file(&path.display().to_string()).await? {
            None => Ok(Err(ToolResponse::error(format!(
                "you must view {shown} before modifying it"
            )))),
            Some(snapshot) if snapshot.content != disk => Ok(Err(ToolResponse::error(format!(
                "{shown} has been modified since it was last viewed; view it again before modifying it"
            )))),
            Some(_) => Ok(Ok(disk)),
        }
    }
}

/// One async mutex per canonical path, so concurrent calls that mutate the
/// same file run one at a time.
#[derive(Default)]
pub struct FileLocks {
    inner: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl FileLocks {
    pub async fn lock(&self, path: &Path) -> tokio::sync::OwnedMutexGuard<()> {
        let slot = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(map.entry(path.to_path_buf()).or_default())
        };
        slot.lock_owned().await
    }
}

/// Write `content`, creating parent directories as needed.
pub(crate) async fn write_file(path: &Path, content: &str) -> Result<(), ToolError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ToolError::failed("write", format!("cannot create {}: {e}", parent.display())))?;
    }
    tokio::fs::write(path, content)
        .await
        .map_err(|e| ToolError::failed("write", format!("cannot write {}: {e}", path.display())))
}

/// Count of lines added and removed between two texts, by multiset
/// difference of lines.
pub(crate) fn line_changes(before: &str, after: &str) -> (usize, usize) {
    let mut counts: HashMap<&str, isize> = HashMap::new();
    for line in before.lines() {
        *counts.entry(line).or_default() -= 1;
    }
    for line in after.lines() {
        *counts.entry(line).or_default() += 1;
    }
    let additions = counts.values().filter(|c| **c > 0).map(|c| *c as usize).sum();
    let removals = counts.values().filter(|c| **c < 0).map(|c| c.unsigned_abs()).sum();
    (additions, removals)
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn line_changes_counts_both_sides() {
        assert_eq!(line_changes("a\nb\nc", "a\nB\nc\nd"), (2, 1));
        assert_eq!(line_changes("same", "same"), (0, 0));
    }

    #[tokio::test]
    async fn unseen_file_is_not_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let env = testing::env(&dir);
        let path = env.workspace.root().join("a.txt");
        std::fs::write(&path, "hello").unwrap();

        let verdict = env.check_fresh(&path).await.unwrap();
        assert!(verdict.unwrap_err().content.contains("must view"));

        env.record(&path, "hello").await.unwrap();
        assert_eq!(env.check_fresh(&path).await.unwrap().unwrap(), "hello");

        std::fs::write(&path, "changed").unwrap();
        let verdict = env.check_fresh(&path).await.unwrap();
        assert!(verdict.unwrap_err().content.contains("modified since"));
    }

    #[tokio::test]
    async fn same_path_locks_serialize() {
        let locks = Arc::new(FileLocks::default());
        let path = PathBuf::from("/w/a.rs");
        let guard = locks.lock(&path).await;

        let contender = {
            let locks = Arc::clone(&locks);
            let path = path.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(&path).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        // A different path is independent.
        let _other = locks.lock(Path::new("/w/b.rs")).await;

        drop(guard);
        contender.await.unwrap();
    }
}
