//! Ls tool: tree listing of a workspace directory.

use async_trait::async_trait;
use codeloom_core::error::ToolError;
use codeloom_core::tool::{Tool, ToolCall, ToolContext, ToolResponse};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

use crate::file::ToolEnv;

pub const MAX_ENTRIES: usize = 1000;

/// Directory names never descended into.
pub const SKIPPED_DIRS: &[&str] = &[
    "node_modules",
    "target",
    "dist",
    "build",
    "out",
    "vendor",
    "__pycache__",
    "venv",
    "obj",
];

pub struct LsTool {
    env: Arc<ToolEnv>,
}

impl LsTool {
    pub fn new(env: Arc<ToolEnv>) -> Self {
        Self { env }
    }
}

#[derive(Deserialize)]
struct LsParams {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    ignore: Vec<String>,
}

struct Listing {
    lines: Vec<String>,
    truncated: bool,
}

fn list_tree(root: &Path, ignore: &[glob::Pattern]) -> Listing {
    let mut lines = vec![format!("- {}/", root.display())];
    let mut count = 0usize;
    let mut truncated = false;

    let walker = WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            if name.starts_with('.') {
                return false;
            }
            if entry.file_type().is_dir() && SKIPPED_DIRS.contains(&name.as_ref()) {
                return false;
            }
            !ignore.iter().any(|p| p.matches(&name))
        });

    for entry in walker.flatten() {
        if count >= MAX_ENTRIES {
            truncated = true;
            break;
        }
        count += 1;
        let indent = "  ".repeat(entry.depth());
        let name = entry.file_name().to_string_lossy();
        let slash = if entry.file_type().is_dir() { "/" } else { "" };
        lines.push(format!("{indent}- {name}{slash}"));
    }
    Listing { lines, truncated }
}

#[async_trait]
impl Tool for LsTool {
    fn name(&self) -> &str {
        "ls"
    }

    fn description(&self) -> &str {
        "List files and directories as a tree. Hidden entries and common build directories are skipped. Use ignore for extra glob patterns to leave out."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory to list (defaults to the workspace root)"
                },
                "ignore": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Glob patterns of names to skip"
                }
            }
        })
    }

    fn side_effect_free(&self) -> bool {
        true
    }

    async fn run(&self, _ctx: &ToolContext, call: &ToolCall) -> Result<ToolResponse, ToolError> {
        let params: LsParams = call.parse_input()?;
        let dir: PathBuf = match params.path.as_deref() {
            None | Some("") => self.env.workspace.root().to_path_buf(),
            Some(p) => match self.env.resolve(p) {
                Ok(p) => p,
                Err(refusal) => return Ok(refusal),
            },
        };
        if !dir.is_dir() {
            return Ok(ToolResponse::error(format!("not a directory: {}", dir.display())));
        }

        let mut ignore = Vec::with_capacity(params.ignore.len());
        for raw in &params.ignore {
            match glob::Pattern::new(raw) {
                Ok(p) => ignore.push(p),
                Err(e) => return Ok(ToolResponse::error(format!("invalid ignore pattern '{raw}': {e}"))),
            }
        }

        let listing = tokio::task::spawn_blocking(move || list_tree(&dir, &ignore))
            .await
            .map_err(|e| ToolError::failed("ls", e.to_string()))?;

        let entries = listing.lines.len() - 1;
        let mut output = listing.lines.join("\n");
        if listing.truncated {
            output = format!(
                "There are more than {MAX_ENTRIES} entries in this directory. Use a more specific path or the glob tool. The first {MAX_ENTRIES} are shown:\n\n{output}"
            );
        }
        Ok(ToolResponse::text(output).with_metadata(serde_json::json!({
            "entries": entries,
            "truncated": listing.truncated,
        })))
    }
}
