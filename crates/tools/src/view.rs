//! View tool: read a workspace file with line numbers.

use async_trait::async_trait;
use codeloom_core::error::ToolError;
use codeloom_core::tool::{Tool, ToolCall, ToolContext, ToolResponse};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::file::ToolEnv;

/// Files above this size are refused.
pub const MAX_READ_BYTES: u64 = 250 * 1024;
pub const DEFAULT_LINE_LIMIT: usize = 2000;
pub const MAX_LINE_CHARS: usize = 2000;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp", "svg", "webp", "ico"];

pub struct ViewTool {
    env: Arc<ToolEnv>,
}

impl ViewTool {
    pub fn new(env: Arc<ToolEnv>) -> Self {
        Self { env }
    }
}

#[derive(Deserialize)]
struct ViewParams {
    file_path: String,
    #[serde(default)]
    offset: usize,
    #[serde(default)]
    limit: Option<usize>,
}

#[async_trait]
impl Tool for ViewTool {
    fn name(&self) -> &str {
        "view"
    }

    fn description(&self) -> &str {
        "Read a file from the workspace. Output is numbered by line. Use offset and limit to page through large files. Viewing a file is required before write, edit or patch may change it."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Absolute path of the file to read"
                },
                "offset": {
                    "type": "integer",
                    "description": "Number of lines to skip (0-based)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to return (default 2000)"
                }
            },
            "required": ["file_path"]
        })
    }

    fn side_effect_free(&self) -> bool {
        true
    }

    fn permission_description(&self, input: &serde_json::Value) -> String {
        format!("Read {}", input["file_path"].as_str().unwrap_or_default())
    }

    async fn run(&self, _ctx: &ToolContext, call: &ToolCall) -> Result<ToolResponse, ToolError> {
        let params: ViewParams = call.parse_input()?;
        let path = match self.env.resolve(&params.file_path) {
            Ok(p) => p,
            Err(refusal) => return Ok(refusal),
        };

        let meta = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(_) => {
                let mut message = format!("file not found: {}", params.file_path);
                let similar = similar_names(&path).await;
                if !similar.is_empty() {
                    message.push_str("\n\nDid you mean one of these?\n");
                    message.push_str(&similar.join("\n"));
                }
                return Ok(ToolResponse::error(message));
            }
        };
        if meta.is_dir() {
            return Ok(ToolResponse::error(format!(
                "path is a directory, not a file: {}",
                params.file_path
            )));
        }
        if meta.len() > MAX_READ_BYTES {
            return Ok(ToolResponse::error(format!(
                "file is too large ({} bytes). Maximum size is {MAX_READ_BYTES} bytes",
                meta.len()
            )));
        }
        if let Some(ext) = path.extension().and_then(|e| e.to_str())
            && IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str())
        {
            return Ok(ToolResponse::error(format!("reading {ext} images is not supported")));
        }

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| ToolError::failed("view", e.to_string()))?;
        let Ok(content) = String::from_utf8(bytes) else {
            return Ok(ToolResponse::error(format!(
                "{} is not a UTF-8 text file",
                params.file_path
            )));
        };

        let limit = params.limit.filter(|l| *l > 0).unwrap_or(DEFAULT_LINE_LIMIT);
        let total = content.lines().count();
        let body = number_lines(&content, params.offset, limit);
        debug!(path = %path.display(), total, offset = params.offset, "Viewed file");

        self.env.record(&path, &content).await?;

        let mut output = format!("<file>\n{body}\n");
        let shown_end = params.offset.saturating_add(limit);
        if total > shown_end {
            output.push_str(&format!(
                "\n(File has more lines. Use 'offset' to read beyond line {shown_end})\n"
            ));
        }
        output.push_str("</file>");

        Ok(ToolResponse::text(output).with_metadata(serde_json::json!({
            "file_path": path.display().to_string(),
            "total_lines": total,
        })))
    }
}

/// `offset`-skipped, `limit`-bounded lines, each prefixed with its 1-based
/// number and clipped to [`MAX_LINE_CHARS`].
fn number_lines(content: &str, offset: usize, limit: usize) -> String {
    content
        .lines()
        .enumerate()
        .skip(offset)
        .take(limit)
        .map(|(i, line)| {
            let line = match line.char_indices().nth(MAX_LINE_CHARS) {
                Some((cut, _)) => format!("{}...", &line[..cut]),
                None => line.to_string(),
            };
            format!("{:>6}|{line}", i + 1)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Up to three entries next to a missing path whose names resemble it.
async fn similar_names(path: &Path) -> Vec<String> {
    let (Some(dir), Some(name)) = (path.parent(), path.file_name()) else {
        return Vec::new();
    };
    let wanted = name.to_string_lossy().to_lowercase();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return Vec::new();
    };
    let mut out = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let candidate = entry.file_name().to_string_lossy().to_lowercase();
        if candidate.contains(&wanted) || wanted.contains(&candidate) {
            out.push(entry.path().display().to_string());
            if out.len() >= 3 {
                break;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::testing::{ctx, env};

    fn call(input: serde_json::Value) -> ToolCall {
        ToolCall::new("c1", "view", input.to_string())
    }

    #[tokio::test]
    async fn reads_numbered_lines_and_records_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let env = env(&dir);
        let path = env.workspace.root().join("main.rs");
        std::fs::write(&path, "fn main() {\n    println!(\"hi\");\n}\n").unwrap();

        let tool = ViewTool::new(Arc::clone(&env));
        let out = tool
            .run(&ctx(), &call(serde_json::json!({"file_path": path})))
            .await
            .unwrap();
        assert!(out.success);
        assert!(out.content.contains("     1|fn main() {"));
        assert!(out.content.contains("     3|}"));

        let snapshot = env.store.get_file(&path.display().to_string()).await.unwrap().unwrap();
        assert!(snapshot.content.starts_with("fn main()"));
    }

    #[tokio::test]
    async fn offset_and_limit_page_through() {
        let dir = tempfile::tempdir().unwrap();
        let env = env(&dir);
        let path = env.workspace.root().join("n.txt");
        let body: String = (1..=10).map(|i| format!("line{i}\n")).collect();
        std::fs::write(&path, body).unwrap();

        let out = ViewTool::new(env)
            .run(&ctx(), &call(serde_json::json!({"file_path": path, "offset": 2, "limit": 3})))
            .await
            .unwrap();
        assert!(out.content.contains("     3|line3"));
        assert!(out.content.contains("     5|line5"));
        assert!(!out.content.contains("line6"));
        assert!(out.content.contains("beyond line 5"));
    }

    #[tokio::test]
    async fn long_lines_are_clipped() {
        let dir = tempfile::tempdir().unwrap();
        let env = env(&dir);
        let path = env.workspace.root().join("wide.txt");
        std::fs::write(&path, "x".repeat(MAX_LINE_CHARS + 50)).unwrap();

        let out = ViewTool::new(env)
            .run(&ctx(), &call(serde_json::json!({"file_path": path})))
            .await
            .unwrap();
        assert!(out.content.contains(&format!("{}...", "x".repeat(MAX_LINE_CHARS))));
        assert!(!out.content.contains(&"x".repeat(MAX_LINE_CHARS + 1)));
    }

    #[tokio::test]
    async fn oversized_and_missing_files_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let env = env(&dir);
        let big = env.workspace.root().join("big.txt");
        std::fs::write(&big, vec![b'a'; MAX_READ_BYTES as usize + 1]).unwrap();
        std::fs::write(env.workspace.root().join("config.toml"), "").unwrap();

        let tool = ViewTool::new(Arc::clone(&env));
        let out = tool.run(&ctx(), &call(serde_json::json!({"file_path": big}))).await.unwrap();
        assert!(!out.success);
        assert!(out.content.contains("too large"));

        let missing = env.workspace.root().join("config");
        let out = tool.run(&ctx(), &call(serde_json::json!({"file_path": missing}))).await.unwrap();
        assert!(!out.success);
        assert!(out.content.contains("config.toml"));
    }

    #[tokio::test]
    async fn paths_outside_workspace_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let out = ViewTool::new(env(&dir))
            .run(&ctx(), &call(serde_json::json!({"file_path": "/etc/hostname"})))
            .await
            .unwrap();
        assert!(!out.success);
        assert!(out.content.contains("outside the workspace"));
    }
}
