//! Edit tool: replace one exact occurrence of a string in a file.

use async_trait::async_trait;
use codeloom_core::error::ToolError;
use codeloom_core::tool::{Tool, ToolCall, ToolContext, ToolResponse};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::file::{ToolEnv, line_changes, write_file};

/// Single-occurrence string replacement.
///
/// An empty `old_string` creates a new file holding `new_string`; an empty
/// `new_string` deletes the matched text.
pub struct EditTool {
    env: Arc<ToolEnv>,
}

impl EditTool {
    pub fn new(env: Arc<ToolEnv>) -> Self {
        Self { env }
    }

    async fn create(&self, path: &Path, shown: &str, content: &str) -> Result<ToolResponse, ToolError> {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(ToolResponse::error(format!(
                "{shown} already exists; supply old_string to edit it"
            )));
        }
        write_file(path, content).await?;
        self.env.record(path, content).await?;
        info!(path = %path.display(), "File created by edit");
        Ok(ToolResponse::text(format!("File created: {}", path.display())).with_metadata(
            serde_json::json!({
                "file_path": path.display().to_string(),
                "additions": content.lines().count(),
                "removals": 0,
            }),
        ))
    }
}

#[derive(Deserialize)]
struct EditParams {
    file_path: String,
    #[serde(default)]
    old_string: String,
    #[serde(default)]
    new_string: String,
}

#[async_trait]
impl Tool for EditTool {
    fn name(&self) -> &str {
        "edit"
    }

    fn description(&self) -> &str {
        "Replace old_string with new_string in a file. old_string must match exactly once, including whitespace. An empty old_string creates a new file; an empty new_string deletes the match. The file must have been viewed first."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Absolute path of the file to modify"
                },
                "old_string": {
                    "type": "string",
                    "description": "The exact text to replace"
                },
                "new_string": {
                    "type": "string",
                    "description": "The replacement text"
                }
            },
            "required": ["file_path", "old_string", "new_string"]
        })
    }

    fn permission_description(&self, input: &serde_json::Value) -> String {
        format!("Edit {}", input["file_path"].as_str().unwrap_or_default())
    }

    async fn run(&self, _ctx: &ToolContext, call: &ToolCall) -> Result<ToolResponse, ToolError> {
        let params: EditParams = call.parse_input()?;
        let path = match self.env.resolve(&params.file_path) {
            Ok(p) => p,
            Err(refusal) => return Ok(refusal),
        };
        let _guard = self.env.locks.lock(&path).await;

        if params.old_string.is_empty() {
            return self.create(&path, &params.file_path, &params.new_string).await;
        }
        if params.old_string == params.new_string {
            return Ok(ToolResponse::error("old_string and new_string are identical"));
        }

        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => {
                return Ok(ToolResponse::error(format!(
                    "path is a directory, not a file: {}",
                    params.file_path
                )));
            }
            Ok(_) => {}
            Err(_) => {
                return Ok(ToolResponse::error(format!("file not found: {}", params.file_path)));
            }
        }
        let before = match self.env.check_fresh(&path).await? {
            Ok(disk) => disk,
            Err(refusal) => return Ok(refusal),
        };

        let after = match replace_once(&before, &params.old_string, &params.new_string) {
            Ok(text) => text,
            Err(reason) => return Ok(ToolResponse::error(reason)),
        };

        write_file(&path, &after).await?;
        self.env.record(&path, &after).await?;

        let (additions, removals) = line_changes(&before, &after);
        info!(path = %path.display(), additions, removals, "File edited");
        let verb = if params.new_string.is_empty() { "deleted from" } else { "replaced in" };
        Ok(ToolResponse::text(format!("Content {verb} file: {}", path.display())).with_metadata(
            serde_json::json!({
                "file_path": path.display().to_string(),
                "additions": additions,
                "removals": removals,
            }),
        ))
    }
}

fn replace_once(content: &str, old: &str, new: &str) -> Result<String, String> {
    let mut hits = content.match_indices(old);
    let Some((at, _)) = hits.next() else {
        return Err(
            "old_string not found in file. It must match exactly, including whitespace and line breaks"
                .to_string(),
        );
    };
    let extra = hits.count();
    if extra > 0 {
        return Err(format!(
            "old_string appears {} times in the file. Include more surrounding context to make it unique",
            extra + 1
        ));
    }
    let mut out = String::with_capacity(content.len() + new.len());
    out.push_str(&content[..at]);
    out.push_str(new);
    out.push_str(&content[at + old.len()..]);
    Ok(out)
}
