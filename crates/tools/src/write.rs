//! Write tool: create or replace a file.

use async_trait::async_trait;
use codeloom_core::error::ToolError;
use codeloom_core::tool::{Tool, ToolCall, ToolContext, ToolResponse};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use crate::file::{ToolEnv, line_changes, write_file};

pub struct WriteTool {
    env: Arc<ToolEnv>,
}

impl WriteTool {
    pub fn new(env: Arc<ToolEnv>) -> Self {
        Self { env }
    }
}

#[derive(Deserialize)]
struct WriteParams {
    file_path: String,
    content: String,
}

#[async_trait]
impl Tool for WriteTool {
    fn name(&self) -> &str {
        "write"
    }

    fn description(&self) -> &str {
        "Create a file or replace its entire content. Existing files must have been viewed first and must not have changed on disk since."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Absolute path of the file to write"
                },
                "content": {
                    "type": "string",
                    "description": "The complete new content of the file"
                }
            },
            "required": ["file_path", "content"]
        })
    }

    fn permission_description(&self, input: &serde_json::Value) -> String {
        format!("Write {}", input["file_path"].as_str().unwrap_or_default())
    }

    async fn run(&self, _ctx: &ToolContext, call: &ToolCall) -> Result<ToolResponse, ToolError> {
        let params: WriteParams = call.parse_input()?;
        let path = match self.env.resolve(&params.file_path) {
            Ok(p) => p,
            Err(refusal) => return Ok(refusal),
        };
        let _guard = self.env.locks.lock(&path).await;

        let before = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => {
                return Ok(ToolResponse::error(format!(
                    "path is a directory, not a file: {}",
                    params.file_path
                )));
            }
            Ok(_) => match self.env.check_fresh(&path).await? {
                Ok(disk) => Some(disk),
                Err(refusal) => return Ok(refusal),
            },
            Err(_) => None,
        };

        if before.as_deref() == Some(params.content.as_str()) {
            return Ok(ToolResponse::error(format!(
                "{} already contains exactly this content; nothing was written",
                params.file_path
            )));
        }

        write_file(&path, &params.content).await?;
        self.env.record(&path, &params.content).await?;

        let (additions, removals) = line_changes(before.as_deref().unwrap_or_default(), &params.content);
        let created = before.is_none();
        info!(path = %path.display(), created, additions, removals, "File written");

        Ok(ToolResponse::text(format!(
            "File successfully written: {}",
            path.display()
        ))
        .with_metadata(serde_json::json!({
            "file_path": path.display().to_string(),
            "created": created,
            "additions": additions,
            "removals": removals,
        })))
    }
}
