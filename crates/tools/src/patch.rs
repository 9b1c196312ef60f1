//! Patch tool: apply a unified diff to one file.
//!
//! Every hunk is located and checked against the current content before
//! anything is written, so a patch either applies completely or not at all.

use async_trait::async_trait;
use codeloom_core::error::ToolError;
use codeloom_core::tool::{Tool, ToolCall, ToolContext, ToolResponse};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use crate::file::{ToolEnv, write_file};

pub struct PatchTool {
    env: Arc<ToolEnv>,
}

impl PatchTool {
    pub fn new(env: Arc<ToolEnv>) -> Self {
        Self { env }
    }
}

#[derive(Deserialize)]
struct PatchParams {
    file_path: String,
    patch: String,
}

/// One `@@ -a,b +c,d @@` section.
#[derive(Debug, Clone, PartialEq)]
struct Hunk {
    /// 1-based first line of the old range (0 for pure insertions at the top)
    old_start: usize,
    old_lines: Vec<String>,
    new_lines: Vec<String>,
}

impl Hunk {
    fn additions(&self) -> usize {
        self.new_lines.len().saturating_sub(self.shared())
    }

    fn removals(&self) -> usize {
        self.old_lines.len().saturating_sub(self.shared())
    }

    fn shared(&self) -> usize {
        self.old_lines.iter().filter(|l| self.new_lines.contains(l)).count()
    }
}

fn parse_range(range: &str, sign: char) -> Option<usize> {
    let range = range.strip_prefix(sign)?;
    range.split(',').next()?.parse().ok()
}

fn parse_hunks(patch: &str) -> Result<Vec<Hunk>, String> {
    let mut hunks: Vec<Hunk> = Vec::new();
    let mut current: Option<Hunk> = None;

    for (n, line) in patch.lines().enumerate() {
        if line.starts_with("@@") {
            if let Some(h) = current.take() {
                hunks.push(h);
            }
            let mut fields = line.split_whitespace().skip(1);
            let old = fields.next().and_then(|f| parse_range(f, '-'));
            let new = fields.next().and_then(|f| parse_range(f, '+'));
            let (Some(old_start), Some(_)) = (old, new) else {
                return Err(format!("line {}: malformed hunk header '{line}'", n + 1));
            };
            current = Some(Hunk {
                old_start,
                old_lines: Vec::new(),
                new_lines: Vec::new(),
            });
            continue;
        }

        let Some(hunk) = current.as_mut() else {
            // Preamble: `diff`, `index`, `---`, `+++` headers.
            continue;
        };
        if let Some(rest) = line.strip_prefix('+') {
            hunk.new_lines.push(rest.to_string());
        } else if let Some(rest) = line.strip_prefix('-') {
            hunk.old_lines.push(rest.to_string());
        } else if let Some(rest) = line.strip_prefix(' ') {
            hunk.old_lines.push(rest.to_string());
            hunk.new_lines.push(rest.to_string());
        } else if line.is_empty() {
            hunk.old_lines.push(String::new());
            hunk.new_lines.push(String::new());
        } else if line.starts_with('\\') {
            // "\ No newline at end of file"
        } else {
            return Err(format!("line {}: unexpected diff line '{line}'", n + 1));
        }
    }
    if let Some(h) = current {
        hunks.push(h);
    }
    if hunks.is_empty() {
        return Err("patch contains no @@ hunks".to_string());
    }
    Ok(hunks)
}

/// Apply `hunks` in order. A hunk is tried at its stated position first,
/// then at the nearest exact match after the previous hunk.
fn apply_hunks(content: &str, hunks: &[Hunk]) -> Result<String, String> {
    let newline = if content.contains("\r\n") { "\r\n" } else { "\n" };
    let trailing = content.ends_with('\n');
    let lines: Vec<&str> = content.lines().collect();

    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    let mut cursor = 0usize;

    for (i, hunk) in hunks.iter().enumerate() {
        let matches_at = |at: usize| {
            at + hunk.old_lines.len() <= lines.len()
                && hunk
                    .old_lines
                    .iter()
                    .zip(&lines[at..])
                    .all(|(want, have)| want == have)
        };

        let stated = hunk.old_start.saturating_sub(1).max(cursor);
        let at = if matches_at(stated) {
            Some(stated)
        } else {
            (cursor..=lines.len()).find(|&at| matches_at(at))
        };
        let Some(at) = at else {
            return Err(format!(
                "hunk {} (@@ -{}) does not match the file; context and removed lines must match exactly",
                i + 1,
                hunk.old_start
            ));
        };

        out.extend(lines[cursor..at].iter().map(|l| l.to_string()));
        out.extend(hunk.new_lines.iter().cloned());
        cursor = at + hunk.old_lines.len();
    }
    out.extend(lines[cursor..].iter().map(|l| l.to_string()));

    let mut result = out.join(newline);
    if (trailing || content.is_empty()) && !result.is_empty() {
        result.push_str(newline);
    }
    Ok(result)
}

#[async_trait]
impl Tool for PatchTool {
    fn name(&self) -> &str {
        "patch"
    }

    fn description(&self) -> &str {
        "Apply a unified diff to a file. Each hunk starts with an '@@ -a,b +c,d @@' header; context (' ') and removed ('-') lines must match the file exactly. Either all hunks apply or the file is left unchanged. The file must have been viewed first."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Absolute path of the file to patch"
                },
                "patch": {
                    "type": "string",
                    "description": "Unified diff text with one or more hunks"
                }
            },
            "required": ["file_path", "patch"]
        })
    }

    fn permission_description(&self, input: &serde_json::Value) -> String {
        format!("Patch {}", input["file_path"].as_str().unwrap_or_default())
    }

    async fn run(&self, _ctx: &ToolContext, call: &ToolCall) -> Result<ToolResponse, ToolError> {
        let params: PatchParams = call.parse_input()?;
        let path = match self.env.resolve(&params.file_path) {
            Ok(p) => p,
            Err(refusal) => return Ok(refusal),
        };
        let hunks = match parse_hunks(&params.patch) {
            Ok(h) => h,
            Err(reason) => return Ok(ToolResponse::error(format!("invalid patch: {reason}"))),
        };

        let _guard = self.env.locks.lock(&path).await;

        let exists = tokio::fs::try_exists(&path).await.unwrap_or(false);
        let before = if exists {
            match self.env.check_fresh(&path).await? {
                Ok(disk) => disk,
                Err(refusal) => return Ok(refusal),
            }
        } else if hunks.iter().all(|h| h.old_lines.is_empty()) {
            String::new()
        } else {
            return Ok(ToolResponse::error(format!("file not found: {}", params.file_path)));
        };

        let after = match apply_hunks(&before, &hunks) {
            Ok(text) => text,
            Err(reason) => return Ok(ToolResponse::error(reason)),
        };
        if after == before {
            return Ok(ToolResponse::error("patch produces no changes"));
        }

        write_file(&path, &after).await?;
        self.env.record(&path, &after).await?;

        let additions: usize = hunks.iter().map(Hunk::additions).sum();
        let removals: usize = hunks.iter().map(Hunk::removals).sum();
        info!(path = %path.display(), hunks = hunks.len(), additions, removals, "Patch applied");

        Ok(ToolResponse::text(format!(
            "Patch applied to {}: {} hunk(s), +{additions} -{removals}",
            path.display(),
            hunks.len()
        ))
        .with_metadata(serde_json::json!({
            "file_path": path.display().to_string(),
            "hunks": hunks.len(),
            "additions": additions,
            "removals": removals,
        })))
    }
}
