//! Search tools: glob and grep.
//!
//! Both walk the tree with `ignore`, so `.gitignore` and friends are
//! honored and hidden entries skipped, and both report newest files first.

use async_trait::async_trait;
use codeloom_core::error::ToolError;
use codeloom_core::tool::{Tool, ToolCall, ToolContext, ToolResponse};
use ignore::WalkBuilder;
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use crate::file::ToolEnv;

pub const MAX_RESULTS: usize = 100;

/// Every regular file under `root` passing `keep`, with its mtime.
fn walk_files(root: &Path, mut keep: impl FnMut(&Path) -> bool) -> Vec<(PathBuf, SystemTime)> {
    let mut out = Vec::new();
    for entry in WalkBuilder::new(root)
        .hidden(true)
        .git_ignore(true)
        .require_git(false)
        .build()
        .flatten()
    {
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        let path = entry.path();
        if !keep(path) {
            continue;
        }
        let modified = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        out.push((path.to_path_buf(), modified));
    }
    out.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    out
}

fn search_root(env: &ToolEnv, path: Option<&str>) -> Result<PathBuf, ToolResponse> {
    match path {
        None | Some("") => Ok(env.workspace.root().to_path_buf()),
        Some(p) => env.resolve(p),
    }
}

/// Expand one level of `{a,b}` alternation, which `glob::Pattern` lacks.
fn expand_braces(pattern: &str) -> Vec<String> {
    let (Some(open), Some(close)) = (pattern.find('{'), pattern.find('}')) else {
        return vec![pattern.to_string()];
    };
    if close < open {
        return vec![pattern.to_string()];
    }
    let (head, tail) = (&pattern[..open], &pattern[close + 1..]);
    pattern[open + 1..close]
        .split(',')
        .flat_map(|alt| expand_braces(&format!("{head}{alt}{tail}")))
        .collect()
}

fn compile_globs(pattern: &str) -> Result<Vec<glob::Pattern>, String> {
    expand_braces(pattern)
        .iter()
        .map(|p| glob::Pattern::new(p).map_err(|e| format!("invalid glob pattern '{pattern}': {e}")))
        .collect()
}

const MATCH_PATHS: glob::MatchOptions = glob::MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

// --- glob ---

pub struct GlobTool {
    env: Arc<ToolEnv>,
}

impl GlobTool {
    pub fn new(env: Arc<ToolEnv>) -> Self {
        Self { env }
    }
}

#[derive(Deserialize)]
struct GlobParams {
    pattern: String,
    #[serde(default)]
    path: Option<String>,
}

#[async_trait]
impl Tool for GlobTool {
    fn name(&self) -> &str {
        "glob"
    }

    fn description(&self) -> &str {
        "Find files by name pattern such as '**/*.rs' or 'src/**/*.{ts,tsx}'. Results are sorted newest first and capped at 100."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Glob pattern, relative to the search directory"
                },
                "path": {
                    "type": "string",
                    "description": "Directory to search (defaults to the workspace root)"
                }
            },
            "required": ["pattern"]
        })
    }

    fn side_effect_free(&self) -> bool {
        true
    }

    async fn run(&self, _ctx: &ToolContext, call: &ToolCall) -> Result<ToolResponse, ToolError> {
        let params: GlobParams = call.parse_input()?;
        let root = match search_root(&self.env, params.path.as_deref()) {
            Ok(r) => r,
            Err(refusal) => return Ok(refusal),
        };
        let patterns = match compile_globs(&params.pattern) {
            Ok(p) => p,
            Err(reason) => return Ok(ToolResponse::error(reason)),
        };

        let base = root.clone();
        let files = tokio::task::spawn_blocking(move || {
            walk_files(&root, |path| {
                let rel = path.strip_prefix(&base).unwrap_or(path);
                patterns.iter().any(|p| p.matches_path_with(rel, MATCH_PATHS))
            })
        })
        .await
        .map_err(|e| ToolError::failed("glob", e.to_string()))?;

        if files.is_empty() {
            return Ok(ToolResponse::text("No files found"));
        }
        let truncated = files.len() > MAX_RESULTS;
        let mut output = files
            .iter()
            .take(MAX_RESULTS)
            .map(|(p, _)| p.display().to_string())
            .collect::<Vec<_>>()
            .join("\n");
        if truncated {
            output.push_str("\n\n(Results are truncated. Use a more specific path or pattern.)");
        }
        Ok(ToolResponse::text(output).with_metadata(serde_json::json!({
            "count": files.len().min(MAX_RESULTS),
            "truncated": truncated,
        })))
    }
}

// --- grep ---

pub struct GrepTool {
    env: Arc<ToolEnv>,
}

impl GrepTool {
    pub fn new(env: Arc<ToolEnv>) -> Self {
        Self { env }
    }
}

#[derive(Deserialize)]
struct GrepParams {
    pattern: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    include: Option<String>,
    #[serde(default)]
    literal_text: bool,
}

#[derive(Debug)]
struct FileMatches {
    path: PathBuf,
    lines: Vec<(usize, String)>,
}

/// Matches grouped by file, newest file first, at most [`MAX_RESULTS`]
/// lines in total. The flag reports whether more existed.
fn grep_files(root: &Path, regex: &Regex, include: &[glob::Pattern]) -> (Vec<FileMatches>, bool) {
    let files = walk_files(root, |path| {
        include.is_empty()
            || path
                .file_name()
                .is_some_and(|name| include.iter().any(|p| p.matches(&name.to_string_lossy())))
    });

    let mut groups = Vec::new();
    let mut total = 0usize;
    for (path, _) in files {
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue;
        };
        let mut lines = Vec::new();
        for (i, line) in content.lines().enumerate() {
            if !regex.is_match(line) {
                continue;
            }
            if total >= MAX_RESULTS {
                if !lines.is_empty() {
                    groups.push(FileMatches { path, lines });
                }
                return (groups, true);
            }
            total += 1;
            lines.push((i + 1, line.trim_end().to_string()));
        }
        if !lines.is_empty() {
            groups.push(FileMatches { path, lines });
        }
    }
    (groups, false)
}

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Search file contents with a regular expression. Set literal_text to match the pattern verbatim. Filter files with include (e.g. '*.rs' or '*.{ts,tsx}'). Matches are grouped by file, newest first, capped at 100."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Regex (or literal text) to search for"
                },
                "path": {
                    "type": "string",
                    "description": "Directory to search (defaults to the workspace root)"
                },
                "include": {
                    "type": "string",
                    "description": "File name glob to restrict the search"
                },
                "literal_text": {
                    "type": "boolean",
                    "description": "Treat pattern as plain text instead of a regex"
                }
            },
            "required": ["pattern"]
        })
    }

    fn side_effect_free(&self) -> bool {
        true
    }

    async fn run(&self, _ctx: &ToolContext, call: &ToolCall) -> Result<ToolResponse, ToolError> {
        let params: GrepParams = call.parse_input()?;
        let root = match search_root(&self.env, params.path.as_deref()) {
            Ok(r) => r,
            Err(refusal) => return Ok(refusal),
        };
        let source = if params.literal_text {
            regex::escape(&params.pattern)
        } else {
            params.pattern.clone()
        };
        let regex = match Regex::new(&source) {
            Ok(r) => r,
            Err(e) => return Ok(ToolResponse::error(format!("invalid regex: {e}"))),
        };
        let include = match params.include.as_deref().map(compile_globs).transpose() {
            Ok(p) => p.unwrap_or_default(),
            Err(reason) => return Ok(ToolResponse::error(reason)),
        };

        let (groups, truncated) = tokio::task::spawn_blocking(move || grep_files(&root, &regex, &include))
            .await
            .map_err(|e| ToolError::failed("grep", e.to_string()))?;

        if groups.is_empty() {
            return Ok(ToolResponse::text("No matches found"));
        }
        let count: usize = groups.iter().map(|g| g.lines.len()).sum();
        let mut output = format!("Found {count} matches\n");
        for group in &groups {
            output.push_str(&format!("{}:\n", group.path.display()));
            for (n, text) in &group.lines {
                output.push_str(&format!("  Line {n}: {text}\n"));
            }
            output.push('\n');
        }
        if truncated {
            output.push_str("(Results are truncated. Use a more specific path or pattern.)\n");
        }
        Ok(ToolResponse::text(output.trim_end().to_string()).with_metadata(serde_json::json!({
            "matches": count,
            "files": groups.len(),
            "truncated": truncated,
        })))
    }
}
