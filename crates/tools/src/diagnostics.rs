//! Diagnostics tool: report compiler and linter findings.
//!
//! The language-server transport lives outside this crate; it feeds
//! findings in through a [`DiagnosticsSource`].

use async_trait::async_trait;
use codeloom_core::error::ToolError;
use codeloom_core::tool::{Tool, ToolCall, ToolContext, ToolResponse};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use crate::file::ToolEnv;

/// Listed per section before the rest are summarized.
const MAX_PER_SECTION: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Information,
    Hint,
}

impl Severity {
    fn label(self) -> &'static str {
        match self {
            Self::Error => "Error",
            Self::Warning => "Warn",
            Self::Information => "Info",
            Self::Hint => "Hint",
        }
    }
}

/// Zero-based line and character offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub path: PathBuf,
    pub range: Range,
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}

impl Diagnostic {
    fn render(&self) -> String {
        let code = self.code.as_deref().map(|c| format!("[{c}]")).unwrap_or_default();
        format!(
            "{}: {}:{}:{} [{}]{code} {}",
            self.severity.label(),
            self.path.display(),
            self.range.start.line + 1,
            self.range.start.character + 1,
            self.source.as_deref().unwrap_or_default(),
            self.message
        )
    }
}

/// Where diagnostics come from, typically one or more language servers.
#[async_trait]
pub trait DiagnosticsSource: Send + Sync {
    /// Current diagnostics. When `path` is given the source may refresh
    /// that file first; the result still covers the whole project.
    async fn diagnostics(&self, path: Option<&Path>) -> Result<Vec<Diagnostic>, String>;
}

/// A source whose contents are pushed in by the host, keyed by file.
#[derive(Default)]
pub struct PublishedDiagnostics {
    files: RwLock<BTreeMap<PathBuf, Vec<Diagnostic>>>,
}

impl PublishedDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the diagnostics for `path`; an empty list clears it.
    pub fn publish(&self, path: impl Into<PathBuf>, diagnostics: Vec<Diagnostic>) {
        let mut files = self.files.write().unwrap_or_else(PoisonError::into_inner);
        let path = path.into();
        if diagnostics.is_empty() {
            files.remove(&path);
        } else {
            files.insert(path, diagnostics);
        }
    }
}

#[async_trait]
impl DiagnosticsSource for PublishedDiagnostics {
    async fn diagnostics(&self, _path: Option<&Path>) -> Result<Vec<Diagnostic>, String> {
        let files = self.files.read().unwrap_or_else(PoisonError::into_inner);
        Ok(files.values().flatten().cloned().collect())
    }
}

pub struct DiagnosticsTool {
    env: Arc<ToolEnv>,
    source: Arc<dyn DiagnosticsSource>,
}

impl DiagnosticsTool {
    pub fn new(env: Arc<ToolEnv>, source: Arc<dyn DiagnosticsSource>) -> Self {
        Self { env, source }
    }
}

#[derive(Deserialize)]
struct DiagnosticsParams {
    #[serde(default)]
    file_path: Option<String>,
}

fn section(tag: &str, mut entries: Vec<&Diagnostic>) -> String {
    if entries.is_empty() {
        return String::new();
    }
    entries.sort_by(|a, b| {
        a.severity
            .cmp(&b.severity)
            .then_with(|| a.path.cmp(&b.path))
            .then_with(|| a.range.start.line.cmp(&b.range.start.line))
    });
    let mut out = format!("<{tag}>\n");
    for d in entries.iter().take(MAX_PER_SECTION) {
        out.push_str(&d.render());
        out.push('\n');
    }
    if entries.len() > MAX_PER_SECTION {
        out.push_str(&format!("... and {} more diagnostics\n", entries.len() - MAX_PER_SECTION));
    }
    out.push_str(&format!("</{tag}>\n"));
    out
}

fn count(entries: &[&Diagnostic], severity: Severity) -> usize {
    entries.iter().filter(|d| d.severity == severity).count()
}

#[async_trait]
impl Tool for DiagnosticsTool {
    fn name(&self) -> &str {
        "diagnostics"
    }

    fn description(&self) -> &str {
        "Report errors and warnings from the language servers. With file_path, findings for that file are listed first, followed by the rest of the project."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "File to focus on (optional)"
                }
            }
        })
    }

    fn side_effect_free(&self) -> bool {
        true
    }

    async fn run(&self, _ctx: &ToolContext, call: &ToolCall) -> Result<ToolResponse, ToolError> {
        let params: DiagnosticsParams = call.parse_input()?;
        let focus = match params.file_path.as_deref() {
            Some(p) if !p.is_empty() => match self.env.resolve(p) {
                Ok(path) => Some(path),
                Err(refusal) => return Ok(refusal),
            },
            _ => None,
        };

        let all = self
            .source
            .diagnostics(focus.as_deref())
            .await
            .map_err(|reason| ToolError::failed("diagnostics", reason))?;

        let (file, project): (Vec<&Diagnostic>, Vec<&Diagnostic>) = all
            .iter()
            .partition(|d| focus.as_deref().is_some_and(|f| d.path == f));

        if file.is_empty() && project.is_empty() {
            return Ok(ToolResponse::text("No diagnostics"));
        }

        let mut output = section("file_diagnostics", file.clone());
        output.push_str(&section("project_diagnostics", project.clone()));
        output.push_str("<diagnostic_summary>\n");
        if focus.is_some() {
            output.push_str(&format!(
                "Current file: {} errors, {} warnings\n",
                count(&file, Severity::Error),
                count(&file, Severity::Warning)
            ));
        }
        output.push_str(&format!(
            "Project: {} errors, {} warnings\n",
            count(&project, Severity::Error),
            count(&project, Severity::Warning)
        ));
        output.push_str("</diagnostic_summary>");

        Ok(ToolResponse::text(output).with_metadata(serde_json::to_value(&all).unwrap_or_default()))
    }
}
