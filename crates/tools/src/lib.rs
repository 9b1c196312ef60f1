//! Built-in tool implementations for codeloom.
//!
//! Tools give the agent the ability to act in the workspace: read, write,
//! edit and patch files, list and search the tree, run shell commands,
//! fetch URLs, and read language-server diagnostics. The `agent` tool,
//! which needs the orchestrator, lives in `codeloom-agent`.

pub mod bash;
pub mod diagnostics;
pub mod edit;
pub mod fetch;
pub mod file;
pub mod ls;
pub mod patch;
pub mod search;
pub mod view;
pub mod write;

use codeloom_core::error::ToolError;
use codeloom_core::tool::ToolRegistry;
use std::sync::Arc;

pub use diagnostics::{Diagnostic, DiagnosticsSource, PublishedDiagnostics, Severity};
pub use file::{FileLocks, ToolEnv};

/// Read-only tools handed to sub-agents.
pub const TASK_TOOLS: &[&str] = &["view", "ls", "glob", "grep"];

/// Create a registry with every built-in tool, in the order they are
/// presented to the model.
pub fn builtin_registry(
    env: Arc<ToolEnv>,
    diagnostics: Arc<dyn DiagnosticsSource>,
) -> Result<ToolRegistry, ToolError> {
    let registry = ToolRegistry::new()
        .with(Arc::new(view::ViewTool::new(Arc::clone(&env))))
        .with(Arc::new(ls::LsTool::new(Arc::clone(&env))))
        .with(Arc::new(search::GlobTool::new(Arc::clone(&env))))
        .with(Arc::new(search::GrepTool::new(Arc::clone(&env))))
        .with(Arc::new(write::WriteTool::new(Arc::clone(&env))))
        .with(Arc::new(edit::EditTool::new(Arc::clone(&env))))
        .with(Arc::new(patch::PatchTool::new(Arc::clone(&env))))
        .with(Arc::new(bash::BashTool::new(Arc::clone(&env))))
        .with(Arc::new(fetch::FetchTool::new(Arc::clone(&env))?))
        .with(Arc::new(diagnostics::DiagnosticsTool::new(env, diagnostics)));
    Ok(registry)
}
