//! System prompts for each agent role.

use chrono::Local;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Who is talking to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentRole {
    /// The main interactive agent with the full tool set.
    Coder,
    /// A delegated sub-agent with read-only tools.
    Task,
}

impl AgentRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Coder => "coder",
            Self::Task => "task",
        }
    }

    pub fn system_prompt(self, env: &Environment) -> String {
        let base = match self {
            Self::Coder => CODER,
            Self::Task => TASK,
        };
        let mut prompt = format!("{base}\n\n{}", env.render());
        if !env.project_context.is_empty() {
            prompt.push_str("\n\n# Project-Specific Context\nFollow the instructions in the context below.\n");
            prompt.push_str(&env.project_context);
        }
        prompt
    }
}

const CODER: &str = "You are codeloom, an interactive command-line coding assistant. You help the user with software engineering tasks in their workspace using the tools available to you.

# Working style
- Be concise and direct. Your output is shown in a terminal; answer in a few lines unless the user asks for detail.
- Do not explain what you are about to do or summarize what you did unless asked.
- Never guess about file contents or project structure. Read files and search the tree before answering.
- Follow the conventions of the code you are editing: naming, formatting, libraries and idioms already in use.
- Never assume a library is available. Check the manifest or neighbouring files first.
- Do not add comments to code unless the user asks or the code is genuinely unclear.

# Doing tasks
1. Search and read to understand the code involved. Call independent read-only tools together in one reply.
2. Make the change with the edit, patch or write tools. Always view a file before modifying it.
3. Verify: run the project's tests, build or linter with bash when you know the command. Check diagnostics after edits.
4. Stop when the task is done. Do not commit unless asked.

# Tools
- Prefer glob, grep, ls and view over shell equivalents, and fetch over curl or wget.
- Use the agent tool for open-ended searches that may take several rounds of globbing and grepping.
- Tool results and user messages may contain diagnostics in <file_diagnostics> and <project_diagnostics> tags. Fix the ones your changes caused and ignore unrelated ones.
- Refer to code locations as path:line.";

const TASK: &str = "You are a sub-agent of codeloom. Use the tools available to you to answer the prompt you were given.

Notes:
1. Be concise and direct: your final reply is handed back to another agent, not shown to a person. Answer the question without introductions, conclusions or narration of what you did.
2. When relevant, include file names and code snippets that support the answer.
3. Every file path in your final reply must be absolute.";

/// System prompt for the title generator.
pub const TITLE: &str = "You generate a short title from the first message a user starts a conversation with.
- the title is at most 50 characters long
- it summarizes the user's message
- it is a single line
- it contains no quotes and no colons
- your entire reply is used verbatim as the title";

/// System prompt for the summarizer.
pub const SUMMARIZER: &str = "You are an assistant that summarizes coding conversations so they can be continued with less context.

Write a detailed but concise summary that keeps what is needed to carry on:
- what was done
- what is in progress
- which files were read or modified
- what should happen next

Be complete enough to resume the work, short enough to read quickly.";

/// Final user instruction appended to the history handed to the summarizer.
pub const SUMMARY_REQUEST: &str = "Summarize the conversation above so that we can continue from the summary alone.";

/// Prefix for the summary when it is replayed as the first history message.
pub const SUMMARY_PREFIX: &str = "Summary of the conversation so far:\n\n";

/// Facts about the machine and workspace shown to the model.
#[derive(Debug, Clone)]
pub struct Environment {
    pub workspace: PathBuf,
    pub is_git: bool,
    pub platform: &'static str,
    pub date: String,
    /// Contents of the project instruction files, already labelled
    pub project_context: String,
}

impl Environment {
    /// Inspect `workspace` and read whichever `context_paths` exist.
    pub async fn detect(workspace: &Path, context_paths: &[String]) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            is_git: tokio::fs::metadata(workspace.join(".git")).await.is_ok(),
            platform: std::env::consts::OS,
            date: Local::now().format("%Y-%m-%d").to_string(),
            project_context: project_context(workspace, context_paths).await,
        }
    }

    fn render(&self) -> String {
        format!(
            "<env>\nWorking directory: {}\nIs directory a git repo: {}\nPlatform: {}\nToday's date: {}\n</env>",
            self.workspace.display(),
            if self.is_git { "yes" } else { "no" },
            self.platform,
            self.date
        )
    }
}

/// Concatenate instruction files, each under a `# From:` header. Entries
/// ending in `/` pull in every file directly inside that directory.
pub async fn project_context(workspace: &Path, paths: &[String]) -> String {
    let mut files = Vec::new();
    for entry in paths {
        let path = workspace.join(entry.trim_end_matches('/'));
        if entry.ends_with('/') {
            let Ok(mut dir) = tokio::fs::read_dir(&path).await else {
                continue;
            };
            let mut listed = Vec::new();
            while let Ok(Some(item)) = dir.next_entry().await {
                if item.file_type().await.is_ok_and(|t| t.is_file()) {
                    listed.push(item.path());
                }
            }
            listed.sort();
            files.extend(listed);
        } else {
            files.push(path);
        }
    }

    let mut sections = Vec::new();
    for file in files {
        if let Ok(content) = tokio::fs::read_to_string(&file).await {
            debug!(path = %file.display(), "Loaded project context");
            sections.push(format!("# From: {}\n{}", file.display(), content.trim_end()));
        }
    }
    sections.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(context: &str) -> Environment {
        Environment {
            workspace: PathBuf::from("/work/project"),
            is_git: true,
            platform: "linux",
            date: "2026-01-02".into(),
            project_context: context.into(),
        }
    }

    #[test]
    fn prompts_carry_environment() {
        let prompt = AgentRole::Coder.system_prompt(&env(""));
        assert!(prompt.starts_with("You are codeloom"));
        assert!(prompt.contains("Working directory: /work/project"));
        assert!(prompt.contains("Is directory a git repo: yes"));
        assert!(!prompt.contains("Project-Specific Context"));

        let task = AgentRole::Task.system_prompt(&env("# From: AGENTS.md\nuse tabs"));
        assert!(task.starts_with("You are a sub-agent"));
        assert!(task.ends_with("use tabs"));
    }

    #[tokio::test]
    async fn project_context_reads_files_and_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        std::fs::write(dir.join("AGENTS.md"), "run cargo fmt\n").unwrap();
        std::fs::create_dir_all(dir.join(".cursor/rules")).unwrap();
        std::fs::write(dir.join(".cursor/rules/b.md"), "rule b").unwrap();
        std::fs::write(dir.join(".cursor/rules/a.md"), "rule a").unwrap();

        let paths = vec!["missing.md".to_string(), ".cursor/rules/".into(), "AGENTS.md".into()];
        let context = project_context(dir, &paths).await;
        let a = context.find("rule a").unwrap();
        let b = context.find("rule b").unwrap();
        let agents = context.find("run cargo fmt").unwrap();
        assert!(a < b && b < agents);
        assert!(context.contains("# From: "));
    }
}
