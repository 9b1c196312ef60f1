//! The codeloom agent: turns a user message into a finished assistant reply.
//!
//! A turn follows a **Stream → Dispatch → Stream** cycle:
//!
//! 1. **Prepare** the history from the session's summary anchor on, and
//!    compact it first when it nears the model's context window
//! 2. **Stream** a completion, persisting the assistant message as it grows
//! 3. **If tool calls**: gate, run and persist them, then stream again
//! 4. **If text only**: the turn is done
//!
//! The cycle ends on a text-only answer, on cancellation, on an error, or
//! after the configured number of provider calls.

pub mod agent_tool;
pub mod assembler;
pub mod budget;
pub mod event;
pub mod orchestrator;
pub mod prompt;
pub mod session;
pub mod subagent;

pub use agent_tool::AgentTool;
pub use assembler::{MessageAssembler, StreamEnd, Streamed};
pub use event::{AgentEvent, TurnState};
pub use orchestrator::{Orchestrator, OrchestratorConfig, TurnOutcome, UserInput, WeakOrchestrator};
pub use prompt::{AgentRole, Environment};
pub use session::SessionManager;
pub use subagent::{Summarizer, TitleGenerator};
