//! The `agent` tool: delegates a prompt to a read-only sub-agent running in
//! a child session and returns its final answer.

use async_trait::async_trait;
use codeloom_core::error::{StoreError, ToolError};
use codeloom_core::tool::{Tool, ToolCall, ToolContext, ToolResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::event::TurnState;
use crate::orchestrator::WeakOrchestrator;
use crate::subagent::clean_title;

const DESCRIPTION: &str = "Launch a new agent that has access to the following tools: view, ls, glob, grep. \
Use it when you are searching for a keyword or file and are not confident you will find the right match \
in the first few tries. The agent cannot modify files. Launch several agents in one reply when the \
searches are independent. The agent's final reply is returned to you and is not shown to the user; \
tell the user what you learned. Each agent starts without memory of this conversation, so the prompt \
must be self-contained and say exactly what information to return.";

pub struct AgentTool {
    orchestrator: WeakOrchestrator,
}

impl AgentTool {
    pub fn new(orchestrator: WeakOrchestrator) -> Self {
        Self { orchestrator }
    }
}

#[derive(Deserialize)]
struct AgentParams {
    prompt: String,
}

#[async_trait]
impl Tool for AgentTool {
    fn name(&self) -> &str {
        "agent"
    }

    fn description(&self) -> &str {
        DESCRIPTION
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": {
                    "type": "string",
                    "description": "The task for the agent to perform"
                }
            },
            "required": ["prompt"]
        })
    }

    fn side_effect_free(&self) -> bool {
        true
    }

    async fn run(&self, ctx: &ToolContext, call: &ToolCall) -> Result<ToolResponse, ToolError> {
        let params: AgentParams = call.parse_input()?;
        if params.prompt.trim().is_empty() {
            return Err(ToolError::InvalidArguments("prompt is required".into()));
        }
        let orchestrator = self
            .orchestrator
            .upgrade()
            .ok_or_else(|| ToolError::failed("agent", "orchestrator has shut down"))?;
        let sessions = orchestrator.sessions();

        let child = match sessions.get(&call.id).await {
            Ok(existing) => existing,
            Err(StoreError::NotFound { .. }) => {
                let title = match clean_title(&params.prompt) {
                    t if t.is_empty() => "Sub-agent".to_string(),
                    t => t,
                };
                sessions.create_child(&ctx.session_id, &call.id, title).await?
            }
            Err(e) => return Err(e.into()),
        };
        info!(parent = %ctx.session_id, child = %child.id, "Delegating to sub-agent");

        let outcome = orchestrator
            .run_delegated(&child.id, params.prompt, &ctx.cancel)
            .await;

        let after = sessions.get(&child.id).await?;
        let spent = after.cost - child.cost;
        if spent > 0.0 {
            sessions.add_cost(&ctx.session_id, spent).await?;
        }

        match outcome {
            Ok(outcome) if outcome.state == TurnState::Done => Ok(ToolResponse::text(outcome.text())
                .with_metadata(json!({ "session_id": after.id, "cost": after.cost }))),
            Ok(_) => Err(ToolError::Cancelled),
            Err(e) => Err(ToolError::failed("agent", e)),
        }
    }
}
