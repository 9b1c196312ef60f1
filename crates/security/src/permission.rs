//! Permission gate: user consent for tool invocations.
//!
//! A request is granted immediately when the session holds a grant for the
//! tool (or the session is auto-approved). Otherwise the gate publishes a
//! [`PermissionRequest`] and waits for [`PermissionGate::respond`]. Prompts
//! are serialized per session; different sessions may prompt concurrently.
//! Cancellation while waiting counts as a denial. There is no timeout.

use codeloom_core::event::{Broker, EventType};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// A prompt surfaced to the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub id: String,
    pub session_id: String,
    pub tool_name: String,
    pub description: String,
    /// Decoded tool arguments
    pub params: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// The user's answer to a [`PermissionRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionDecision {
    AllowOnce,
    AllowForSession,
    Deny,
}

impl PermissionDecision {
    pub fn is_allowed(self) -> bool {
        !matches!(self, Self::Deny)
    }
}

/// What a caller asks permission for.
#[derive(Debug, Clone)]
pub struct PermissionAsk {
    pub session_id: String,
    pub tool_name: String,
    pub description: String,
    pub params: serde_json::Value,
    pub path: Option<String>,
}

#[derive(Default)]
struct GateState {
    /// (session, tool) pairs allowed for the session's lifetime
    grants: HashSet<(String, String)>,
    auto_approve: HashSet<String>,
    session_locks: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
    pending: HashMap<String, oneshot::Sender<PermissionDecision>>,
}

pub struct PermissionGate {
    state: Mutex<GateState>,
    events: Broker<PermissionRequest>,
}

impl PermissionGate {
    pub fn new(events: Broker<PermissionRequest>) -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            events,
        }
    }

    /// Broker on which prompts are published (Created) and retracted (Deleted).
    pub fn events(&self) -> &Broker<PermissionRequest> {
        &self.events
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_granted(&self, session_id: &str, tool_name: &str) -> bool {
        let state = self.lock();
        state.auto_approve.contains(session_id)
            || state
                .grants
                .contains(&(session_id.to_string(), tool_name.to_string()))
    }

    fn session_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut state = self.lock();
        Arc::clone(state.session_locks.entry(session_id.to_string()).or_default())
    }

    /// Ask for consent. Returns `true` if the call may proceed.
    pub async fn request(&self, cancel: &CancellationToken, ask: PermissionAsk) -> bool {
        if self.is_granted(&ask.session_id, &ask.tool_name) {
            debug!(session_id = %ask.session_id, tool = %ask.tool_name, "Permission pre-granted");
            return true;
        }

        let session_lock = self.session_lock(&ask.session_id);
        let _serial = tokio::select! {
            guard = session_lock.lock_owned() => guard,
            _ = cancel.cancelled() => return false,
        };

        // A prompt answered while we queued may have granted this tool.
        if self.is_granted(&ask.session_id, &ask.tool_name) {
            return true;
        }

        let request = PermissionRequest {
            id: Uuid::new_v4().to_string(),
            session_id: ask.session_id,
            tool_name: ask.tool_name,
            description: ask.description,
            params: ask.params,
            path: ask.path,
        };
        let (tx, rx) = oneshot::channel();
        self.lock().pending.insert(request.id.clone(), tx);
        info!(
            session_id = %request.session_id,
            tool = %request.tool_name,
            request_id = %request.id,
            "Permission requested"
        );
        self.events.publish(EventType::Created, request.clone());

        let decision = tokio::select! {
            answer = rx => answer.unwrap_or(PermissionDecision::Deny),
            _ = cancel.cancelled() => PermissionDecision::Deny,
        };
        self.lock().pending.remove(&request.id);

        if decision == PermissionDecision::AllowForSession {
            self.grant(&request.session_id, &request.tool_name);
        }
        info!(
            session_id = %request.session_id,
            tool = %request.tool_name,
            decision = ?decision,
            "Permission resolved"
        );
        self.events.publish(EventType::Deleted, request);
        decision.is_allowed()
    }

    /// Deliver the user's answer. Returns `false` if no such request is waiting.
    pub fn respond(&self, request_id: &str, decision: PermissionDecision) -> bool {
        let sender = self.lock().pending.remove(request_id);
        match sender {
            Some(tx) => tx.send(decision).is_ok(),
            None => false,
        }
    }

    /// Allow `tool_name` for the rest of the session. Idempotent.
    pub fn grant(&self, session_id: &str, tool_name: &str) {
        self.lock()
            .grants
            .insert((session_id.to_string(), tool_name.to_string()));
    }

    /// Allow every tool in `session_id` without prompting (non-interactive runs).
    pub fn auto_approve_session(&self, session_id: &str) {
        self.lock().auto_approve.insert(session_id.to_string());
    }

    /// Forget grants and locks held for a session.
    pub fn clear_session(&self, session_id: &str) {
        let mut state = self.lock();
        state.grants.retain(|(s, _)| s != session_id);
        state.auto_approve.remove(session_id);
        state.session_locks.remove(session_id);
    }

    pub fn grant_count(&self) -> usize {
        self.lock().grants.len()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }
}

impl Default for PermissionGate {
    fn default() -> Self {
        Self::new(Broker::new())
    }
}
