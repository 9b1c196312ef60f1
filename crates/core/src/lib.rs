//! # codeloom core
//!
//! Domain types, traits, and error definitions for the codeloom coding agent.
//! Every subsystem (store, providers, tools) is described here as a trait or
//! a value type; implementations live in their own crates and depend inward
//! on this one.

pub mod error;
pub mod event;
pub mod message;
pub mod model;
pub mod provider;
pub mod session;
pub mod store;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{AgentError, Error, ProviderError, Result, StoreError, ToolError};
pub use event::{Broker, Event, EventType, Subscription};
pub use message::{ContentPart, Finish, FinishReason, Message, Role};
pub use model::{ModelCatalog, ModelInfo};
pub use provider::{Provider, ProviderEvent, ProviderRequest, ToolDefinition, Usage};
pub use session::Session;
pub use store::{FileSnapshot, Store};
pub use tool::{Tool, ToolCall, ToolContext, ToolRegistry, ToolResponse};
