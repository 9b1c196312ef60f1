//! Security for codeloom: user consent for tool calls and filesystem
//! sandboxing to the workspace root.
//!
//! Provides:
//! - **Permission gate**: per-session serialized consent prompts with session grants
//! - **Path validation**: canonicalize-and-prefix checks against the workspace root

pub mod path;
pub mod permission;

pub use path::{PathValidationError, Workspace};
pub use permission::{PermissionAsk, PermissionDecision, PermissionGate, PermissionRequest};
