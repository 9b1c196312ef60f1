//! LLM provider clients for codeloom.
//!
//! Each vendor client implements `codeloom_core::Provider` and emits
//! normalized `ProviderEvent`s. The [`ProviderAdapter`] picks the client for
//! a model through the catalog and retries transient failures when opening
//! a stream.

pub mod adapter;
pub mod anthropic;
mod history;
mod http;
pub mod openai_compat;
pub mod retry;
mod sse;

pub use adapter::{ProviderAdapter, build_from_config};
pub use anthropic::AnthropicProvider;
pub use http::HttpSettings;
pub use openai_compat::OpenAiCompatProvider;
pub use retry::RetryPolicy;
