//! Provider adapter: routes a model ID to its vendor client.
//!
//! The catalog maps a model ID to a provider tag; the adapter holds one
//! client per tag. A stream is re-opened on transient failures, whether the
//! open itself fails or the vendor reports the error before any output, and
//! every outcome, including failure, is delivered as events on the returned
//! channel so callers have a single place to look.

use codeloom_core::error::ProviderError;
use codeloom_core::message::Message;
use codeloom_core::model::{ModelCatalog, ModelInfo};
use codeloom_core::provider::{Provider, ProviderEvent, ProviderRequest, ToolDefinition};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::anthropic::AnthropicProvider;
use crate::http::HttpSettings;
use crate::openai_compat::OpenAiCompatProvider;
use crate::retry::RetryPolicy;

/// Routes LLM requests to the correct provider.
pub struct ProviderAdapter {
    providers: HashMap<String, Arc<dyn Provider>>,
    catalog: Arc<ModelCatalog>,
    retry: RetryPolicy,
    /// Global completion budget override
    max_tokens: Option<u32>,
}

impl ProviderAdapter {
    pub fn new(catalog: Arc<ModelCatalog>) -> Self {
        Self {
            providers: HashMap::new(),
            catalog,
            retry: RetryPolicy::default(),
            max_tokens: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Register a provider under the tag catalog entries use.
    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.insert(name.into(), provider);
    }

    /// Get a specific provider by tag.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    /// Registered provider tags, sorted.
    pub fn providers(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn catalog(&self) -> &Arc<ModelCatalog> {
        &self.catalog
    }

    pub fn model(&self, model_id: &str) -> Option<ModelInfo> {
        self.catalog.get(model_id)
    }

    /// Whether `model_id` is in the catalog and its provider is registered.
    pub fn is_available(&self, model_id: &str) -> bool {
        self.catalog
            .get(model_id)
            .is_some_and(|m| self.providers.contains_key(&m.provider))
    }

    /// Stream a completion with the model's default completion budget.
    pub async fn stream(
        &self,
        cancel: &CancellationToken,
        model_id: &str,
        system: String,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
    ) -> mpsc::Receiver<ProviderEvent> {
        self.stream_with_limit(cancel, model_id, system, messages, tools, None)
            .await
    }

    /// Stream a completion, capping output at `max_tokens` when given.
    ///
    /// The receiver closes without a terminal event only when `cancel` fired.
    pub async fn stream_with_limit(
        &self,
        cancel: &CancellationToken,
        model_id: &str,
        system: String,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
        max_tokens: Option<u32>,
    ) -> mpsc::Receiver<ProviderEvent> {
        let Some(model) = self.catalog.get(model_id) else {
            return failed(ProviderError::ModelNotFound(model_id.to_string()));
        };
        let Some(provider) = self.get(&model.provider) else {
            return failed(ProviderError::NotConfigured(format!(
                "no '{}' provider is configured for model {model_id}",
                model.provider
            )));
        };

        let request = ProviderRequest {
            max_tokens: max_tokens
                .or(self.max_tokens)
                .unwrap_or(model.default_max_tokens),
            model,
            system,
            messages,
            tools,
        };

        let (tx, rx) = mpsc::channel(RELAY_BUFFER);
        tokio::spawn(relay(provider, request, self.retry, cancel.clone(), tx));
        rx
    }

    /// Model IDs each registered vendor reports, keyed by provider tag.
    pub async fn list_models(&self) -> BTreeMap<String, Result<Vec<String>, ProviderError>> {
        let mut result = BTreeMap::new();
        for (name, provider) in &self.providers {
            result.insert(name.clone(), provider.list_models().await);
        }
        result
    }

    /// Catalog entries whose wire model a reachable vendor does not list.
    ///
    /// Vendors that fail or list nothing are skipped rather than reported.
    pub async fn validate_catalog(&self) -> Vec<String> {
        let mut missing = Vec::new();
        for (name, listed) in self.list_models().await {
            let listed = match listed {
                Ok(models) if !models.is_empty() => models,
                Ok(_) => continue,
                Err(e) => {
                    warn!(provider = %name, error = %e, "Could not list models");
                    continue;
                }
            };
            for model in self.catalog.by_provider(&name) {
                if !listed.iter().any(|m| m == &model.api_model) {
                    warn!(provider = %name, model = %model.id, api_model = %model.api_model, "Catalog model not offered by provider");
                    missing.push(model.id);
                }
            }
        }
        missing.sort();
        missing
    }
}

const RELAY_BUFFER: usize = 64;

/// Open `request` and forward its events to `tx`, re-opening on transient
/// failures until the retry budget is spent.
async fn relay(
    provider: Arc<dyn Provider>,
    request: ProviderRequest,
    retry: RetryPolicy,
    cancel: CancellationToken,
    tx: mpsc::Sender<ProviderEvent>,
) {
    let mut attempt = 1;
    loop {
        debug!(provider = %provider.name(), model = %request.model.id, attempt, "Opening provider stream");
        let error = match provider.stream(request.clone(), cancel.clone()).await {
            Ok(events) => match forward(events, &tx, &cancel).await {
                Attempt::Finished => return,
                Attempt::Transient(error) => error,
            },
            Err(e) => e,
        };

        if cancel.is_cancelled() {
            return;
        }
        if !retry.should_retry(attempt, &error) {
            if error.is_retryable() {
                warn!(provider = %provider.name(), attempt, error = %error, "Provider retries exhausted");
            } else {
                warn!(provider = %provider.name(), error = %error, "Provider request failed");
            }
            let _ = tx
                .send(ProviderEvent::Error {
                    error,
                    retryable: false,
                })
                .await;
            return;
        }

        let delay = retry.delay(attempt, &error);
        info!(
            provider = %provider.name(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Retrying provider stream"
        );
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

enum Attempt {
    Finished,
    /// Retryable failure reported before any output was forwarded
    Transient(ProviderError),
}

/// Forward one attempt's events. Errors that get forwarded are final, so
/// they always leave here as non-retryable.
async fn forward(
    mut events: mpsc::Receiver<ProviderEvent>,
    tx: &mpsc::Sender<ProviderEvent>,
    cancel: &CancellationToken,
) -> Attempt {
    let mut produced = false;
    loop {
        let event = tokio::select! {
            biased;
            event = events.recv() => event,
            _ = cancel.cancelled() => {
                // Hand over what the vendor already buffered.
                while let Ok(event) = events.try_recv() {
                    if tx.try_send(event).is_err() {
                        break;
                    }
                }
                return Attempt::Finished;
            }
        };
        let Some(event) = event else {
            return Attempt::Finished;
        };
        let event = match event {
            ProviderEvent::Error {
                error,
                retryable: true,
            } if !produced => return Attempt::Transient(error),
            ProviderEvent::Error { error, .. } => ProviderEvent::Error {
                error,
                retryable: false,
            },
            warning @ ProviderEvent::Warning(_) => warning,
            other => {
                produced = true;
                other
            }
        };
        let terminal = event.is_terminal();
        if tx.send(event).await.is_err() || terminal {
            return Attempt::Finished;
        }
    }
}

/// A receiver holding exactly one non-retryable error.
fn failed(error: ProviderError) -> mpsc::Receiver<ProviderEvent> {
    let (tx, rx) = mpsc::channel(1);
    let _ = tx.try_send(ProviderEvent::Error {
        error,
        retryable: false,
    });
    rx
}

/// Build vendor clients for every enabled provider with credentials or a
/// custom endpoint, and register custom catalog models.
pub fn build_from_config(
    config: &codeloom_config::AppConfig,
    catalog: Arc<ModelCatalog>,
) -> Result<ProviderAdapter, ProviderError> {
    for model in &config.models {
        catalog.register(model.clone());
    }

    let settings = HttpSettings::from(&config.http);
    let mut adapter = ProviderAdapter::new(catalog)
        .with_retry(RetryPolicy::from(&config.http))
        .with_max_tokens(config.agents.max_tokens);

    let mut names: Vec<&String> = config.providers.keys().collect();
    names.sort();
    for name in names {
        let Some(provider_config) = config.provider(name) else {
            debug!(provider = %name, "Provider disabled");
            continue;
        };
        let api_key = provider_config.api_key.clone().unwrap_or_default();
        if api_key.is_empty() && provider_config.api_url.is_none() {
            debug!(provider = %name, "Provider has no API key, skipping");
            continue;
        }

        let provider: Arc<dyn Provider> = if name == "anthropic" {
            let mut p = AnthropicProvider::new(&api_key, settings)?;
            if let Some(url) = &provider_config.api_url {
                p = p.with_base_url(url);
            }
            Arc::new(p)
        } else {
            let base_url = provider_config
                .api_url
                .clone()
                .or_else(|| default_base_url(name).map(String::from))
                .ok_or_else(|| {
                    ProviderError::NotConfigured(format!("provider '{name}' needs an api_url"))
                })?;
            Arc::new(OpenAiCompatProvider::new(name, base_url, &api_key, settings)?)
        };

        info!(provider = %name, "Registered provider");
        adapter.register(name.clone(), provider);
    }

    Ok(adapter)
}

/// Get the default base URL for well-known OpenAI-compatible providers.
fn default_base_url(provider_name: &str) -> Option<&'static str> {
    Some(match provider_name {
        "openai" => "https://api.openai.com/v1",
        "openrouter" => "https://openrouter.ai/api/v1",
        "groq" => "https://api.groq.com/openai/v1",
        "deepseek" => "https://api.deepseek.com/v1",
        "ollama" => "http://localhost:11434/v1",
        "vllm" => "http://localhost:8000/v1",
        _ => return None,
    })
}
