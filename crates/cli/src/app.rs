//! Wiring: config → store → providers → tools → orchestrator.

use anyhow::Context;
use codeloom_agent::{Orchestrator, OrchestratorConfig};
use codeloom_config::AppConfig;
use codeloom_core::event::Broker;
use codeloom_core::model::ModelCatalog;
use codeloom_core::store::Store;
use codeloom_security::Workspace;
use codeloom_security::permission::PermissionGate;
use codeloom_store::{SqliteStore, StoreEvents};
use codeloom_tools::{PublishedDiagnostics, ToolEnv, builtin_registry};
use std::sync::Arc;
use tracing::{debug, info};

/// Everything a command needs.
pub struct App {
    pub config: AppConfig,
    pub store: Arc<SqliteStore>,
    pub orchestrator: Orchestrator,
}

impl App {
    pub async fn build(config: AppConfig) -> anyhow::Result<Self> {
        let workspace_root = config.workspace_root();
        let workspace = Workspace::new(&workspace_root)
            .with_context(|| format!("invalid workspace {}", workspace_root.display()))?;

        let data_dir = config.data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("could not create data directory {}", data_dir.display()))?;
        let database = config.database_path();
        let store = Arc::new(
            SqliteStore::new(&format!("sqlite://{}", database.display()), StoreEvents::new())
                .await
                .with_context(|| format!("could not open {}", database.display()))?,
        );
        debug!(path = %database.display(), "Store opened");

        let catalog = Arc::new(ModelCatalog::with_defaults());
        let adapter = codeloom_providers::build_from_config(&config, catalog)
            .context("could not set up providers")?;

        let env = Arc::new(ToolEnv::new(
            workspace,
            Arc::clone(&store) as Arc<dyn Store>,
            config.tools.clone(),
        ));
        // No language server is attached; diagnostics stay empty.
        let tools = builtin_registry(env, Arc::new(PublishedDiagnostics::new()))
            .context("could not set up tools")?;

        let gate = Arc::new(PermissionGate::new(Broker::new()));
        let orchestrator = Orchestrator::new(
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::new(adapter),
            gate,
            tools,
            OrchestratorConfig::from(&config),
        );
        info!(workspace = %workspace_root.display(), "codeloom ready");

        Ok(Self {
            config,
            store,
            orchestrator,
        })
    }
}
