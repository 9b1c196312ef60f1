//! `codeloom config`: show, locate and initialize the configuration.

use anyhow::Context;
use codeloom_config::AppConfig;
use std::path::Path;

pub fn show(config: &AppConfig) -> anyhow::Result<()> {
    println!("{}", redacted_toml(config)?);
    Ok(())
}

pub fn path(config_path: &Path) {
    println!("{}", config_path.display());
}

/// Write the default configuration unless a file already exists.
pub fn init(config_path: &Path) -> anyhow::Result<()> {
    if config_path.exists() {
        anyhow::bail!("{} already exists", config_path.display());
    }
    if let Some(dir) = config_path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("could not create {}", dir.display()))?;
    }
    std::fs::write(config_path, AppConfig::default_toml())
        .with_context(|| format!("could not write {}", config_path.display()))?;
    println!("Wrote {}", config_path.display());
    Ok(())
}

/// The configuration as TOML with API keys masked.
pub fn redacted_toml(config: &AppConfig) -> anyhow::Result<String> {
    let mut config = config.clone();
    for provider in config.providers.values_mut() {
        if provider.api_key.as_deref().is_some_and(|k| !k.is_empty()) {
            provider.api_key = Some("********".into());
        }
    }
    Ok(toml::to_string_pretty(&config)?)
}
