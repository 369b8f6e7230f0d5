use std::path::Path;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use shellgate_common::ShellgateConfig;
use tracing::*;

pub fn load_config(path: &Path) -> Result<ShellgateConfig> {
    let mut config: ShellgateConfig = Config::builder()
        .add_source(File::from(path))
        .add_source(Environment::with_prefix("SHELLGATE").separator("__"))
        .build()
        .with_context(|| format!("reading config from {}", path.display()))?
        .try_deserialize()
        .context("parsing config")?;

    config.paths_relative_to = path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    info!(path=%path.display(), "Using config");
    Ok(config)
}
