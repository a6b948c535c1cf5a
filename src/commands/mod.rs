pub mod apply;
pub mod config;
pub mod plan;

use crate::Context;
use crate::config::{self as settings, Config};
use anyhow::{Context as _, Result};
use directory::SnapshotDirectory;
use log::info;

/// Load the config and open the snapshot it points at.
pub(crate) fn load(ctx: &Context) -> Result<(Config, SnapshotDirectory)> {
    let path = settings::config_path(ctx.config.as_deref())?;
    let config = Config::load(&path)?;
    info!("Using config {}", path.display());

    if let Some(admin) = &config.directory.impersonated_user_email {
        info!("Acting as {admin} in customer {}", config.directory.customer_id);
    }
    info!("Scopes: {}", config.oauth_scopes().join(", "));

    let snapshot_path = config.snapshot_path();
    let snapshot = SnapshotDirectory::open(&snapshot_path)
        .with_context(|| format!("Could not open snapshot {}", snapshot_path.display()))?;
    Ok((config, snapshot))
}
