use anyhow::Result;
use std::fs;

use crate::Context;
use crate::cli::ConfigCommand;
use crate::config::{Config, config_path};
use crate::ui;

pub fn run(ctx: &Context, cmd: ConfigCommand) -> Result<()> {
    match cmd {
        ConfigCommand::Show => show(ctx),
    }
}

fn show(ctx: &Context) -> Result<()> {
    ui::header("Configuration");

    let path = config_path(ctx.config.as_deref())?;
    println!();
    ui::kv("Config file", &path.display().to_string());

    if !path.exists() {
        println!();
        ui::warn("Config file not found");
        ui::dim("Create it with a [directory] table and one [[groups]] entry per group.");
        return Ok(());
    }

    let config = Config::load(&path)?;
    ui::kv("Snapshot", &config.snapshot_path().display().to_string());
    ui::kv("Customer", &config.directory.customer_id);
    if let Some(admin) = &config.directory.impersonated_user_email {
        ui::kv("Impersonating", admin);
    }
    ui::kv("Scopes", &config.oauth_scopes().join(", "));
    ui::kv("Retry timeout", &format!("{} min", config.retry.timeout_minutes));
    ui::kv("Groups", &config.groups.len().to_string());

    ui::section("Contents");
    for line in fs::read_to_string(&path)?.lines() {
        ui::dim(line);
    }
    Ok(())
}
