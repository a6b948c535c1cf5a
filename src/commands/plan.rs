use anyhow::{Context as _, Result};
use chrono::Local;
use colored::Colorize;
use reconcile::{GroupAction, GroupPlan, PlanSummary, RetryPolicy, Synchronizer};
use serde::Serialize;

use crate::Context;
use crate::ui;

pub fn run(ctx: &Context, group: Option<&str>, json: bool) -> Result<()> {
    let (config, snapshot) = super::load(ctx)?;
    let declarations = config.declarations(group)?;
    let policy = RetryPolicy::new(config.retry_config());
    let sync = Synchronizer::new(&snapshot, &policy);

    let plans = declarations
        .iter()
        .map(|decl| {
            sync.plan(decl)
                .with_context(|| format!("Failed to plan {}", decl.spec.email))
        })
        .collect::<Result<Vec<_>>>()?;

    if json {
        let rows: Vec<PlanRow<'_>> = plans.iter().map(PlanRow::from).collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    ui::header("Plan");
    let saved = snapshot.saved_at().map_or_else(
        || "never saved".to_string(),
        |at| format!("saved {}", at.with_timezone(&Local).format("%Y-%m-%d %H:%M")),
    );
    ui::kv("Snapshot", &format!("{} ({saved})", snapshot.path().display()));

    display_plans(&plans, ctx.verbose > 0);
    Ok(())
}

/// Machine-readable form of a group plan
#[derive(Debug, Serialize)]
struct PlanRow<'a> {
    group: &'a str,
    action: &'static str,
    changes: &'a [String],
    members: PlanSummary,
    operations: Vec<String>,
}

impl<'a> From<&'a GroupPlan> for PlanRow<'a> {
    fn from(plan: &'a GroupPlan) -> Self {
        let (action, changes): (&'static str, &'a [String]) = match &plan.action {
            GroupAction::Create => ("create", &[]),
            GroupAction::Update { changes } => ("update", changes.as_slice()),
            GroupAction::NoChange => ("none", &[]),
        };
        Self {
            group: &plan.email,
            action,
            changes,
            members: plan.member_summary(),
            operations: plan.members.iter().map(ToString::to_string).collect(),
        }
    }
}

/// Display group plans, skipping unchanged groups unless `show_unchanged`
pub fn display_plans(plans: &[GroupPlan], show_unchanged: bool) {
    let changed = plans.iter().filter(|p| p.has_changes()).count();
    for plan in plans {
        if !plan.has_changes() && !show_unchanged {
            continue;
        }
        ui::section(&plan.email);

        match &plan.action {
            GroupAction::Create => println!("  {} create group", "+".green()),
            GroupAction::Update { changes } => {
                for change in changes {
                    println!("  {} {}", "~".yellow(), change);
                }
            }
            GroupAction::NoChange => ui::dim("group up to date"),
        }

        for op in &plan.members {
            println!("  {} {}", ui::op_symbol(op), op.to_string().dimmed());
        }
        ui::dim(&ui::plan_counts(&plan.member_summary()));
    }

    println!();
    if changed == 0 {
        ui::success("No changes needed");
    } else {
        ui::info(&format!(
            "{} of {} group(s) need changes. Run 'dirsync apply' to converge.",
            changed.to_string().bold(),
            plans.len()
        ));
    }
}
