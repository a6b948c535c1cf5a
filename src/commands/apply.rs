use anyhow::{Context as _, Result};
use colored::Colorize;
use directory::SnapshotDirectory;
use reconcile::{
    GroupAction, GroupDeclaration, ReconcileOptions, ReconcileSummary, RetryPolicy, SyncReport,
    Synchronizer,
};

use crate::Context;
use crate::cli::ApplyArgs;
use crate::ui::{self, TerminalConfirm, TerminalProgress};

pub fn run(ctx: &Context, args: &ApplyArgs) -> Result<()> {
    let (config, mut snapshot) = super::load(ctx)?;
    let declarations = config.declarations(args.group.as_deref())?;
    let policy = RetryPolicy::new(config.retry_config());
    let options = ReconcileOptions {
        dry_run: args.dry_run,
        ..ReconcileOptions::default()
    };

    if args.dry_run && !ctx.quiet {
        ui::warn("Dry run: no changes will be written");
    }

    let outcome = apply_all(ctx, args, &snapshot, &policy, options, &declarations);

    // Writes that succeeded before a failure are kept.
    if !args.dry_run {
        let path = snapshot.path().to_path_buf();
        let saved = snapshot
            .save()
            .with_context(|| format!("Failed to save snapshot {}", path.display()));
        if let Err(err) = saved {
            if outcome.is_err() {
                ui::error(&format!("{err:#}"));
            } else {
                return Err(err);
            }
        }
    }

    let reports = outcome?;
    if !ctx.quiet {
        print_summary(&reports, args.dry_run);
    }
    Ok(())
}

fn apply_all(
    ctx: &Context,
    args: &ApplyArgs,
    snapshot: &SnapshotDirectory,
    policy: &RetryPolicy,
    options: ReconcileOptions,
    declarations: &[GroupDeclaration],
) -> Result<Vec<SyncReport>> {
    let sync = Synchronizer::new(snapshot, policy).with_options(options);
    let mut confirm = TerminalConfirm::new(args.yes);
    let mut progress = TerminalProgress::new(ctx.quiet);
    let total = declarations.len();

    let mut reports = Vec::with_capacity(total);
    for (i, decl) in declarations.iter().enumerate() {
        if !ctx.quiet {
            ui::step(i + 1, total, &decl.spec.email);
        }
        let report = sync
            .apply(decl, &mut progress, &mut confirm)
            .with_context(|| format!("Failed to converge {}", decl.spec.email))?;

        if !ctx.quiet {
            describe(&report);
        }
        reports.push(report);
    }
    Ok(reports)
}

fn describe(report: &SyncReport) {
    if report.declined {
        ui::warn("Skipped");
        return;
    }
    match &report.action {
        GroupAction::Create => ui::success("Group created"),
        GroupAction::Update { changes } => ui::success(&format!("Group updated: {}", changes.join(", "))),
        GroupAction::NoChange if report.summary.total() == 0 => ui::dim("Already up to date"),
        GroupAction::NoChange => {}
    }
}

fn print_summary(reports: &[SyncReport], dry_run: bool) {
    let mut totals = ReconcileSummary::default();
    for report in reports {
        totals.merge(&report.summary);
    }
    let declined = reports.iter().filter(|r| r.declined).count();
    let groups_changed = reports
        .iter()
        .filter(|r| !r.declined && r.action.is_change())
        .count();

    println!();
    if dry_run {
        println!("  {} Dry run complete", "✓".green().bold());
    } else {
        println!("  {} Directory converged", "✓".green().bold());
    }
    if groups_changed > 0 {
        println!("    • {groups_changed} groups created or updated");
    }
    ui::print_summary(&totals);
    if declined > 0 {
        println!("    • {declined} {} declined", "groups".yellow());
    }
}
