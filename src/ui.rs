use colored::Colorize;
use reconcile::{
    ConfirmCallback, OpOutcome, PlanSummary, PlannedOp, ProgressCallback, ReconcileSummary,
};
use std::io;

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print a dim/muted message
pub fn dim(msg: &str) {
    println!("  {}", msg.dimmed());
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Print a section header
pub fn section(title: &str) {
    println!();
    println!("{}", title.cyan().bold());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

/// Print a step indicator
pub fn step(num: usize, total: usize, msg: &str) {
    println!("{} {}", format!("[{num}/{total}]").blue().bold(), msg);
}

/// Colored marker for a planned operation
pub fn op_symbol(op: &PlannedOp) -> colored::ColoredString {
    match op {
        PlannedOp::Delete { .. } => "-".red(),
        PlannedOp::PatchRole { .. } => "~".yellow(),
        PlannedOp::Upsert { .. } => "+".green(),
    }
}

/// One-line description of a plan summary, e.g. "1 delete, 2 upserts"
pub fn plan_counts(summary: &PlanSummary) -> String {
    let mut parts = Vec::new();
    for (count, noun) in [
        (summary.deletes, "delete"),
        (summary.patches, "role change"),
        (summary.upserts, "upsert"),
    ] {
        if count > 0 {
            parts.push(format!("{count} {noun}{}", if count == 1 { "" } else { "s" }));
        }
    }
    if parts.is_empty() {
        "no member changes".to_string()
    } else {
        parts.join(", ")
    }
}

/// Print the totals of a reconciliation run
pub fn print_summary(summary: &ReconcileSummary) {
    for (count, label) in [
        (summary.removed, "members removed"),
        (summary.role_changed, "roles changed"),
        (summary.inserted, "members added"),
        (summary.updated, "members rewritten"),
        (summary.skipped, "operations skipped"),
    ] {
        if count > 0 {
            println!("    • {count} {label}");
        }
    }
}

// ============================================================================
// Callbacks
// ============================================================================

/// Asks on the terminal before writes, unless `--yes` was given.
pub struct TerminalConfirm {
    assume_yes: bool,
}

impl TerminalConfirm {
    pub const fn new(assume_yes: bool) -> Self {
        Self { assume_yes }
    }
}

impl ConfirmCallback for TerminalConfirm {
    fn confirm(&mut self, prompt: &str) -> io::Result<bool> {
        if self.assume_yes {
            return Ok(true);
        }
        dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(true)
            .interact()
            .map_err(|err| io::Error::other(err.to_string()))
    }
}

/// Prints each operation as it completes.
pub struct TerminalProgress {
    quiet: bool,
}

impl TerminalProgress {
    pub const fn new(quiet: bool) -> Self {
        Self { quiet }
    }
}

impl ProgressCallback for TerminalProgress {
    fn on_plan(&mut self, group: &str, summary: &PlanSummary) {
        if !self.quiet {
            info(&format!("{group}: {}", plan_counts(summary)));
        }
    }

    fn on_op_start(&mut self, _group: &str, op: &PlannedOp) {
        log::debug!("Sending {op}");
    }

    fn on_op_complete(&mut self, _group: &str, op: &PlannedOp, outcome: &OpOutcome) {
        if self.quiet {
            return;
        }
        let detail = match outcome {
            OpOutcome::Removed => "removed".to_string(),
            OpOutcome::RoleChanged => "role changed".to_string(),
            OpOutcome::Inserted => "added".to_string(),
            OpOutcome::Updated => "rewritten".to_string(),
            OpOutcome::Skipped { reason } => format!("skipped ({reason})"),
        };
        println!("    {} {:<40} {}", op_symbol(op), op.identity().as_str(), detail.dimmed());
    }
}
