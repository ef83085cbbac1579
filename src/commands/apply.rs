use anyhow::{Context as AnyhowContext, Result};
use colored::Colorize;
use declarative::{Action, ExecuteOptions, NodeStatus, ProgressCallback, RetryConfig};
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

use super::Stack;
use crate::Context;
use crate::backend::LocalBackend;
use crate::cli::ApplyArgs;
use crate::topology;
use crate::ui;

/// Progress bar over every node of the run
struct BarProgress {
    bar: ProgressBar,
}

impl ProgressCallback for BarProgress {
    fn on_wave_start(&mut self, index: usize, ids: &[String]) {
        self.bar
            .set_message(format!("wave {}: {}", index + 1, ids.join(", ")));
    }

    fn on_node_planned(&mut self, id: &str, action: Action) {
        if action.is_change() {
            self.bar
                .println(format!("  {} {id} ({action})", ui::action_symbol(action)));
        }
    }

    fn on_node_complete(&mut self, id: &str, status: &NodeStatus) {
        if let NodeStatus::Failed { reason } = status {
            self.bar
                .println(format!("  {} {id}: {}", ui::status_symbol(status), reason.red()));
        }
        self.bar.inc(1);
    }

    fn on_wave_complete(&mut self) {}
}

/// Converge the platform to the configuration.
///
/// Asks for confirmation when the plan has changes, unless `--yes`. A plan
/// without changes still runs so that drift found by refresh is repaired.
pub fn run(ctx: &Context, args: &ApplyArgs) -> Result<()> {
    let stack = Stack::load(ctx)?;
    let backend = LocalBackend::open(&stack.state_dir)?;

    let plan = declarative::plan(&stack.specs, &stack.variables, &stack.store)?;
    ui::display_plan(&plan);

    if plan.has_changes() && !args.yes && !confirm_proceed()? {
        println!();
        println!("  {} Aborted", "✗".red());
        return Ok(());
    }

    let opts = ExecuteOptions {
        jobs: args.jobs.max(1),
        lock_timeout: Duration::from_secs(args.lock_timeout),
        refresh: !args.no_refresh,
        retry: RetryConfig::default(),
    };

    let bar = if ctx.quiet {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(plan.changes.len() as u64)
    };
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .context("Invalid progress template")?
            .progress_chars("=>-"),
    );
    let mut progress = BarProgress { bar };

    let report = declarative::apply(
        &stack.specs,
        &stack.variables,
        &stack.store,
        &backend,
        &opts,
        &mut progress,
    )?;
    progress.bar.finish_and_clear();

    ui::display_report(&report);

    if !report.is_success() {
        anyhow::bail!(
            "{} resource(s) failed, {} skipped",
            report.summary.failed,
            report.summary.skipped
        );
    }

    ui::display_outputs(&topology::outputs(&stack.store)?);
    Ok(())
}

/// Confirm with user
fn confirm_proceed() -> Result<bool> {
    let confirmed = Confirm::new()
        .with_prompt("Apply these changes?")
        .default(false)
        .interact()
        .context("Failed to read confirmation")?;

    Ok(confirmed)
}
