use colored::{ColoredString, Colorize};
use declarative::{Action, NodeStatus, Plan, ResourceState, RunReport, Status};

use crate::topology::Outputs;

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
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

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

/// Colored symbol for an action
pub fn action_symbol(action: Action) -> ColoredString {
    match action {
        Action::Create => action.symbol().green(),
        Action::Update => action.symbol().yellow(),
        Action::Replace => action.symbol().magenta(),
        Action::Destroy => action.symbol().red(),
        Action::NoOp => action.symbol().dimmed(),
    }
}

/// Symbol for a node's final status
pub fn status_symbol(status: &NodeStatus) -> ColoredString {
    match status {
        NodeStatus::Applied { action } if action.is_change() => "✓".green(),
        NodeStatus::Applied { .. } => "○".dimmed(),
        NodeStatus::Destroyed => "✓".green(),
        NodeStatus::Skipped { .. } => "⊘".yellow(),
        NodeStatus::Failed { .. } => "✗".red(),
    }
}

// ============================================================================
// Plan
// ============================================================================

/// Show what a run would do
pub fn display_plan(plan: &Plan) {
    header("Plan");

    if !plan.resolution.excluded.is_empty() {
        dim(&format!("not included: {}", plan.resolution.excluded.join(", ")));
    }

    for change in &plan.changes {
        if !change.action.is_change() {
            continue;
        }
        println!(
            "  {} {} {}",
            action_symbol(change.action),
            change.id.bold(),
            format!("({}, {})", change.kind, change.action).dimmed()
        );
        for field in &change.changed {
            if change.unknown.contains(field) {
                dim(&format!("    {field} = (known after apply)"));
            } else {
                dim(&format!("    {field}"));
            }
        }
    }

    let summary = plan.summary();
    println!();
    if summary.total_changes() == 0 {
        success("No changes. Infrastructure matches the configuration.");
    } else {
        println!(
            "  {} to create, {} to update, {} to replace, {} to destroy, {} unchanged",
            summary.create.to_string().green(),
            summary.update.to_string().yellow(),
            summary.replace.to_string().magenta(),
            summary.destroy.to_string().red(),
            summary.unchanged
        );
    }
}

// ============================================================================
// Run report
// ============================================================================

/// Print the outcome of a run
pub fn display_report(report: &RunReport) {
    let summary = &report.summary;

    println!();
    if report.is_success() {
        println!("  {} Apply complete!", "✓".green().bold());
    } else {
        println!("  {} Apply finished with errors", "⚠".yellow().bold());
    }

    if summary.created > 0 {
        println!("    • {} resources created", summary.created);
    }
    if summary.updated > 0 {
        println!("    • {} resources updated", summary.updated);
    }
    if summary.replaced > 0 {
        println!("    • {} resources replaced", summary.replaced);
    }
    if summary.destroyed > 0 {
        println!("    • {} resources destroyed", summary.destroyed);
    }
    if summary.skipped > 0 {
        println!("    • {} resources skipped", summary.skipped);
    }
    if summary.failed > 0 {
        println!("    • {} {} failed", summary.failed, "resources".red());
    }

    for node in &report.nodes {
        if let NodeStatus::Skipped { reason } = &node.status {
            dim(&format!("{} skipped: {reason}", node.id));
        }
    }
    for error in &report.errors {
        self::error(&error.to_string());
    }
}

/// Print stack outputs
pub fn display_outputs(outputs: &Outputs) {
    header("Outputs");
    kv("vm_id", outputs.vm_id.as_deref().unwrap_or("-"));
    kv(
        "private_ip_address",
        outputs.private_ip_address.as_deref().unwrap_or("-"),
    );
    kv(
        "public_ip_address",
        outputs.public_ip_address.as_deref().unwrap_or("(none)"),
    );
}

/// One line per state record
pub fn display_state(records: &[ResourceState]) {
    header("State");
    if records.is_empty() {
        info("No resources recorded.");
        return;
    }
    for record in records {
        let status = match record.status {
            Status::Applied => "applied".green(),
            Status::Tainted => "tainted".magenta(),
            Status::Absent => "absent".dimmed(),
        };
        println!(
            "  {} {} {}",
            record.id.bold(),
            format!("({})", record.kind).dimmed(),
            status
        );
        if let Some(backend_id) = &record.backend_id {
            dim(&format!("  {backend_id}"));
        }
        dim(&format!("  updated {}", record.updated_at.format("%Y-%m-%d %H:%M:%S UTC")));
    }
}
