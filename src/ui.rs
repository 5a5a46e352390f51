use colored::{ColoredString, Colorize};
use reconcile::{DeploymentSummary, ItemOutcome, KindStatus, PlannedAction, ReconciliationReport};

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

/// Marker and label for an item outcome
fn outcome_marker(outcome: &ItemOutcome) -> (ColoredString, String) {
    match outcome {
        ItemOutcome::Created => ("+".green(), "created".to_string()),
        ItemOutcome::Updated => ("~".yellow(), "updated".to_string()),
        ItemOutcome::Replaced => ("±".yellow(), "replaced".to_string()),
        ItemOutcome::Deleted => ("-".red(), "deleted".to_string()),
        ItemOutcome::Unchanged => ("=".dimmed(), "unchanged".to_string()),
        ItemOutcome::Planned { action } => {
            let marker = match action {
                PlannedAction::Create => "+".green(),
                PlannedAction::Update => "~".yellow(),
                PlannedAction::Replace => "±".yellow(),
                PlannedAction::Delete => "-".red(),
            };
            (marker, format!("would {action}"))
        }
        ItemOutcome::Skipped { reason } => ("○".dimmed(), format!("skipped: {reason}")),
        ItemOutcome::Failed { stage, error } => ("✗".red(), format!("{stage} failed: {error}")),
    }
}

/// Print one kind's report; unchanged items only show up in verbose mode
pub fn report(report: &ReconciliationReport, verbose: bool) {
    section(&report.kind);
    for (id, outcome) in &report.outcomes {
        if matches!(outcome, ItemOutcome::Unchanged) && !verbose {
            continue;
        }
        let (marker, label) = outcome_marker(outcome);
        println!("  {marker} {id} {}", label.dimmed());
    }
    for duplicate in &report.duplicates {
        println!("  {} {duplicate} {}", "⚠".yellow(), "declared more than once".dimmed());
    }
    for diff in &report.diffs {
        println!();
        kv("diff", &diff.id);
        for line in diff.diff.lines() {
            let line = match line.chars().next() {
                Some('+') => line.green(),
                Some('-') => line.red(),
                _ => line.normal(),
            };
            println!("    {line}");
        }
    }
    dim(&report.summary().to_string());
}

/// Print every kind of a deployment followed by the totals
pub fn summary(summary: &DeploymentSummary, verbose: bool) {
    for run in &summary.runs {
        match &run.status {
            KindStatus::Completed(r) => report(r, verbose),
            KindStatus::Failed(e) => {
                section(run.kind);
                error(&format!("{e}"));
            }
            KindStatus::Skipped(reason) => {
                section(run.kind);
                dim(&format!("skipped: {reason}"));
            }
        }
    }

    header("Summary");
    println!("  {}", summary.totals());
    if summary.deadline_exceeded() {
        warn("Deadline exceeded; some resources were not dispatched");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reconcile::Stage;

    #[test]
    fn test_outcome_labels() {
        let (_, label) = outcome_marker(&ItemOutcome::Planned {
            action: PlannedAction::Replace,
        });
        assert_eq!(label, "would replace");

        let (_, label) = outcome_marker(&ItemOutcome::Failed {
            stage: Stage::Create,
            error: "conflict".to_string(),
        });
        assert_eq!(label, "create failed: conflict");
    }
}
