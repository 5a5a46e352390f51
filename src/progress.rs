//! Terminal progress for deployments

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use reconcile::{ItemOutcome, Phase, PlannedAction, ProgressCallback};

const TEMPLATE: &str = "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}";

/// Progress bar over every remote write of a deployment
pub struct DeployProgress {
    pb: ProgressBar,
}

impl DeployProgress {
    pub fn new(quiet: bool) -> Self {
        let pb = if quiet {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(0)
        };
        let style = ProgressStyle::default_bar()
            .template(TEMPLATE)
            .map_or_else(|_| ProgressStyle::default_bar(), |style| style.progress_chars("=>-"));
        pb.set_style(style);
        Self { pb }
    }

    pub fn finish(&self) {
        self.pb.finish_and_clear();
    }
}

impl ProgressCallback for DeployProgress {
    fn on_phase(&self, kind: &str, phase: Phase) {
        log::debug!("{kind}: {phase}");
        self.pb.set_message(format!("{kind}: {phase}"));
    }

    fn on_item_start(&self, _kind: &str, _id: &str, _action: PlannedAction) {
        self.pb.inc_length(1);
    }

    fn on_item_complete(&self, kind: &str, id: &str, outcome: &ItemOutcome) {
        if let ItemOutcome::Failed { stage, error } = outcome {
            self.pb
                .println(format!("{} {kind} {id}: {stage} failed: {error}", "✗".red()));
        }
        // Items settled without a remote call were never counted
        if self.pb.position() < self.pb.length().unwrap_or(0) {
            self.pb.inc(1);
        }
    }
}
