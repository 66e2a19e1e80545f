use indicatif::{HumanBytes, ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::coordinator::TransferResult;
use crate::planner::TransferPlan;
use crate::progress::{Eta, ProgressObserver, ProgressSnapshot};
use crate::utils::format_eta;

const BAR_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes:>12}/{total_bytes:<12} {msg} {prefix}";
const SPINNER_TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] {bytes:>12} {msg} {prefix}";

/// Renders snapshots as a single terminal progress bar on stderr.
pub struct ProgressDisplay {
    bar: ProgressBar,
}

impl ProgressDisplay {
    pub fn new() -> Self {
        // Draw to stderr at 5Hz even when redirected, so logs show progress.
        let bar = ProgressBar::with_draw_target(None, ProgressDrawTarget::stderr_with_hz(5));
        bar.set_style(style(SPINNER_TEMPLATE));
        bar.set_message("Probing");
        Self { bar }
    }
}

impl Default for ProgressDisplay {
    fn default() -> Self {
        Self::new()
    }
}

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}

pub fn describe(snapshot: &ProgressSnapshot) -> String {
    let eta = match snapshot.eta {
        Eta::Seconds(secs) => format_eta(secs),
        Eta::Unknown => "Calculating...".to_string(),
    };
    let speed = HumanBytes(snapshot.throughput_bytes_per_sec.max(0.0) as u64);
    match snapshot.percent {
        Some(percent) => format!("{:>6.2}% {:>10}/s ETA {}", percent, speed, eta),
        None => format!("{:>10}/s", speed),
    }
}

impl ProgressObserver for ProgressDisplay {
    fn on_plan(&self, plan: &TransferPlan) {
        if let Some(total) = plan.total_size {
            self.bar.set_length(total);
            self.bar.set_style(style(BAR_TEMPLATE));
        }
        self.bar.set_prefix(plan.file_name.clone());
        self.bar.set_message(format!("{} segment(s)", plan.segment_count()));
    }

    fn on_progress(&self, snapshot: &ProgressSnapshot) {
        self.bar.set_position(snapshot.total_downloaded);
        self.bar.set_message(describe(snapshot));
    }

    fn on_finish(&self, result: &TransferResult) {
        match result {
            TransferResult::Completed {
                output_path,
                skipped: true,
            } => self
                .bar
                .finish_with_message(format!("Skipped     {}", output_path.display())),
            TransferResult::Completed { output_path, .. } => self
                .bar
                .finish_with_message(format!("Completed   {}", output_path.display())),
            TransferResult::Failed(failure) => self.bar.abandon_with_message(format!(
                "Failed (segments {:?})",
                failure.failed_segments
            )),
        }
    }
}
