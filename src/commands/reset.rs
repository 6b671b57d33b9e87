use anyhow::Result;

use crate::commands::CommandReport;
use crate::lens::paths::resolve_paths;
use crate::lens::reset::reset_analysis;

pub fn run() -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let mut report = CommandReport::new("reset");

    let summary = reset_analysis(&paths)?;
    report.detail(format!("results_removed={}", summary.results_removed));
    report.detail(format!("threads_unflagged={}", summary.threads_unflagged));
    report.detail(format!("sessions_cleared={}", summary.sessions_cleared));

    Ok(report)
}
