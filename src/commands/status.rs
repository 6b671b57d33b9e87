use anyhow::Result;

use crate::commands::CommandReport;
use crate::lens::paths::resolve_paths;
use crate::lens::store;

pub fn run() -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let mut report = CommandReport::new("status");

    report.detail(format!("build={}", env!("BUILD_UUID")));
    report.detail(format!("lens_home={}", paths.lens_home.display()));
    report.detail(format!("threads_dir={}", paths.threads_dir.display()));
    report.detail(format!("results_dir={}", paths.results_dir.display()));
    report.detail(format!("logs_dir={}", paths.logs_dir.display()));

    let stats = store::get_analysis_stats(&paths)?;
    report.detail(format!(
        "threads: total={} analyzed={} unanalyzed={} ({}%)",
        stats.total, stats.analyzed, stats.unanalyzed, stats.percentage
    ));

    match store::get_latest_analysis(&paths)? {
        Some(combined) => report.detail(format!("latest_analysis={}", combined.metadata.id)),
        None => report.detail("latest_analysis=none"),
    }

    Ok(report)
}
