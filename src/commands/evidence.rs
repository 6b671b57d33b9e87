use anyhow::Result;

use crate::commands::CommandReport;
use crate::lens::paths::resolve_paths;
use crate::lens::store;

pub fn run(insight: &str) -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let mut report = CommandReport::new("evidence");

    let threads = store::get_evidence_for_insight(&paths, insight)?;
    if threads.is_empty() {
        report.detail(format!("no stored threads are evidence for: {insight}"));
        return Ok(report);
    }

    report.detail(format!("{} supporting thread(s)", threads.len()));
    for thread in &threads {
        report.detail(format!("--- {} ---", thread.id));
        for line in thread.content.lines().take(10) {
            report.detail(line.to_string());
        }
    }

    Ok(report)
}
