use anyhow::Result;

use crate::commands::CommandReport;
use crate::lens::paths::resolve_paths;
use crate::lens::store;

pub fn run(thread_id: &str) -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let mut report = CommandReport::new("thread");

    let thread = match store::get_thread_content(&paths, thread_id) {
        Ok(thread) => thread,
        Err(err) => {
            report.issue(err.to_string());
            return Ok(report);
        }
    };

    report.detail(format!("thread={}", thread.id));
    report.detail(format!("messages={}", thread.meta.message_count));
    if !thread.meta.evidence_for.is_empty() {
        report.detail(format!("evidence_for={}", thread.meta.evidence_for.join("; ")));
    }
    for line in thread.content.lines() {
        report.detail(line.to_string());
    }

    Ok(report)
}
