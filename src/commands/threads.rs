use anyhow::Result;

use crate::commands::CommandReport;
use crate::lens::extract::time_value_as_string;
use crate::lens::paths::resolve_paths;
use crate::lens::store;

#[derive(Debug, Clone)]
pub struct ThreadsOptions {
    pub page: usize,
    pub per_page: usize,
}

pub fn run(opts: &ThreadsOptions) -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let mut report = CommandReport::new("threads");

    let page = store::get_all_threads(&paths, opts.page, opts.per_page)?;
    report.detail(format!(
        "page {}/{} ({} threads total)",
        page.page,
        page.total_pages.max(1),
        page.total
    ));

    for thread in &page.threads {
        let flag = if thread.analyzed { "analyzed" } else { "pending" };
        let last = time_value_as_string(Some(&thread.last_message_time));
        report.detail(format!(
            "{}  messages={} last={} [{}]",
            thread.id, thread.message_count, last, flag
        ));
    }

    if page.threads.is_empty() {
        report.detail("no threads on this page");
    }

    Ok(report)
}
