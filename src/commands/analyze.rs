use std::thread;
use std::time::Duration;

use anyhow::Result;

use crate::commands::CommandReport;
use crate::lens::analysis::{MOCK_SENTINEL, select_analyzer};
use crate::lens::batch::{BatchController, BatchOutcome, BatchRequest};
use crate::lens::config::{load_config, resolve_api_key};
use crate::lens::paths::resolve_paths;

#[derive(Debug, Clone)]
pub struct AnalyzeOptions {
    pub count: Option<usize>,
    pub mock: bool,
    pub api_key: Option<String>,
    pub session: Option<String>,
    pub filename: Option<String>,
}

/// Start a batch over unanalyzed threads and poll it to a terminal state.
pub fn run(opts: &AnalyzeOptions) -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let cfg = load_config()?;
    let mut report = CommandReport::new("analyze");

    let api_key = if opts.mock {
        Some(MOCK_SENTINEL.to_string())
    } else {
        resolve_api_key(opts.api_key.as_deref())
    };
    let analyzer = select_analyzer(api_key.as_deref(), &cfg.analysis)?;
    report.detail(format!("provider={}", analyzer.label()));

    let count = opts.count.unwrap_or(cfg.analysis.default_batch_threads);
    let request = BatchRequest {
        session_id: opts.session.clone(),
        filename: opts.filename.clone(),
        thread_count: count,
    };

    let controller = match BatchController::start(&paths, &cfg, analyzer, request) {
        Ok(controller) => controller,
        Err(err) => {
            report.issue(format!("could not start batch: {err}"));
            return Ok(report);
        }
    };

    let poll = Duration::from_millis(cfg.batch.poll_interval_ms);
    while controller.is_running() {
        thread::sleep(poll);
    }

    let snapshot = controller.snapshot();
    report.detail(format!(
        "analyzed {}/{} threads in {}s",
        snapshot.analyzed, snapshot.total, snapshot.elapsed_secs
    ));
    for line in &snapshot.log_tail {
        report.detail(format!("log: {line}"));
    }

    match controller.wait() {
        BatchOutcome::Completed => report.detail("batch completed"),
        BatchOutcome::NoThreadsAnalyzed => report.detail("no unanalyzed threads found"),
        BatchOutcome::Cancelled => report.issue("batch was cancelled"),
        BatchOutcome::Failed(reason) => report.issue(format!("batch failed: {reason}")),
    }

    Ok(report)
}
