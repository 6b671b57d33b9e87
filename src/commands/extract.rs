use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::commands::CommandReport;
use crate::lens::audit;
use crate::lens::extract::extract_threads;
use crate::lens::paths::resolve_paths;
use crate::lens::store;
use crate::lens::timeparse;

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub file: PathBuf,
    pub session: Option<String>,
}

/// Pull threads out of an exported chat file into a session directory,
/// then promote them into permanent storage.
pub fn run(opts: &ExtractOptions) -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let mut report = CommandReport::new("extract");

    if !opts.file.exists() {
        report.issue(format!("upload not found: {}", opts.file.display()));
        return Ok(report);
    }

    let session_id = opts
        .session
        .clone()
        .unwrap_or_else(|| format!("session_{}", timeparse::generate_timestamp()));
    let threads_dir = paths.session_threads_dir(&session_id);
    fs::create_dir_all(&threads_dir)
        .with_context(|| format!("create session dir {}", threads_dir.display()))?;

    // Keep a copy of the raw export next to the extracted data, so a session
    // can be re-run against the exact bytes it was built from.
    fs::create_dir_all(&paths.uploads_dir)
        .with_context(|| format!("create uploads dir {}", paths.uploads_dir.display()))?;
    let upload_name = opts
        .file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("upload_{}.json", timeparse::generate_timestamp()));
    let stored_upload = paths.uploads_dir.join(format!("{session_id}_{upload_name}"));
    fs::copy(&opts.file, &stored_upload)
        .with_context(|| format!("store upload {}", stored_upload.display()))?;

    let outcome = match extract_threads(&stored_upload, &threads_dir) {
        Ok(outcome) => outcome,
        Err(err) => {
            report.issue(format!("extraction failed: {err}"));
            return Ok(report);
        }
    };

    report.detail(format!("session={session_id}"));
    report.detail(format!("threads_found={}", outcome.thread_count));
    report.detail(format!("new_messages={}", outcome.new_message_count));

    let (added, total) = store::store_threads_permanently(&paths, &threads_dir)?;
    report.detail(format!("threads_stored={added}"));
    report.detail(format!("threads_total={total}"));

    audit::append_event(
        &paths,
        "extract",
        "done",
        &format!(
            "extracted {} threads ({} new messages) from {}",
            outcome.thread_count,
            outcome.new_message_count,
            opts.file.display()
        ),
    )?;

    Ok(report)
}
