use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::lens::audit;
use crate::lens::paths::LensPaths;
use crate::lens::store::{self, AnalysisHistory};
use crate::lens::timeparse;

#[derive(Debug, Default, Serialize)]
pub struct ResetSummary {
    pub results_removed: usize,
    pub threads_unflagged: usize,
    pub sessions_cleared: usize,
}

fn clear_dir(dir: &Path) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut removed = 0usize;
    for entry in fs::read_dir(dir).with_context(|| format!("list {}", dir.display()))? {
        let path = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path).with_context(|| format!("remove {}", path.display()))?;
        } else {
            fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
        }
        removed += 1;
    }
    Ok(removed)
}

/// Wipe all analysis state while keeping the stored threads: saved result
/// files and history go, every thread is un-flagged (the index is backed up
/// first), and session temp dirs are cleared. The next batch starts from a
/// clean slate over the same thread corpus.
pub fn reset_analysis(paths: &LensPaths) -> Result<ResetSummary> {
    let mut summary = ResetSummary::default();

    summary.results_removed = clear_dir(&paths.results_dir)?;

    let index_path = paths.thread_index_file();
    if index_path.exists() {
        let backup = index_path.with_extension("json.backup");
        fs::copy(&index_path, &backup)
            .with_context(|| format!("back up index to {}", backup.display()))?;

        let mut index = store::load_index(paths)?;
        for entry in index.threads.iter_mut() {
            if entry.analyzed {
                entry.analyzed = false;
                entry.analyzed_date = None;
                entry.evidence_for.clear();
                summary.threads_unflagged += 1;
            }
        }
        index.analyzed_count = 0;
        index.last_updated = timeparse::now_iso();
        store::write_json_atomic(&index_path, &serde_json::to_value(&index)?)
            .with_context(|| format!("rewrite index {}", index_path.display()))?;
    }

    if paths.analysis_history_file().exists() {
        let fresh = AnalysisHistory {
            last_updated: timeparse::now_iso(),
            ..AnalysisHistory::default()
        };
        store::write_json_atomic(
            &paths.analysis_history_file(),
            &serde_json::to_value(&fresh)?,
        )
        .context("rewrite analysis history")?;
    }

    summary.sessions_cleared = clear_dir(&paths.sessions_dir)?;

    audit::append_event(
        paths,
        "reset",
        "done",
        &format!(
            "reset: {} results removed, {} threads unflagged, {} sessions cleared",
            summary.results_removed, summary.threads_unflagged, summary.sessions_cleared
        ),
    )?;
    Ok(summary)
}
