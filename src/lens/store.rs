use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::NamedTempFile;

use crate::error::LensError;
use crate::lens::extract::time_value_as_string;
use crate::lens::paths::LensPaths;
use crate::lens::schema::CombinedAnalysis;
use crate::lens::timeparse;

pub type EvidenceMap = BTreeMap<String, Vec<String>>;

/// One row of the durable thread index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadIndexEntry {
    pub id: String,
    pub message_count: usize,
    pub first_message_time: Value,
    pub last_message_time: Value,
    pub preview: String,
    pub analyzed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub added_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analyzed_date: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub evidence_for: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadIndex {
    pub threads: Vec<ThreadIndexEntry>,
    pub total_count: usize,
    pub analyzed_count: usize,
    pub last_updated: String,
}

impl ThreadIndex {
    fn fresh() -> Self {
        Self {
            last_updated: timeparse::now_iso(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryEntry {
    pub id: String,
    pub timestamp: u64,
    pub date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub thread_count: usize,
    pub thread_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisHistory {
    pub analyses: Vec<HistoryEntry>,
    pub latest: Option<HistoryEntry>,
    pub last_updated: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadPage {
    pub threads: Vec<ThreadIndexEntry>,
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
    pub total_pages: usize,
}

/// A thread pulled out of permanent storage: its transcript plus whatever
/// structured data and index metadata exist for it.
#[derive(Debug, Clone)]
pub struct ThreadContent {
    pub id: String,
    pub content: String,
    pub data: Value,
    pub meta: ThreadIndexEntry,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct AnalysisStats {
    pub total: usize,
    pub analyzed: usize,
    pub unanalyzed: usize,
    pub percentage: f64,
}

/// Write a JSON value through a temp file in the target directory, then
/// rename into place. A crash mid-write leaves the old file intact.
pub(crate) fn write_json_atomic(path: &Path, value: &Value) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).with_context(|| format!("create dir {}", dir.display()))?;

    let tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("create temp file in {}", dir.display()))?;
    serde_json::to_writer_pretty(&tmp, value)
        .with_context(|| format!("serialize {}", path.display()))?;
    tmp.persist(path)
        .with_context(|| format!("persist {}", path.display()))?;
    Ok(())
}

fn write_index(paths: &LensPaths, index: &ThreadIndex) -> Result<()> {
    write_json_atomic(&paths.thread_index_file(), &serde_json::to_value(index)?)
}

fn write_history(paths: &LensPaths, history: &AnalysisHistory) -> Result<()> {
    write_json_atomic(
        &paths.analysis_history_file(),
        &serde_json::to_value(history)?,
    )
}

/// Create the storage directories and empty index/history files if absent.
pub fn initialize_storage(paths: &LensPaths) -> Result<()> {
    for dir in [&paths.threads_dir, &paths.data_dir, &paths.results_dir] {
        fs::create_dir_all(dir).with_context(|| format!("create dir {}", dir.display()))?;
    }
    if !paths.thread_index_file().exists() {
        write_index(paths, &ThreadIndex::fresh())?;
    }
    if !paths.analysis_history_file().exists() {
        write_history(paths, &AnalysisHistory {
            last_updated: timeparse::now_iso(),
            ..AnalysisHistory::default()
        })?;
    }
    Ok(())
}

/// Load the thread index, recovering from corruption instead of failing: the
/// bad file is kept as a `.bak.{epoch}` copy and a best-effort index is
/// rebuilt by scanning the stored transcript files. Analyzed flags are lost
/// in recovery; counts restart from zero analyzed.
pub fn load_index(paths: &LensPaths) -> Result<ThreadIndex> {
    initialize_storage(paths)?;
    let index_path = paths.thread_index_file();

    let content = fs::read_to_string(&index_path)
        .with_context(|| format!("read index {}", index_path.display()))?;
    match serde_json::from_str::<ThreadIndex>(&content) {
        Ok(index) => Ok(index),
        Err(_) => {
            let stamp = timeparse::now_epoch_secs().unwrap_or(0);
            let backup = index_path.with_extension(format!("json.bak.{stamp}"));
            let _ = fs::copy(&index_path, &backup);
            let index = rebuild_index_from_disk(paths);
            write_index(paths, &index)?;
            Ok(index)
        }
    }
}

fn rebuild_index_from_disk(paths: &LensPaths) -> ThreadIndex {
    let mut index = ThreadIndex::fresh();
    let Ok(entries) = fs::read_dir(&paths.threads_dir) else {
        return index;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("txt") {
            continue;
        }
        let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        index.threads.push(ThreadIndexEntry {
            id: id.to_string(),
            added_date: Some(timeparse::now_iso()),
            ..ThreadIndexEntry::default()
        });
    }
    index.threads.sort_by(|a, b| a.id.cmp(&b.id));
    index.total_count = index.threads.len();
    index
}

/// Move a session's extracted threads into permanent storage, appending new
/// entries to the index. Threads already indexed are left untouched. Returns
/// (threads added, total threads).
pub fn store_threads_permanently(
    paths: &LensPaths,
    session_threads_dir: &Path,
) -> Result<(usize, usize)> {
    let mut index = load_index(paths)?;

    if !session_threads_dir.exists() {
        return Ok((0, index.total_count));
    }

    let candidates = session_thread_candidates(session_threads_dir);
    let mut added = 0usize;

    for meta in candidates {
        if index.threads.iter().any(|t| t.id == meta.id) {
            continue;
        }
        let json_src = session_threads_dir.join(format!("{}.json", meta.id));
        let txt_src = session_threads_dir.join(format!("{}.txt", meta.id));
        if !json_src.exists() || !txt_src.exists() {
            continue;
        }

        fs::copy(&json_src, paths.threads_dir.join(format!("{}.json", meta.id)))
            .with_context(|| format!("copy thread json for {}", meta.id))?;
        fs::copy(&txt_src, paths.threads_dir.join(format!("{}.txt", meta.id)))
            .with_context(|| format!("copy thread transcript for {}", meta.id))?;

        index.threads.push(ThreadIndexEntry {
            analyzed: false,
            added_date: Some(timeparse::now_iso()),
            ..meta
        });
        added += 1;
    }

    if added > 0 {
        index.total_count = index.threads.len();
        index.last_updated = timeparse::now_iso();
        write_index(paths, &index)?;
    }
    Ok((added, index.total_count))
}

/// Session thread metadata, from the session's `thread_list.json` when it
/// exists, otherwise by scanning the directory for `{id}.json` files.
fn session_thread_candidates(session_threads_dir: &Path) -> Vec<ThreadIndexEntry> {
    let list_path = session_threads_dir
        .parent()
        .unwrap_or(session_threads_dir)
        .join("thread_list.json");

    if let Ok(content) = fs::read_to_string(&list_path) {
        if let Ok(metas) = serde_json::from_str::<Vec<ThreadIndexEntry>>(&content) {
            if !metas.is_empty() {
                return metas;
            }
        }
    }

    let mut found = Vec::new();
    let Ok(entries) = fs::read_dir(session_threads_dir) else {
        return found;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let mut meta = ThreadIndexEntry {
            id: id.to_string(),
            ..ThreadIndexEntry::default()
        };
        if let Ok(data) = fs::read_to_string(&path) {
            if let Ok(value) = serde_json::from_str::<Value>(&data) {
                meta.message_count = value
                    .get("message_count")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as usize;
                meta.first_message_time =
                    value.get("first_message_time").cloned().unwrap_or(Value::Null);
                meta.last_message_time =
                    value.get("last_message_time").cloned().unwrap_or(Value::Null);
            }
        }
        found.push(meta);
    }
    found.sort_by(|a, b| a.id.cmp(&b.id));
    found
}

/// Paginated listing, newest last-message-time first. An out-of-range page
/// yields an empty page, not an error.
pub fn get_all_threads(paths: &LensPaths, page: usize, per_page: usize) -> Result<ThreadPage> {
    let mut index = load_index(paths)?;
    index.threads.sort_by(|a, b| {
        let ka = time_value_as_string(Some(&a.last_message_time));
        let kb = time_value_as_string(Some(&b.last_message_time));
        kb.cmp(&ka)
    });

    let page = page.max(1);
    let per_page = per_page.max(1);
    let total = index.threads.len();
    let total_pages = total.div_ceil(per_page);
    let start = (page - 1) * per_page;
    let threads = if start >= total {
        Vec::new()
    } else {
        index.threads[start..(start + per_page).min(total)].to_vec()
    };

    Ok(ThreadPage {
        threads,
        page,
        per_page,
        total,
        total_pages,
    })
}

pub fn get_thread_content(paths: &LensPaths, thread_id: &str) -> Result<ThreadContent> {
    let index = load_index(paths)?;
    let meta = index
        .threads
        .iter()
        .find(|t| t.id == thread_id)
        .cloned()
        .ok_or_else(|| LensError::ThreadNotFound(thread_id.to_string()))?;

    let txt_path = paths.threads_dir.join(format!("{thread_id}.txt"));
    let content = fs::read_to_string(&txt_path)
        .map_err(|_| LensError::ThreadNotFound(thread_id.to_string()))?;

    let json_path = paths.threads_dir.join(format!("{thread_id}.json"));
    let data = fs::read_to_string(&json_path)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or(Value::Null);

    Ok(ThreadContent {
        id: thread_id.to_string(),
        content,
        data,
        meta,
    })
}

/// Up to `count` threads not yet marked analyzed, in index order. Entries
/// whose transcript file has gone missing are skipped.
pub fn get_unanalyzed_threads(paths: &LensPaths, count: usize) -> Result<Vec<ThreadContent>> {
    let index = load_index(paths)?;
    let mut out = Vec::new();
    for meta in index.threads.iter().filter(|t| !t.analyzed) {
        if out.len() >= count {
            break;
        }
        if let Ok(content) = get_thread_content(paths, &meta.id) {
            out.push(content);
        }
    }
    Ok(out)
}

/// Flag the given threads analyzed and tag them with the insights they are
/// evidence for. Idempotent for the flag; evidence tags are appended without
/// duplicates on repeated calls.
pub fn mark_threads_analyzed(
    paths: &LensPaths,
    thread_ids: &[String],
    evidence_map: &EvidenceMap,
) -> Result<usize> {
    if thread_ids.is_empty() {
        return Ok(0);
    }
    let mut index = load_index(paths)?;
    let mut marked = 0usize;

    for entry in index.threads.iter_mut() {
        if !thread_ids.contains(&entry.id) {
            continue;
        }
        entry.analyzed = true;
        entry.analyzed_date = Some(timeparse::now_iso());
        for (insight, supporting) in evidence_map {
            if supporting.contains(&entry.id) && !entry.evidence_for.contains(insight) {
                entry.evidence_for.push(insight.clone());
            }
        }
        marked += 1;
    }

    index.analyzed_count = index.threads.iter().filter(|t| t.analyzed).count();
    index.last_updated = timeparse::now_iso();
    write_index(paths, &index)?;
    Ok(marked)
}

/// Persist a combined analysis under `results/{id}.json` and record it in
/// the history file as the latest run.
pub fn save_analysis_results(paths: &LensPaths, combined: &CombinedAnalysis) -> Result<HistoryEntry> {
    initialize_storage(paths)?;

    let meta = &combined.metadata;
    let entry = HistoryEntry {
        id: meta.id.clone(),
        timestamp: meta.timestamp,
        date: meta.date.clone(),
        session_id: meta.session_id.clone(),
        filename: meta.filename.clone(),
        thread_count: meta.thread_ids.len(),
        thread_ids: meta.thread_ids.clone(),
    };

    let results_file = paths.results_dir.join(format!("{}.json", meta.id));
    write_json_atomic(&results_file, &serde_json::to_value(combined)?)?;

    let mut history: AnalysisHistory = fs::read_to_string(paths.analysis_history_file())
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();
    history.analyses.push(entry.clone());
    history.latest = Some(entry.clone());
    history.last_updated = timeparse::now_iso();
    write_history(paths, &history)?;

    Ok(entry)
}

pub fn get_latest_analysis(paths: &LensPaths) -> Result<Option<CombinedAnalysis>> {
    initialize_storage(paths)?;
    let history: AnalysisHistory = fs::read_to_string(paths.analysis_history_file())
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();

    let Some(latest) = history.latest else {
        return Ok(None);
    };
    let results_file = paths.results_dir.join(format!("{}.json", latest.id));
    let Ok(content) = fs::read_to_string(&results_file) else {
        return Ok(None);
    };
    let combined = serde_json::from_str(&content)
        .with_context(|| format!("parse results {}", results_file.display()))?;
    Ok(Some(combined))
}

pub fn get_analysis_stats(paths: &LensPaths) -> Result<AnalysisStats> {
    let index = load_index(paths)?;
    let total = index.threads.len();
    let analyzed = index.threads.iter().filter(|t| t.analyzed).count();
    let percentage = if total > 0 {
        ((analyzed as f64 / total as f64) * 1000.0).round() / 10.0
    } else {
        0.0
    };
    Ok(AnalysisStats {
        total,
        analyzed,
        unanalyzed: total - analyzed,
        percentage,
    })
}

/// All stored threads tagged as evidence for the given insight text.
pub fn get_evidence_for_insight(paths: &LensPaths, insight: &str) -> Result<Vec<ThreadContent>> {
    let index = load_index(paths)?;
    let mut out = Vec::new();
    for meta in &index.threads {
        if meta.evidence_for.iter().any(|i| i == insight) {
            if let Ok(content) = get_thread_content(paths, &meta.id) {
                out.push(content);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lens::paths::paths_under;

    fn seeded(paths: &LensPaths, ids: &[&str]) {
        initialize_storage(paths).unwrap();
        let mut index = ThreadIndex::fresh();
        for id in ids {
            fs::write(paths.threads_dir.join(format!("{id}.txt")), format!("USER: {id}\n\n"))
                .unwrap();
            index.threads.push(ThreadIndexEntry {
                id: id.to_string(),
                message_count: 1,
                last_message_time: Value::String(format!("2025-01-0{} 00:00:00", index.threads.len() + 1)),
                ..ThreadIndexEntry::default()
            });
        }
        index.total_count = index.threads.len();
        write_index(paths, &index).unwrap();
    }

    #[test]
    fn pagination_caps_and_out_of_range_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = paths_under(tmp.path());
        seeded(&paths, &["a", "b", "c"]);

        let page1 = get_all_threads(&paths, 1, 2).unwrap();
        assert_eq!(page1.threads.len(), 2);
        assert_eq!(page1.total, 3);
        assert_eq!(page1.total_pages, 2);
        // newest last_message_time first
        assert_eq!(page1.threads[0].id, "c");

        let page9 = get_all_threads(&paths, 9, 2).unwrap();
        assert!(page9.threads.is_empty());
    }

    #[test]
    fn unanalyzed_selection_respects_cap_and_flag() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = paths_under(tmp.path());
        seeded(&paths, &["a", "b", "c"]);

        mark_threads_analyzed(&paths, &["a".to_string()], &EvidenceMap::new()).unwrap();

        let picked = get_unanalyzed_threads(&paths, 10).unwrap();
        let ids: Vec<&str> = picked.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);

        let capped = get_unanalyzed_threads(&paths, 1).unwrap();
        assert_eq!(capped.len(), 1);
    }

    #[test]
    fn marking_is_idempotent_and_appends_evidence() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = paths_under(tmp.path());
        seeded(&paths, &["a"]);

        let mut evidence = EvidenceMap::new();
        evidence.insert("insight one".to_string(), vec!["a".to_string()]);
        mark_threads_analyzed(&paths, &["a".to_string()], &evidence).unwrap();
        mark_threads_analyzed(&paths, &["a".to_string()], &evidence).unwrap();

        let index = load_index(&paths).unwrap();
        assert_eq!(index.analyzed_count, 1);
        assert_eq!(index.threads[0].evidence_for, vec!["insight one".to_string()]);

        let found = get_evidence_for_insight(&paths, "insight one").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].content, "USER: a\n\n");
    }

    #[test]
    fn corrupt_index_is_backed_up_and_rebuilt() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = paths_under(tmp.path());
        seeded(&paths, &["a", "b"]);

        fs::write(paths.thread_index_file(), "{not json at all").unwrap();

        let index = load_index(&paths).unwrap();
        assert_eq!(index.total_count, 2);
        assert_eq!(index.analyzed_count, 0);

        let backups: Vec<_> = fs::read_dir(&paths.data_dir)
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().contains(".bak."))
            .collect();
        assert_eq!(backups.len(), 1);

        let stats = get_analysis_stats(&paths).unwrap();
        assert_eq!(stats.analyzed, 0);
        assert_eq!(stats.total, 2);
    }

    #[test]
    fn missing_thread_is_a_typed_error() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = paths_under(tmp.path());
        initialize_storage(&paths).unwrap();

        let err = get_thread_content(&paths, "ghost").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LensError>(),
            Some(LensError::ThreadNotFound(_))
        ));
    }

    #[test]
    fn latest_analysis_round_trips_through_history() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = paths_under(tmp.path());

        let mut combined = CombinedAnalysis::default();
        combined.metadata.id = "analysis_1700000000".to_string();
        combined.metadata.timestamp = 1_700_000_000;
        combined.metadata.thread_ids = vec!["a".to_string()];
        combined.results.categories = vec!["Support".to_string()];

        save_analysis_results(&paths, &combined).unwrap();
        let loaded = get_latest_analysis(&paths).unwrap().unwrap();
        assert_eq!(loaded.metadata.id, "analysis_1700000000");
        assert_eq!(loaded.results.categories, vec!["Support".to_string()]);
    }
}
