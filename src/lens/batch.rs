use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::Serialize;
use serde_json::Value;

use crate::error::LensError;
use crate::lens::aggregate;
use crate::lens::analysis::{self, Analyzer, PROVIDER_MOCK};
use crate::lens::audit;
use crate::lens::config::LensConfig;
use crate::lens::extract::time_value_as_string;
use crate::lens::paths::LensPaths;
use crate::lens::schema::ThreadResult;
use crate::lens::store::{self, ThreadContent};
use crate::lens::timeparse;

/// How a batch ended. `NoThreadsAnalyzed` is distinct from `Completed`: the
/// batch ran to the end but found nothing new to analyze.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "detail")]
pub enum BatchOutcome {
    Completed,
    NoThreadsAnalyzed,
    Cancelled,
    Failed(String),
}

#[derive(Debug)]
struct BatchState {
    analyzing: bool,
    cancel_requested: bool,
    current: usize,
    total: usize,
    analyzed: usize,
    started_at: Instant,
    log_tail: VecDeque<String>,
    log_tail_len: usize,
    outcome: Option<BatchOutcome>,
}

impl BatchState {
    fn new(total: usize, log_tail_len: usize) -> Self {
        Self {
            analyzing: true,
            cancel_requested: false,
            current: 0,
            total,
            analyzed: 0,
            started_at: Instant::now(),
            log_tail: VecDeque::new(),
            log_tail_len,
            outcome: None,
        }
    }

    fn push_log(&mut self, line: String) {
        if self.log_tail.len() >= self.log_tail_len {
            self.log_tail.pop_front();
        }
        self.log_tail.push_back(line);
    }
}

/// Serializable point-in-time view of a running (or finished) batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSnapshot {
    pub analyzing: bool,
    pub current: usize,
    pub total: usize,
    pub analyzed: usize,
    pub progress_percent: f64,
    pub elapsed_secs: u64,
    pub log_tail: Vec<String>,
    pub outcome: Option<BatchOutcome>,
}

/// Owns the single background worker for one batch run. Single-flight is
/// enforced both in-process (one controller at a time would contend on the
/// lock anyway) and across processes via an exclusive lock on
/// `data/analysis.lock`; the lock is held by the worker and released when it
/// finishes.
pub struct BatchController {
    state: Arc<Mutex<BatchState>>,
    handle: Option<JoinHandle<()>>,
}

pub struct BatchRequest {
    pub session_id: Option<String>,
    pub filename: Option<String>,
    pub thread_count: usize,
}

impl BatchController {
    /// Select up to the requested number of unanalyzed threads and start the
    /// worker. Returns `LensError::BatchInFlight` if another batch holds the
    /// lock.
    pub fn start(
        paths: &LensPaths,
        cfg: &LensConfig,
        analyzer: Box<dyn Analyzer>,
        request: BatchRequest,
    ) -> Result<Self> {
        store::initialize_storage(paths)?;

        let lock_path = paths.batch_lock_file();
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("open batch lock {}", lock_path.display()))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| LensError::BatchInFlight)?;

        let threads = store::get_unanalyzed_threads(paths, request.thread_count)?;
        let state = Arc::new(Mutex::new(BatchState::new(
            threads.len(),
            cfg.batch.log_tail_len,
        )));

        audit::append_event(
            paths,
            "batch",
            "started",
            &format!("batch started over {} threads", threads.len()),
        )?;

        let worker_state = Arc::clone(&state);
        let worker_paths = paths.clone();
        let worker_cfg = cfg.clone();
        let handle = thread::spawn(move || {
            let outcome = run_batch(
                &worker_state,
                &worker_paths,
                &worker_cfg,
                analyzer.as_ref(),
                threads,
                request,
                lock_file,
            );
            if let Ok(mut st) = worker_state.lock() {
                st.analyzing = false;
                st.outcome = Some(outcome);
            }
        });

        Ok(Self {
            state,
            handle: Some(handle),
        })
    }

    pub fn snapshot(&self) -> BatchSnapshot {
        let st = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let progress = if st.total > 0 {
            (st.analyzed as f64 / st.total as f64) * 100.0
        } else {
            0.0
        };
        BatchSnapshot {
            analyzing: st.analyzing,
            current: st.current,
            total: st.total,
            analyzed: st.analyzed,
            progress_percent: progress,
            elapsed_secs: st.started_at.elapsed().as_secs(),
            log_tail: st.log_tail.iter().cloned().collect(),
            outcome: st.outcome.clone(),
        }
    }

    /// Request cooperative cancellation. The unit in flight runs to
    /// completion; the worker stops before starting the next one.
    pub fn cancel(&self) {
        if let Ok(mut st) = self.state.lock() {
            st.cancel_requested = true;
        }
    }

    pub fn is_running(&self) -> bool {
        self.snapshot().analyzing
    }

    /// Block until the worker finishes and return the terminal outcome.
    pub fn wait(mut self) -> BatchOutcome {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.snapshot()
            .outcome
            .unwrap_or_else(|| BatchOutcome::Failed("worker vanished without an outcome".into()))
    }
}

fn optional_time(raw: &Value) -> Option<String> {
    if raw.is_null() {
        return None;
    }
    let coerced = time_value_as_string(Some(raw));
    if coerced.is_empty() { None } else { Some(coerced) }
}

fn log_line(state: &Arc<Mutex<BatchState>>, paths: &LensPaths, line: String) {
    if let Ok(mut st) = state.lock() {
        st.push_log(line.clone());
    }
    let _ = audit::append_event(paths, "batch", "progress", &line);
}

fn run_batch(
    state: &Arc<Mutex<BatchState>>,
    paths: &LensPaths,
    cfg: &LensConfig,
    analyzer: &dyn Analyzer,
    threads: Vec<ThreadContent>,
    request: BatchRequest,
    lock_file: File,
) -> BatchOutcome {
    let outcome = match run_batch_inner(state, paths, cfg, analyzer, threads, request) {
        Ok(outcome) => outcome,
        Err(err) => {
            let _ = audit::append_event(paths, "batch", "failed", &err.to_string());
            BatchOutcome::Failed(err.to_string())
        }
    };
    let _ = fs2::FileExt::unlock(&lock_file);
    let _ = audit::append_event(
        paths,
        "batch",
        "finished",
        &format!("batch finished: {outcome:?}"),
    );
    outcome
}

fn run_batch_inner(
    state: &Arc<Mutex<BatchState>>,
    paths: &LensPaths,
    cfg: &LensConfig,
    analyzer: &dyn Analyzer,
    threads: Vec<ThreadContent>,
    request: BatchRequest,
) -> Result<BatchOutcome> {
    let total = threads.len();
    log_line(state, paths, format!("starting batch over {total} threads"));

    let mut new_results = Vec::new();
    let mut cancelled = false;

    for (i, thread) in threads.into_iter().enumerate() {
        {
            let mut st = state
                .lock()
                .map_err(|_| anyhow::anyhow!("batch state poisoned"))?;
            if st.cancel_requested {
                cancelled = true;
                break;
            }
            st.current = i + 1;
        }

        log_line(
            state,
            paths,
            format!("analyzing thread {}/{total}: {}", i + 1, thread.id),
        );

        let mut analysis = analysis::analyze_unit(analyzer, &thread.content, paths);
        if analysis.provider.is_empty() {
            analysis.provider = analyzer.label().to_string();
        }

        new_results.push(ThreadResult {
            thread_id: thread.id.clone(),
            first_message_time: optional_time(&thread.meta.first_message_time),
            last_message_time: optional_time(&thread.meta.last_message_time),
            message_count: thread.meta.message_count as u64,
            analysis,
        });

        {
            let mut st = state
                .lock()
                .map_err(|_| anyhow::anyhow!("batch state poisoned"))?;
            st.analyzed += 1;
        }

        if analyzer.label() != PROVIDER_MOCK && cfg.analysis.rate_limit_ms > 0 && i + 1 < total {
            thread::sleep(Duration::from_millis(cfg.analysis.rate_limit_ms));
        }
    }

    if new_results.is_empty() {
        if cancelled {
            log_line(state, paths, "batch cancelled before any thread finished".into());
            return Ok(BatchOutcome::Cancelled);
        }
        log_line(state, paths, "no unanalyzed threads to process".into());
        return Ok(BatchOutcome::NoThreadsAnalyzed);
    }

    // Fold this batch into the latest combined report, or start a new one.
    let mut combined = store::get_latest_analysis(paths)?.unwrap_or_default();
    let run_stamp = timeparse::generate_timestamp();
    if combined.metadata.first_analyzed_at.is_empty() {
        combined.metadata.first_analyzed_at = run_stamp.clone();
    }
    combined.metadata.last_analyzed_at = run_stamp;

    let analyzed_ids: Vec<String> = new_results.iter().map(|t| t.thread_id.clone()).collect();
    aggregate::merge_into_combined(&mut combined, new_results)?;

    let epoch = timeparse::now_epoch_secs()?;
    combined.metadata.id = format!("analysis_{epoch}");
    combined.metadata.timestamp = epoch;
    combined.metadata.date = timeparse::now_iso();
    combined.metadata.session_id = request.session_id;
    combined.metadata.filename = request.filename;

    store::save_analysis_results(paths, &combined)?;

    let evidence = aggregate::build_evidence_map(
        &combined.results.key_insights,
        &combined.thread_results,
    );
    store::mark_threads_analyzed(paths, &analyzed_ids, &evidence)?;

    log_line(
        state,
        paths,
        format!(
            "batch saved as {} ({} new threads, {} total)",
            combined.metadata.id,
            analyzed_ids.len(),
            combined.thread_results.len()
        ),
    );

    if cancelled {
        return Ok(BatchOutcome::Cancelled);
    }
    Ok(BatchOutcome::Completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lens::analysis::MockAnalyzer;
    use crate::lens::paths::paths_under;
    use crate::lens::store::{ThreadIndexEntry, initialize_storage};
    use std::fs;

    fn seed_threads(paths: &LensPaths, ids: &[&str]) {
        initialize_storage(paths).unwrap();
        let mut index = store::load_index(paths).unwrap();
        for id in ids {
            fs::write(
                paths.threads_dir.join(format!("{id}.txt")),
                format!("USER: hello from {id}\n\nASSISTANT: hi\n\n"),
            )
            .unwrap();
            index.threads.push(ThreadIndexEntry {
                id: id.to_string(),
                message_count: 2,
                last_message_time: Value::String("2025-03-01T10:00:00Z".to_string()),
                ..ThreadIndexEntry::default()
            });
        }
        index.total_count = index.threads.len();
        let value = serde_json::to_value(&index).unwrap();
        fs::write(
            paths.thread_index_file(),
            serde_json::to_string_pretty(&value).unwrap(),
        )
        .unwrap();
    }

    fn request(count: usize) -> BatchRequest {
        BatchRequest {
            session_id: Some("s1".to_string()),
            filename: Some("export.json".to_string()),
            thread_count: count,
        }
    }

    #[test]
    fn mock_batch_runs_to_completion_and_marks_threads() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = paths_under(tmp.path());
        seed_threads(&paths, &["t1", "t2"]);

        let cfg = LensConfig::default();
        let controller =
            BatchController::start(&paths, &cfg, Box::new(MockAnalyzer), request(10)).unwrap();
        let outcome = controller.wait();
        assert_eq!(outcome, BatchOutcome::Completed);

        let stats = store::get_analysis_stats(&paths).unwrap();
        assert_eq!(stats.analyzed, 2);

        let combined = store::get_latest_analysis(&paths).unwrap().unwrap();
        assert_eq!(combined.thread_results.len(), 2);
        assert_eq!(combined.metadata.mock_units, 2);
        assert_eq!(combined.metadata.real_units, 0);
        assert_eq!(combined.metadata.total_messages_analyzed, 4);
        assert!(combined.metadata.id.starts_with("analysis_"));
    }

    #[test]
    fn second_run_finds_nothing_new() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = paths_under(tmp.path());
        seed_threads(&paths, &["t1"]);
        let cfg = LensConfig::default();

        let first =
            BatchController::start(&paths, &cfg, Box::new(MockAnalyzer), request(5)).unwrap();
        assert_eq!(first.wait(), BatchOutcome::Completed);

        let second =
            BatchController::start(&paths, &cfg, Box::new(MockAnalyzer), request(5)).unwrap();
        assert_eq!(second.wait(), BatchOutcome::NoThreadsAnalyzed);
    }

    #[test]
    fn batch_respects_requested_count() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = paths_under(tmp.path());
        seed_threads(&paths, &["t1", "t2", "t3"]);
        let cfg = LensConfig::default();

        let controller =
            BatchController::start(&paths, &cfg, Box::new(MockAnalyzer), request(2)).unwrap();
        assert_eq!(controller.wait(), BatchOutcome::Completed);

        let stats = store::get_analysis_stats(&paths).unwrap();
        assert_eq!(stats.analyzed, 2);
        assert_eq!(stats.unanalyzed, 1);
    }

    #[test]
    fn progress_snapshot_reports_terminal_state() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = paths_under(tmp.path());
        seed_threads(&paths, &["t1"]);
        let cfg = LensConfig::default();

        let controller =
            BatchController::start(&paths, &cfg, Box::new(MockAnalyzer), request(1)).unwrap();
        let outcome = controller.wait();
        assert_eq!(outcome, BatchOutcome::Completed);
    }
}
