use anyhow::Result;
use std::env;
use std::path::PathBuf;

/// Folder roots for everything chatlens persists. Each directory can be
/// redirected independently via environment variable; `CHATLENS_HOME` moves
/// the whole tree at once.
#[derive(Debug, Clone)]
pub struct LensPaths {
    pub lens_home: PathBuf,
    /// Raw uploaded chat export files.
    pub uploads_dir: PathBuf,
    /// Per-session working dirs (extracted threads, chunk files).
    pub sessions_dir: PathBuf,
    /// Permanent per-thread JSON + transcript files.
    pub threads_dir: PathBuf,
    /// Saved combined-analysis result files.
    pub results_dir: PathBuf,
    /// Thread index, analysis history, processed-id set, batch lock.
    pub data_dir: PathBuf,
    pub logs_dir: PathBuf,
}

fn required_home_dir() -> Result<PathBuf> {
    if let Some(home) = dirs::home_dir() {
        return Ok(home);
    }
    Err(anyhow::anyhow!("HOME directory could not be resolved"))
}

fn env_or_default_path(var: &str, fallback: PathBuf) -> PathBuf {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => fallback,
    }
}

pub fn resolve_paths() -> Result<LensPaths> {
    let home = required_home_dir()?;
    let lens_home = env_or_default_path("CHATLENS_HOME", home.join(".chatlens"));

    let uploads_dir = env_or_default_path("CHATLENS_UPLOADS_DIR", lens_home.join("uploads"));
    let sessions_dir = env_or_default_path("CHATLENS_SESSIONS_DIR", lens_home.join("sessions"));
    let threads_dir = env_or_default_path("CHATLENS_THREADS_DIR", lens_home.join("threads"));
    let results_dir = env_or_default_path("CHATLENS_RESULTS_DIR", lens_home.join("results"));
    let data_dir = env_or_default_path("CHATLENS_DATA_DIR", lens_home.join("data"));
    let logs_dir = env_or_default_path("CHATLENS_LOGS_DIR", lens_home.join("logs"));

    Ok(LensPaths {
        lens_home,
        uploads_dir,
        sessions_dir,
        threads_dir,
        results_dir,
        data_dir,
        logs_dir,
    })
}

impl LensPaths {
    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.sessions_dir.join(session_id)
    }

    pub fn session_threads_dir(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("threads")
    }

    pub fn thread_index_file(&self) -> PathBuf {
        self.data_dir.join("thread_index.json")
    }

    pub fn analysis_history_file(&self) -> PathBuf {
        self.data_dir.join("analysis_history.json")
    }

    pub fn batch_lock_file(&self) -> PathBuf {
        self.data_dir.join("analysis.lock")
    }
}

#[cfg(test)]
pub(crate) fn paths_under(root: &std::path::Path) -> LensPaths {
    let lens_home = root.to_path_buf();
    LensPaths {
        uploads_dir: lens_home.join("uploads"),
        sessions_dir: lens_home.join("sessions"),
        threads_dir: lens_home.join("threads"),
        results_dir: lens_home.join("results"),
        data_dir: lens_home.join("data"),
        logs_dir: lens_home.join("logs"),
        lens_home,
    }
}
