use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Byte budget per chunk; cuts never split a UTF-8 sequence.
    pub max_chunk_bytes: usize,
    /// Hard cap on chunks submitted per run; 0 disables the cap.
    pub max_chunks: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_bytes: 100_000,
            max_chunks: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    pub model: String,
    pub request_timeout_secs: u64,
    /// Fixed delay between sequential unit calls, to stay under rate limits.
    pub rate_limit_ms: u64,
    /// How many unanalyzed threads `analyze` picks up when no count is given.
    pub default_batch_threads: usize,
    pub max_output_tokens: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            model: "claude-3-5-sonnet-latest".to_string(),
            request_timeout_secs: 120,
            rate_limit_ms: 1_000,
            default_batch_threads: 10,
            max_output_tokens: 4_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Log lines retained in the in-memory tail shown to pollers.
    pub log_tail_len: usize,
    /// Poll interval used by the CLI while a batch is running.
    pub poll_interval_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            log_tail_len: 100,
            poll_interval_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LensConfig {
    pub chunking: ChunkingConfig,
    pub analysis: AnalysisConfig,
    pub batch: BatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialLensConfig {
    chunking: Option<ChunkingConfig>,
    analysis: Option<AnalysisConfig>,
    batch: Option<BatchConfig>,
}

fn env_or_usize(var: &str, fallback: usize) -> usize {
    match env::var(var) {
        Ok(v) => v.trim().parse::<usize>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_u64(var: &str, fallback: u64) -> u64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_string(var: &str, fallback: &str) -> String {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => fallback.to_string(),
    }
}

fn validate(cfg: &LensConfig) -> Result<()> {
    if cfg.chunking.max_chunk_bytes < 1_024 {
        return Err(anyhow!("invalid chunk budget: must be >= 1024 bytes"));
    }
    if cfg.analysis.request_timeout_secs == 0 {
        return Err(anyhow!("invalid request timeout: must be >= 1 second"));
    }
    if cfg.analysis.default_batch_threads == 0 {
        return Err(anyhow!("invalid default batch size: must be >= 1"));
    }
    if cfg.analysis.model.trim().is_empty() {
        return Err(anyhow!("invalid analysis model: cannot be empty"));
    }
    if cfg.batch.log_tail_len == 0 {
        return Err(anyhow!("invalid log tail length: must be >= 1"));
    }
    Ok(())
}

fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(custom) = env::var("CHATLENS_CONFIG_PATH") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }

    let home = dirs::home_dir()?;
    Some(home.join(".chatlens").join("chatlens.toml"))
}

fn merge_file_config(base: &mut LensConfig) -> Result<()> {
    let Some(path) = resolve_config_path() else {
        return Ok(());
    };
    if !path.exists() {
        return Ok(());
    }

    let raw = fs::read_to_string(&path)?;
    let parsed: PartialLensConfig = toml::from_str(&raw)
        .map_err(|err| anyhow!("failed to parse config {}: {err}", path.display()))?;
    if let Some(chunking) = parsed.chunking {
        base.chunking = chunking;
    }
    if let Some(analysis) = parsed.analysis {
        base.analysis = analysis;
    }
    if let Some(batch) = parsed.batch {
        base.batch = batch;
    }
    Ok(())
}

pub fn load_config() -> Result<LensConfig> {
    let mut cfg = LensConfig::default();
    merge_file_config(&mut cfg)?;

    cfg.chunking.max_chunk_bytes =
        env_or_usize("CHATLENS_MAX_CHUNK_BYTES", cfg.chunking.max_chunk_bytes);
    cfg.chunking.max_chunks = env_or_usize("CHATLENS_MAX_CHUNKS", cfg.chunking.max_chunks);
    cfg.analysis.model = env_or_string("CHATLENS_ANALYSIS_MODEL", &cfg.analysis.model);
    cfg.analysis.request_timeout_secs = env_or_u64(
        "CHATLENS_REQUEST_TIMEOUT_SECS",
        cfg.analysis.request_timeout_secs,
    );
    cfg.analysis.rate_limit_ms = env_or_u64("CHATLENS_RATE_LIMIT_MS", cfg.analysis.rate_limit_ms);
    cfg.analysis.default_batch_threads = env_or_usize(
        "CHATLENS_BATCH_THREADS",
        cfg.analysis.default_batch_threads,
    );
    cfg.analysis.max_output_tokens =
        env_or_u64("CHATLENS_MAX_OUTPUT_TOKENS", cfg.analysis.max_output_tokens);
    cfg.batch.log_tail_len = env_or_usize("CHATLENS_LOG_TAIL_LEN", cfg.batch.log_tail_len);
    cfg.batch.poll_interval_ms =
        env_or_u64("CHATLENS_POLL_INTERVAL_MS", cfg.batch.poll_interval_ms);

    validate(&cfg)?;
    Ok(cfg)
}

/// API key resolution: explicit flag wins, then `CHATLENS_API_KEY`, then
/// `ANTHROPIC_API_KEY`. Absent or the literal "mock" selects the mock path.
pub fn resolve_api_key(flag: Option<&str>) -> Option<String> {
    if let Some(key) = flag {
        let trimmed = key.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_string());
        }
    }
    for var in ["CHATLENS_API_KEY", "ANTHROPIC_API_KEY"] {
        if let Ok(v) = env::var(var) {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}
