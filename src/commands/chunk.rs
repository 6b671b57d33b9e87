use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::commands::CommandReport;
use crate::lens::aggregate::{MergeCaps, combine};
use crate::lens::analysis::{MOCK_SENTINEL, PROVIDER_MOCK, analyze_chunks, select_analyzer};
use crate::lens::audit;
use crate::lens::chunker;
use crate::lens::config::{LensConfig, load_config, resolve_api_key};
use crate::lens::paths::resolve_paths;
use crate::lens::schema::{AnalysisMetadata, CombinedAnalysis};
use crate::lens::store;
use crate::lens::timeparse;

#[derive(Debug, Clone)]
pub struct ChunkOptions {
    pub file: PathBuf,
    pub max_size: Option<usize>,
    pub max_chunks: Option<usize>,
    pub output: Option<PathBuf>,
    pub analyze: bool,
    pub mock: bool,
    pub api_key: Option<String>,
}

/// Split a text file into analysis-sized chunks. Optionally writes them to
/// numbered files, and with `--analyze` runs every chunk through the
/// analysis backend and saves the combined report.
pub fn run(opts: &ChunkOptions) -> Result<CommandReport> {
    let cfg = load_config()?;
    let mut report = CommandReport::new("chunk");

    let text = fs::read_to_string(&opts.file)
        .with_context(|| format!("read {}", opts.file.display()))?;
    let max_size = opts.max_size.unwrap_or(cfg.chunking.max_chunk_bytes);

    let mut chunks = chunker::chunk(&text, max_size);
    report.detail(format!("input_bytes={}", text.len()));
    report.detail(format!("chunks={}", chunks.len()));

    let cap = opts.max_chunks.unwrap_or(cfg.chunking.max_chunks);
    if cap > 0 && chunks.len() > cap {
        chunks.truncate(cap);
        report.detail(format!("truncated_to={cap}"));
    }

    for (i, chunk) in chunks.iter().enumerate() {
        report.detail(format!("chunk_{i}_bytes={}", chunk.len()));
    }

    if let Some(output) = &opts.output {
        let written = chunker::save_chunks_to_files(&chunks, output)?;
        report.detail(format!(
            "wrote {} chunk files under {}",
            written.len(),
            output.display()
        ));
    }

    if opts.analyze {
        analyze_and_save(opts, &cfg, &chunks, &mut report)?;
    }

    Ok(report)
}

/// Run the chunked text through the backend and persist the combined
/// report, the same pipeline a batch uses but without thread bookkeeping.
fn analyze_and_save(
    opts: &ChunkOptions,
    cfg: &LensConfig,
    chunks: &[String],
    report: &mut CommandReport,
) -> Result<()> {
    if chunks.is_empty() {
        report.issue("nothing to analyze: input produced no chunks".to_string());
        return Ok(());
    }

    let paths = resolve_paths()?;
    let api_key = if opts.mock {
        Some(MOCK_SENTINEL.to_string())
    } else {
        resolve_api_key(opts.api_key.as_deref())
    };
    let analyzer = select_analyzer(api_key.as_deref(), &cfg.analysis)?;
    report.detail(format!("provider={}", analyzer.label()));

    let unit_results = analyze_chunks(
        analyzer.as_ref(),
        chunks,
        cfg.analysis.rate_limit_ms,
        &paths,
    );
    let mock_units = unit_results
        .iter()
        .filter(|r| r.provider == PROVIDER_MOCK)
        .count();
    let merged = combine(&unit_results, MergeCaps::single())?;

    let epoch = timeparse::now_epoch_secs()?;
    let run_stamp = timeparse::generate_timestamp();
    let combined = CombinedAnalysis {
        metadata: AnalysisMetadata {
            id: format!("analysis_{epoch}"),
            timestamp: epoch,
            date: timeparse::now_iso(),
            session_id: None,
            filename: opts
                .file
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
            first_analyzed_at: run_stamp.clone(),
            last_analyzed_at: run_stamp,
            real_units: unit_results.len() - mock_units,
            mock_units,
            ..AnalysisMetadata::default()
        },
        results: merged,
        thread_results: Vec::new(),
    };

    let entry = store::save_analysis_results(&paths, &combined)?;
    report.detail(format!("analysis={}", entry.id));
    report.detail(format!(
        "units={} (real={} mock={})",
        unit_results.len(),
        combined.metadata.real_units,
        combined.metadata.mock_units
    ));

    audit::append_event(
        &paths,
        "chunk",
        "analyzed",
        &format!(
            "analyzed {} chunk units from {} into {}",
            unit_results.len(),
            opts.file.display(),
            entry.id
        ),
    )?;
    Ok(())
}
