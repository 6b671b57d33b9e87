use anyhow::Result;
use chrono::{DateTime, FixedOffset};

use crate::commands::CommandReport;
use crate::lens::aggregate;
use crate::lens::paths::resolve_paths;
use crate::lens::schema::CombinedAnalysis;
use crate::lens::store;
use crate::lens::timeparse;

#[derive(Debug, Clone)]
pub struct ResultsOptions {
    pub start: Option<String>,
    pub end: Option<String>,
    pub json: bool,
}

fn parse_bound(raw: Option<&str>, report: &mut CommandReport) -> Option<DateTime<FixedOffset>> {
    let raw = raw?;
    let parsed = timeparse::parse_datetime(raw);
    if parsed.is_none() {
        report.issue(format!("unparseable date: {raw}"));
    }
    parsed
}

fn summarize(report: &mut CommandReport, combined: &CombinedAnalysis) {
    let meta = &combined.metadata;
    report.detail(format!("analysis={}", meta.id));
    report.detail(format!(
        "threads={} messages={} (real={} mock={})",
        meta.total_threads_analyzed, meta.total_messages_analyzed, meta.real_units, meta.mock_units
    ));
    report.detail(format!(
        "average_score={:.1}",
        combined.results.response_quality.average_score
    ));
    if !combined.results.categories.is_empty() {
        report.detail(format!(
            "categories: {}",
            combined.results.categories.join(", ")
        ));
    }
    for topic in &combined.results.top_discussions {
        report.detail(format!("topic: {} ({})", topic.topic, topic.count));
    }
    for insight in &combined.results.key_insights {
        report.detail(format!("insight: {}", insight.insight));
    }
}

/// Show the latest combined analysis, optionally recomputed over a time
/// window.
pub fn run(opts: &ResultsOptions) -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let mut report = CommandReport::new("results");

    let Some(combined) = store::get_latest_analysis(&paths)? else {
        report.issue("no analysis results yet; run `chatlens analyze` first");
        return Ok(report);
    };

    let start = parse_bound(opts.start.as_deref(), &mut report);
    let end = parse_bound(opts.end.as_deref(), &mut report);
    if !report.ok {
        return Ok(report);
    }

    let view = if start.is_some() || end.is_some() {
        aggregate::filter_by_time(&combined, start, end)
    } else {
        combined
    };

    if opts.json {
        report.detail(serde_json::to_string_pretty(&view)?);
    } else {
        summarize(&mut report, &view);
    }

    Ok(report)
}
