use anyhow::Result;
use chrono::{DateTime, FixedOffset};

use crate::error::LensError;
use crate::lens::analysis::PROVIDER_MOCK;
use crate::lens::schema::{
    AnalysisResult, CombinedAnalysis, KeyInsight, NegativeCategory, ThreadResult, TopicCount,
};
use crate::lens::store::EvidenceMap;
use crate::lens::timeparse;

const TOP_DISCUSSIONS_CAP: usize = 5;

/// How hard a merge truncates its lists. Single-run combines stay tight;
/// the persistent report that accumulates across batches keeps more.
#[derive(Debug, Clone, Copy)]
pub struct MergeCaps {
    pub examples: usize,
    pub lists: usize,
}

impl MergeCaps {
    pub fn single() -> Self {
        Self {
            examples: 3,
            lists: 5,
        }
    }

    pub fn persistent() -> Self {
        Self {
            examples: 10,
            lists: 20,
        }
    }
}

fn union_into(target: &mut Vec<String>, items: &[String]) {
    for item in items {
        if !target.contains(item) {
            target.push(item.clone());
        }
    }
}

fn append_assessment(target: &mut String, text: &str) {
    if text.is_empty() {
        return;
    }
    if target.is_empty() {
        target.push_str(text);
    } else {
        target.push(' ');
        target.push_str(text);
    }
}

fn merge_topics(target: &mut Vec<TopicCount>, items: &[TopicCount]) {
    for topic in items {
        match target.iter_mut().find(|t| t.topic == topic.topic) {
            Some(existing) => {
                existing.count += topic.count;
                union_into(&mut existing.instances, &topic.instances);
            }
            None => target.push(topic.clone()),
        }
    }
}

fn merge_negative(target: &mut Vec<NegativeCategory>, items: &[NegativeCategory]) {
    for cat in items {
        match target.iter_mut().find(|c| c.category == cat.category) {
            Some(existing) => {
                existing.count += cat.count;
                union_into(&mut existing.examples, &cat.examples);
            }
            None => target.push(cat.clone()),
        }
    }
}

/// Merge per-unit analyses into one. Union preserves first-seen order, topic
/// counts sum, the quality score is the arithmetic mean of the contributing
/// scores. Units carrying an error are skipped; if nothing contributes the
/// result is `LensError::NoResults`.
pub fn combine(results: &[AnalysisResult], caps: MergeCaps) -> Result<AnalysisResult> {
    let contributing: Vec<&AnalysisResult> = results.iter().filter(|r| !r.is_error()).collect();
    if contributing.is_empty() {
        return Err(LensError::NoResults.into());
    }

    let mut combined = AnalysisResult::default();
    let mut scores = Vec::new();

    for unit in contributing {
        union_into(&mut combined.categories, &unit.categories);
        merge_topics(&mut combined.top_discussions, &unit.top_discussions);

        if unit.response_quality.average_score > 0.0 {
            scores.push(unit.response_quality.average_score);
        }
        union_into(
            &mut combined.response_quality.good_examples,
            &unit.response_quality.good_examples,
        );
        union_into(
            &mut combined.response_quality.poor_examples,
            &unit.response_quality.poor_examples,
        );

        for area in &unit.improvement_areas {
            if !combined.improvement_areas.iter().any(|a| a.area == area.area) {
                combined.improvement_areas.push(area.clone());
            }
        }
        for need in &unit.unmet_needs {
            if !combined.unmet_needs.iter().any(|n| n.need == need.need) {
                combined.unmet_needs.push(need.clone());
            }
        }
        for insight in &unit.key_insights {
            if !combined
                .key_insights
                .iter()
                .any(|i| i.insight == insight.insight)
            {
                combined.key_insights.push(insight.clone());
            }
        }

        append_assessment(
            &mut combined.user_satisfaction.overall_assessment,
            &unit.user_satisfaction.overall_assessment,
        );
        union_into(
            &mut combined.user_satisfaction.positive_indicators,
            &unit.user_satisfaction.positive_indicators,
        );
        union_into(
            &mut combined.user_satisfaction.negative_indicators,
            &unit.user_satisfaction.negative_indicators,
        );

        append_assessment(
            &mut combined.product_effectiveness.assessment,
            &unit.product_effectiveness.assessment,
        );
        union_into(
            &mut combined.product_effectiveness.strengths,
            &unit.product_effectiveness.strengths,
        );
        union_into(
            &mut combined.product_effectiveness.weaknesses,
            &unit.product_effectiveness.weaknesses,
        );

        merge_negative(
            &mut combined.negative_chats.categories,
            &unit.negative_chats.categories,
        );
    }

    if !scores.is_empty() {
        combined.response_quality.average_score =
            scores.iter().sum::<f64>() / scores.len() as f64;
    }

    combined
        .top_discussions
        .sort_by(|a, b| b.count.cmp(&a.count));
    combined.top_discussions.truncate(TOP_DISCUSSIONS_CAP);
    combined.response_quality.good_examples.truncate(caps.examples);
    combined.response_quality.poor_examples.truncate(caps.examples);
    combined.improvement_areas.truncate(caps.lists);
    combined.unmet_needs.truncate(caps.lists);
    combined.key_insights.truncate(caps.lists);

    Ok(combined)
}

/// Fold a batch of freshly analyzed threads into a persistent combined
/// report. Thread results are appended, never replaced; an id already in the
/// report is skipped entirely. The merged insight fields are recomputed over
/// every contributing thread, with the quality average rolled two-step
/// against the previous value rather than weighted. Returns how many of the
/// offered threads were actually new.
pub fn merge_into_combined(
    combined: &mut CombinedAnalysis,
    new_results: Vec<ThreadResult>,
) -> Result<usize> {
    let mut added = 0usize;
    for result in new_results {
        if combined.contains_thread(&result.thread_id) {
            continue;
        }
        combined.thread_results.push(result);
        added += 1;
    }

    combined.metadata.total_threads_analyzed = combined.thread_results.len();
    combined.metadata.total_messages_analyzed =
        combined.thread_results.iter().map(|t| t.message_count).sum();
    combined.metadata.thread_ids = combined
        .thread_results
        .iter()
        .map(|t| t.thread_id.clone())
        .collect();
    combined.metadata.mock_units = combined
        .thread_results
        .iter()
        .filter(|t| t.analysis.provider == PROVIDER_MOCK)
        .count();
    combined.metadata.real_units =
        combined.thread_results.len() - combined.metadata.mock_units;

    if added == 0 {
        return Ok(0);
    }

    let units: Vec<AnalysisResult> = combined
        .thread_results
        .iter()
        .map(|t| t.analysis.clone())
        .collect();
    let previous_average = combined.results.response_quality.average_score;

    let mut fresh = combine(&units, MergeCaps::persistent())?;
    if previous_average > 0.0 && fresh.response_quality.average_score > 0.0 {
        fresh.response_quality.average_score =
            (previous_average + fresh.response_quality.average_score) / 2.0;
    }
    combined.results = fresh;

    Ok(added)
}

/// Map each combined key insight to the thread ids whose own analysis
/// carried that exact insight text.
pub fn build_evidence_map(
    insights: &[KeyInsight],
    thread_results: &[ThreadResult],
) -> EvidenceMap {
    let mut map = EvidenceMap::new();
    for insight in insights {
        let supporting: Vec<String> = thread_results
            .iter()
            .filter(|t| {
                t.analysis
                    .key_insights
                    .iter()
                    .any(|i| i.insight == insight.insight)
            })
            .map(|t| t.thread_id.clone())
            .collect();
        map.insert(insight.insight.clone(), supporting);
    }
    map
}

fn thread_time(thread: &ThreadResult) -> Option<DateTime<FixedOffset>> {
    thread
        .last_message_time
        .as_deref()
        .and_then(timeparse::parse_datetime)
        .or_else(|| {
            thread
                .first_message_time
                .as_deref()
                .and_then(timeparse::parse_datetime)
        })
}

/// Recompute a combined report over only the threads whose timestamp falls
/// inside the window. Threads with no parseable time are dropped. An empty
/// window yields the empty report shape with a "no data" assessment.
pub fn filter_by_time(
    combined: &CombinedAnalysis,
    start: Option<DateTime<FixedOffset>>,
    end: Option<DateTime<FixedOffset>>,
) -> CombinedAnalysis {
    if start.is_none() && end.is_none() {
        return combined.clone();
    }

    let filtered_threads: Vec<ThreadResult> = combined
        .thread_results
        .iter()
        .filter(|t| {
            let Some(time) = thread_time(t) else {
                return false;
            };
            if let Some(s) = start {
                if time < s {
                    return false;
                }
            }
            if let Some(e) = end {
                if time > e {
                    return false;
                }
            }
            true
        })
        .cloned()
        .collect();

    let mut out = CombinedAnalysis {
        metadata: combined.metadata.clone(),
        results: AnalysisResult::default(),
        thread_results: filtered_threads,
    };
    out.metadata.total_threads_analyzed = out.thread_results.len();
    out.metadata.total_messages_analyzed =
        out.thread_results.iter().map(|t| t.message_count).sum();
    out.metadata.thread_ids = out
        .thread_results
        .iter()
        .map(|t| t.thread_id.clone())
        .collect();
    out.metadata.mock_units = out
        .thread_results
        .iter()
        .filter(|t| t.analysis.provider == PROVIDER_MOCK)
        .count();
    out.metadata.real_units = out.thread_results.len() - out.metadata.mock_units;

    if out.thread_results.is_empty() {
        out.results.user_satisfaction.overall_assessment =
            "No data for selected time period".to_string();
        return out;
    }

    let units: Vec<AnalysisResult> = out
        .thread_results
        .iter()
        .map(|t| t.analysis.clone())
        .collect();
    if let Ok(fresh) = combine(&units, MergeCaps::persistent()) {
        out.results = fresh;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lens::schema::sanitize_analysis;
    use serde_json::json;

    fn unit(value: serde_json::Value) -> AnalysisResult {
        sanitize_analysis(value)
    }

    fn thread(id: &str, time: &str, analysis: AnalysisResult) -> ThreadResult {
        ThreadResult {
            thread_id: id.to_string(),
            first_message_time: Some(time.to_string()),
            last_message_time: Some(time.to_string()),
            message_count: 2,
            analysis,
        }
    }

    #[test]
    fn empty_and_all_error_combines_fail() {
        let err = combine(&[], MergeCaps::single()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LensError>(),
            Some(LensError::NoResults)
        ));

        let failed = unit(json!({"error": "timeout"}));
        let err = combine(&[failed], MergeCaps::single()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LensError>(),
            Some(LensError::NoResults)
        ));
    }

    #[test]
    fn topics_merge_by_name_and_sort_by_count() {
        let a = unit(json!({"top_discussions": [
            {"topic": "Mixing", "count": 2},
            {"topic": "Lyrics", "count": 5},
        ]}));
        let b = unit(json!({"top_discussions": [
            {"topic": "Mixing", "count": 4},
            {"topic": "Mastering", "count": 1},
        ]}));

        let combined = combine(&[a, b], MergeCaps::single()).unwrap();
        assert_eq!(combined.top_discussions[0].topic, "Mixing");
        assert_eq!(combined.top_discussions[0].count, 6);
        assert_eq!(combined.top_discussions[1].topic, "Lyrics");
        assert_eq!(combined.top_discussions.len(), 3);
    }

    #[test]
    fn unions_keep_first_seen_order_and_drop_duplicates() {
        let a = unit(json!({
            "categories": ["Support", "Sales"],
            "key_insights": ["alpha", "beta"],
        }));
        let b = unit(json!({
            "categories": ["Sales", "Billing"],
            "key_insights": ["beta", "gamma"],
        }));

        let combined = combine(&[a, b], MergeCaps::single()).unwrap();
        assert_eq!(combined.categories, vec!["Support", "Sales", "Billing"]);
        let insights: Vec<&str> = combined
            .key_insights
            .iter()
            .map(|i| i.insight.as_str())
            .collect();
        assert_eq!(insights, vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn quality_scores_average_and_error_units_are_excluded() {
        let a = unit(json!({"response_quality": {"average_score": 6.0}}));
        let b = unit(json!({"response_quality": {"score": 8.0}}));
        let failed = unit(json!({"error": "bad chunk", "response_quality": {"score": 1.0}}));

        let combined = combine(&[a, failed, b], MergeCaps::single()).unwrap();
        assert_eq!(combined.response_quality.average_score, 7.0);
    }

    #[test]
    fn caps_differ_between_single_and_persistent() {
        let insights: Vec<serde_json::Value> =
            (0..30).map(|i| json!(format!("insight {i}"))).collect();
        let a = unit(json!({"key_insights": insights}));

        let single = combine(std::slice::from_ref(&a), MergeCaps::single()).unwrap();
        assert_eq!(single.key_insights.len(), 5);

        let persistent = combine(&[a], MergeCaps::persistent()).unwrap();
        assert_eq!(persistent.key_insights.len(), 20);
    }

    #[test]
    fn negative_categories_merge_by_name() {
        let a = unit(json!({"negative_chats": {"categories": [
            {"category": "Confusion", "count": 2, "examples": ["e1"]},
        ]}}));
        let b = unit(json!({"negative_chats": {"categories": [
            {"category": "Confusion", "count": 3, "examples": ["e2"]},
            {"category": "Latency", "count": 1},
        ]}}));

        let combined = combine(&[a, b], MergeCaps::single()).unwrap();
        assert_eq!(combined.negative_chats.categories[0].count, 5);
        assert_eq!(
            combined.negative_chats.categories[0].examples,
            vec!["e1", "e2"]
        );
        assert_eq!(combined.negative_chats.categories.len(), 2);
    }

    #[test]
    fn merge_into_combined_skips_known_threads_and_rolls_average() {
        let mut combined = CombinedAnalysis::default();
        let first = thread(
            "t1",
            "2025-03-01T10:00:00Z",
            unit(json!({"response_quality": {"score": 6.0}, "key_insights": ["one"]})),
        );
        assert_eq!(merge_into_combined(&mut combined, vec![first]).unwrap(), 1);
        assert_eq!(combined.results.response_quality.average_score, 6.0);

        // second batch re-offers t1 and adds t2 with score 8; the fresh mean
        // over both units is 7, rolled with the previous 6 into 6.5
        let dup = thread("t1", "2025-03-01T10:00:00Z", unit(json!({})));
        let second = thread(
            "t2",
            "2025-03-02T10:00:00Z",
            unit(json!({"response_quality": {"score": 8.0}, "key_insights": ["two"]})),
        );
        let added = merge_into_combined(&mut combined, vec![dup, second]).unwrap();
        assert_eq!(added, 1);
        assert_eq!(combined.thread_results.len(), 2);
        assert_eq!(combined.results.response_quality.average_score, 6.5);
        assert_eq!(combined.metadata.total_threads_analyzed, 2);
        assert_eq!(combined.metadata.total_messages_analyzed, 4);
    }

    #[test]
    fn re_offering_everything_changes_nothing() {
        let mut combined = CombinedAnalysis::default();
        let t = thread("t1", "2025-03-01T10:00:00Z", unit(json!({"categories": ["A"]})));
        merge_into_combined(&mut combined, vec![t.clone()]).unwrap();
        let before = serde_json::to_value(&combined).unwrap();

        assert_eq!(merge_into_combined(&mut combined, vec![t]).unwrap(), 0);
        assert_eq!(serde_json::to_value(&combined).unwrap(), before);
    }

    #[test]
    fn evidence_map_points_insights_at_their_threads() {
        let t1 = thread("t1", "2025-03-01T10:00:00Z", unit(json!({"key_insights": ["shared"]})));
        let t2 = thread(
            "t2",
            "2025-03-02T10:00:00Z",
            unit(json!({"key_insights": ["shared", "solo"]})),
        );
        let threads = vec![t1, t2];
        let combined = combine(
            &threads.iter().map(|t| t.analysis.clone()).collect::<Vec<_>>(),
            MergeCaps::persistent(),
        )
        .unwrap();

        let map = build_evidence_map(&combined.key_insights, &threads);
        assert_eq!(map["shared"], vec!["t1".to_string(), "t2".to_string()]);
        assert_eq!(map["solo"], vec!["t2".to_string()]);
    }

    #[test]
    fn time_filter_recombines_or_reports_no_data() {
        let mut combined = CombinedAnalysis::default();
        let early = thread("t1", "2025-03-01T10:00:00Z", unit(json!({"categories": ["Early"]})));
        let late = thread("t2", "2025-06-01T10:00:00Z", unit(json!({"categories": ["Late"]})));
        merge_into_combined(&mut combined, vec![early, late]).unwrap();

        let from_may = timeparse::parse_datetime("2025-05-01T00:00:00Z");
        let filtered = filter_by_time(&combined, from_may, None);
        assert_eq!(filtered.thread_results.len(), 1);
        assert_eq!(filtered.results.categories, vec!["Late"]);

        let far_future = timeparse::parse_datetime("2030-01-01T00:00:00Z");
        let empty = filter_by_time(&combined, far_future, None);
        assert!(empty.thread_results.is_empty());
        assert_eq!(
            empty.results.user_satisfaction.overall_assessment,
            "No data for selected time period"
        );
    }

    #[test]
    fn time_filter_recounts_provider_units() {
        let mut combined = CombinedAnalysis::default();
        let mut early_unit = unit(json!({"categories": ["Early"]}));
        early_unit.provider = "mock".to_string();
        let mut late_unit = unit(json!({"categories": ["Late"]}));
        late_unit.provider = "anthropic".to_string();
        let early = thread("t1", "2025-03-01T10:00:00Z", early_unit);
        let late = thread("t2", "2025-06-01T10:00:00Z", late_unit);
        merge_into_combined(&mut combined, vec![early, late]).unwrap();
        assert_eq!(combined.metadata.mock_units, 1);
        assert_eq!(combined.metadata.real_units, 1);

        let from_may = timeparse::parse_datetime("2025-05-01T00:00:00Z");
        let filtered = filter_by_time(&combined, from_may, None);
        assert_eq!(filtered.metadata.mock_units, 0);
        assert_eq!(filtered.metadata.real_units, 1);
    }
}
