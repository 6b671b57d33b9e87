use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Canonical post-normalization shape of one per-unit analysis. The model
/// upstream may return any subset of these fields, in wrong shapes (bare
/// strings for objects, key-name variants); `sanitize_analysis` owns turning
/// that into this fixed shape so nothing downstream has to duck-type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisResult {
    pub categories: Vec<String>,
    pub top_discussions: Vec<TopicCount>,
    pub response_quality: ResponseQuality,
    pub improvement_areas: Vec<ImprovementArea>,
    pub user_satisfaction: UserSatisfaction,
    pub unmet_needs: Vec<UnmetNeed>,
    pub product_effectiveness: ProductEffectiveness,
    pub key_insights: Vec<KeyInsight>,
    pub negative_chats: NegativeChats,
    /// Which backend produced this unit ("anthropic" or "mock").
    #[serde(skip_serializing_if = "String::is_empty")]
    pub provider: String,
    /// Set when the unit failed outright; errored units are excluded from
    /// aggregation but kept for the record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AnalysisResult {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicCount {
    pub topic: String,
    pub count: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub instances: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseQuality {
    pub average_score: f64,
    pub good_examples: Vec<String>,
    pub poor_examples: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImprovementArea {
    pub area: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub supporting_evidence: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserSatisfaction {
    pub overall_assessment: String,
    pub positive_indicators: Vec<String>,
    pub negative_indicators: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnmetNeed {
    pub need: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub supporting_evidence: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProductEffectiveness {
    pub assessment: String,
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyInsight {
    pub insight: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub supporting_evidence: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NegativeChats {
    pub categories: Vec<NegativeCategory>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NegativeCategory {
    pub category: String,
    pub count: u64,
    pub examples: Vec<String>,
}

/// One analyzed thread inside a combined report. Appended across runs,
/// never replaced; thread ids already present are skipped on later merges.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadResult {
    pub thread_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_message_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_time: Option<String>,
    pub message_count: u64,
    pub analysis: AnalysisResult,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisMetadata {
    pub id: String,
    pub timestamp: u64,
    pub date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub thread_ids: Vec<String>,
    pub first_analyzed_at: String,
    pub last_analyzed_at: String,
    pub total_threads_analyzed: usize,
    pub total_messages_analyzed: u64,
    /// How many contributing units came from the real backend vs the mock
    /// fallback, so synthetic data is visible in the report itself.
    pub real_units: usize,
    pub mock_units: usize,
}

/// Aggregated report: an AnalysisResult-shaped merge plus bookkeeping.
/// Persisted as `{"metadata": ..., "results": ..., "thread_results": ...}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CombinedAnalysis {
    pub metadata: AnalysisMetadata,
    pub results: AnalysisResult,
    pub thread_results: Vec<ThreadResult>,
}

impl CombinedAnalysis {
    pub fn contains_thread(&self, thread_id: &str) -> bool {
        self.thread_results.iter().any(|t| t.thread_id == thread_id)
    }
}

fn string_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        _ => None,
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };
    items.iter().filter_map(string_of).collect()
}

fn count_of(value: Option<&Value>) -> u64 {
    match value {
        Some(Value::Number(n)) => n.as_u64().or_else(|| n.as_f64().map(|f| f as u64)).unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse::<u64>().unwrap_or(0),
        _ => 0,
    }
}

fn score_of(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Pull the primary text out of a loosely-shaped item: the expected key,
/// then the `key` alias, then whichever string field the object carries.
fn primary_text(obj: &Map<String, Value>, primary: &str) -> Option<String> {
    if let Some(text) = obj.get(primary).and_then(string_of) {
        return Some(text);
    }
    if let Some(text) = obj.get("key").and_then(string_of) {
        return Some(text);
    }
    obj.values().find_map(string_of)
}

fn evidence_list(obj: &Map<String, Value>) -> Vec<String> {
    for key in ["supporting_evidence", "evidence", "examples"] {
        let list = string_list(obj.get(key));
        if !list.is_empty() {
            return list;
        }
    }
    Vec::new()
}

fn take_items(obj: &mut Map<String, Value>, field: &str) -> Vec<Value> {
    match obj.remove(field) {
        Some(Value::Array(items)) => items,
        Some(other @ Value::String(_)) | Some(other @ Value::Object(_)) => vec![other],
        _ => Vec::new(),
    }
}

fn sanitize_topic(item: Value) -> Option<TopicCount> {
    match item {
        Value::String(s) => {
            let topic = s.trim().to_string();
            if topic.is_empty() {
                return None;
            }
            Some(TopicCount {
                topic,
                count: 1,
                instances: Vec::new(),
            })
        }
        Value::Object(obj) => {
            let topic = primary_text(&obj, "topic")?;
            let mut count = count_of(obj.get("count"));
            if count == 0 {
                count = 1;
            }
            Some(TopicCount {
                topic,
                count,
                instances: string_list(obj.get("instances")),
            })
        }
        _ => None,
    }
}

fn sanitize_quality(value: Option<Value>) -> ResponseQuality {
    match value {
        Some(Value::Object(obj)) => {
            let average_score = obj
                .get("average_score")
                .or_else(|| obj.get("score"))
                .and_then(score_of)
                .unwrap_or(0.0);
            ResponseQuality {
                average_score,
                good_examples: string_list(obj.get("good_examples")),
                poor_examples: string_list(obj.get("poor_examples")),
            }
        }
        Some(ref scalar) if score_of(scalar).is_some() => ResponseQuality {
            average_score: score_of(scalar).unwrap_or(0.0),
            ..ResponseQuality::default()
        },
        _ => ResponseQuality::default(),
    }
}

fn sanitize_satisfaction(value: Option<Value>) -> UserSatisfaction {
    match value {
        Some(Value::Object(obj)) => UserSatisfaction {
            overall_assessment: obj
                .get("overall_assessment")
                .or_else(|| obj.get("assessment"))
                .and_then(string_of)
                .unwrap_or_default(),
            positive_indicators: string_list(obj.get("positive_indicators")),
            negative_indicators: string_list(obj.get("negative_indicators")),
        },
        Some(Value::String(s)) => UserSatisfaction {
            overall_assessment: s.trim().to_string(),
            ..UserSatisfaction::default()
        },
        _ => UserSatisfaction::default(),
    }
}

fn sanitize_effectiveness(value: Option<Value>) -> ProductEffectiveness {
    match value {
        Some(Value::Object(obj)) => ProductEffectiveness {
            assessment: obj
                .get("assessment")
                .or_else(|| obj.get("overall_assessment"))
                .and_then(string_of)
                .unwrap_or_default(),
            strengths: string_list(obj.get("strengths")),
            weaknesses: string_list(obj.get("weaknesses")),
        },
        Some(Value::String(s)) => ProductEffectiveness {
            assessment: s.trim().to_string(),
            ..ProductEffectiveness::default()
        },
        _ => ProductEffectiveness::default(),
    }
}

fn sanitize_negative_chats(value: Option<Value>) -> NegativeChats {
    let items = match value {
        Some(Value::Object(mut obj)) => take_items(&mut obj, "categories"),
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    };

    let categories = items
        .into_iter()
        .filter_map(|item| match item {
            Value::String(s) => {
                let category = s.trim().to_string();
                if category.is_empty() {
                    return None;
                }
                Some(NegativeCategory {
                    category,
                    count: 1,
                    examples: Vec::new(),
                })
            }
            Value::Object(obj) => {
                let category = primary_text(&obj, "category")?;
                let mut count = count_of(obj.get("count"));
                if count == 0 {
                    count = 1;
                }
                Some(NegativeCategory {
                    category,
                    count,
                    examples: string_list(obj.get("examples")),
                })
            }
            _ => None,
        })
        .collect();

    NegativeChats { categories }
}

/// Normalize a parsed model response into the canonical shape. Bare strings
/// are promoted to their object form, alternate keys remapped, missing
/// fields defaulted. Never fails; unusable values collapse to defaults.
pub fn sanitize_analysis(value: Value) -> AnalysisResult {
    let Value::Object(mut obj) = value else {
        return AnalysisResult::default();
    };

    let categories = take_items(&mut obj, "categories")
        .into_iter()
        .filter_map(|item| match item {
            Value::String(s) => {
                let trimmed = s.trim().to_string();
                (!trimmed.is_empty()).then_some(trimmed)
            }
            Value::Object(inner) => primary_text(&inner, "category"),
            _ => None,
        })
        .collect();

    let top_discussions = take_items(&mut obj, "top_discussions")
        .into_iter()
        .filter_map(sanitize_topic)
        .collect();

    let improvement_areas = take_items(&mut obj, "improvement_areas")
        .into_iter()
        .filter_map(|item| match item {
            Value::String(s) => {
                let area = s.trim().to_string();
                (!area.is_empty()).then(|| ImprovementArea {
                    area,
                    supporting_evidence: Vec::new(),
                })
            }
            Value::Object(inner) => Some(ImprovementArea {
                area: primary_text(&inner, "area")?,
                supporting_evidence: evidence_list(&inner),
            }),
            _ => None,
        })
        .collect();

    let unmet_needs = take_items(&mut obj, "unmet_needs")
        .into_iter()
        .filter_map(|item| match item {
            Value::String(s) => {
                let need = s.trim().to_string();
                (!need.is_empty()).then(|| UnmetNeed {
                    need,
                    supporting_evidence: Vec::new(),
                })
            }
            Value::Object(inner) => Some(UnmetNeed {
                need: primary_text(&inner, "need")?,
                supporting_evidence: evidence_list(&inner),
            }),
            _ => None,
        })
        .collect();

    let key_insights = take_items(&mut obj, "key_insights")
        .into_iter()
        .filter_map(|item| match item {
            Value::String(s) => {
                let insight = s.trim().to_string();
                (!insight.is_empty()).then(|| KeyInsight {
                    insight,
                    supporting_evidence: Vec::new(),
                })
            }
            Value::Object(inner) => Some(KeyInsight {
                insight: primary_text(&inner, "insight")?,
                supporting_evidence: evidence_list(&inner),
            }),
            _ => None,
        })
        .collect();

    AnalysisResult {
        categories,
        top_discussions,
        response_quality: sanitize_quality(obj.remove("response_quality")),
        improvement_areas,
        user_satisfaction: sanitize_satisfaction(obj.remove("user_satisfaction")),
        unmet_needs,
        product_effectiveness: sanitize_effectiveness(obj.remove("product_effectiveness")),
        key_insights,
        negative_chats: sanitize_negative_chats(obj.remove("negative_chats")),
        provider: String::new(),
        error: obj.get("error").and_then(string_of),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bare_strings_are_promoted_to_objects() {
        let got = sanitize_analysis(json!({
            "key_insights": ["users want depth"],
            "improvement_areas": ["faster answers"],
            "unmet_needs": ["multi-language support"],
        }));
        assert_eq!(got.key_insights[0].insight, "users want depth");
        assert_eq!(got.improvement_areas[0].area, "faster answers");
        assert_eq!(got.unmet_needs[0].need, "multi-language support");
    }

    #[test]
    fn alternate_keys_are_remapped() {
        let got = sanitize_analysis(json!({
            "key_insights": [{"key": "insight under alias"}],
            "top_discussions": [{"name": "Mixing", "count": 3}],
        }));
        assert_eq!(got.key_insights[0].insight, "insight under alias");
        assert_eq!(got.top_discussions[0].topic, "Mixing");
        assert_eq!(got.top_discussions[0].count, 3);
    }

    #[test]
    fn bare_string_topics_get_count_one() {
        let got = sanitize_analysis(json!({"top_discussions": ["Lyrics"]}));
        assert_eq!(got.top_discussions[0].topic, "Lyrics");
        assert_eq!(got.top_discussions[0].count, 1);
    }

    #[test]
    fn quality_accepts_score_alias_and_bare_number() {
        let aliased = sanitize_analysis(json!({"response_quality": {"score": 7.5}}));
        assert_eq!(aliased.response_quality.average_score, 7.5);

        let bare = sanitize_analysis(json!({"response_quality": 6}));
        assert_eq!(bare.response_quality.average_score, 6.0);
    }

    #[test]
    fn string_satisfaction_becomes_assessment() {
        let got = sanitize_analysis(json!({"user_satisfaction": "mostly happy"}));
        assert_eq!(got.user_satisfaction.overall_assessment, "mostly happy");
        assert!(got.user_satisfaction.positive_indicators.is_empty());
    }

    #[test]
    fn missing_fields_default_and_non_object_collapses() {
        let got = sanitize_analysis(json!({"categories": ["Support"]}));
        assert_eq!(got.categories, vec!["Support".to_string()]);
        assert!(got.top_discussions.is_empty());
        assert_eq!(got.response_quality.average_score, 0.0);

        assert_eq!(sanitize_analysis(json!("just text")), AnalysisResult::default());
    }

    #[test]
    fn negative_chat_categories_are_normalized() {
        let got = sanitize_analysis(json!({
            "negative_chats": {"categories": [
                {"category": "Confusion", "count": 2, "examples": ["e1"]},
                "Latency",
            ]}
        }));
        assert_eq!(got.negative_chats.categories.len(), 2);
        assert_eq!(got.negative_chats.categories[0].count, 2);
        assert_eq!(got.negative_chats.categories[1].category, "Latency");
        assert_eq!(got.negative_chats.categories[1].count, 1);
    }

    #[test]
    fn error_key_is_carried_through() {
        let got = sanitize_analysis(json!({"error": "upstream timeout"}));
        assert!(got.is_error());
        assert_eq!(got.error.as_deref(), Some("upstream timeout"));
    }
}
