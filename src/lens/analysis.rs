use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde_json::{Value, json};

use crate::lens::audit;
use crate::lens::config::AnalysisConfig;
use crate::lens::paths::LensPaths;
use crate::lens::schema::{self, AnalysisResult};

pub const PROVIDER_ANTHROPIC: &str = "anthropic";
pub const PROVIDER_MOCK: &str = "mock";

/// Sentinel api-key value that selects the mock backend explicitly.
pub const MOCK_SENTINEL: &str = "mock";

const ANTHROPIC_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// One analysis backend. Implementations return the canonical result shape;
/// callers that need never-fail semantics go through `analyze_unit`. Bounds
/// allow handing a backend to the batch worker thread.
pub trait Analyzer: Send + Sync {
    fn label(&self) -> &'static str;
    fn analyze(&self, content: &str) -> Result<AnalysisResult>;
}

/// Pick a backend from the resolved api key: absent, empty, or the literal
/// sentinel means mock, anything else goes to the real API.
pub fn select_analyzer(api_key: Option<&str>, cfg: &AnalysisConfig) -> Result<Box<dyn Analyzer>> {
    match api_key {
        None => Ok(Box::new(MockAnalyzer)),
        Some(key) if key.is_empty() || key == MOCK_SENTINEL => Ok(Box::new(MockAnalyzer)),
        Some(key) => Ok(Box::new(ClaudeAnalyzer::new(key.to_string(), cfg)?)),
    }
}

/// Analyze one unit with the degrade-to-mock policy: any failure from the
/// backend is logged and replaced with the fixed mock analysis, so a batch
/// always produces a report. The provider label on the result is the only
/// in-band trace of the substitution.
pub fn analyze_unit(analyzer: &dyn Analyzer, content: &str, paths: &LensPaths) -> AnalysisResult {
    match analyzer.analyze(content) {
        Ok(result) => result,
        Err(err) => {
            let _ = audit::append_event(
                paths,
                "analysis",
                "fallback",
                &format!("backend failed, substituting mock analysis: {err}"),
            );
            mock_analysis()
        }
    }
}

/// Analyze a sequence of chunks with a fixed inter-call delay. The mock
/// backend short-circuits to a single representative result regardless of
/// chunk count.
pub fn analyze_chunks(
    analyzer: &dyn Analyzer,
    chunks: &[String],
    rate_limit_ms: u64,
    paths: &LensPaths,
) -> Vec<AnalysisResult> {
    if analyzer.label() == PROVIDER_MOCK {
        return vec![mock_analysis()];
    }

    let mut results = Vec::with_capacity(chunks.len());
    for (i, chunk) in chunks.iter().enumerate() {
        results.push(analyze_unit(analyzer, chunk, paths));
        if i + 1 < chunks.len() && rate_limit_ms > 0 {
            thread::sleep(Duration::from_millis(rate_limit_ms));
        }
    }
    results
}

pub struct MockAnalyzer;

impl Analyzer for MockAnalyzer {
    fn label(&self) -> &'static str {
        PROVIDER_MOCK
    }

    fn analyze(&self, _content: &str) -> Result<AnalysisResult> {
        Ok(mock_analysis())
    }
}

pub struct ClaudeAnalyzer {
    client: reqwest::blocking::Client,
    api_key: String,
    model: String,
    max_output_tokens: u64,
}

impl ClaudeAnalyzer {
    pub fn new(api_key: String, cfg: &AnalysisConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .context("build analysis http client")?;
        Ok(Self {
            client,
            api_key,
            model: cfg.model.clone(),
            max_output_tokens: cfg.max_output_tokens,
        })
    }

    fn request_body(&self, content: &str) -> Value {
        json!({
            "model": self.model,
            "max_tokens": self.max_output_tokens,
            "temperature": 0.0,
            "messages": [{"role": "user", "content": analysis_prompt(content)}],
        })
    }
}

impl Analyzer for ClaudeAnalyzer {
    fn label(&self) -> &'static str {
        PROVIDER_ANTHROPIC
    }

    fn analyze(&self, content: &str) -> Result<AnalysisResult> {
        let response = self
            .client
            .post(ANTHROPIC_MESSAGES_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&self.request_body(content))
            .send()
            .context("send analysis request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(anyhow!("analysis endpoint returned {status}: {body}"));
        }

        let payload: Value = response.json().context("decode analysis response")?;
        let text = extract_response_text(&payload)
            .ok_or_else(|| anyhow!("analysis response carried no assistant text"))?;
        let parsed =
            recover_json(&text).ok_or_else(|| anyhow!("no recoverable JSON in model output"))?;

        let mut result = schema::sanitize_analysis(parsed);
        result.provider = PROVIDER_ANTHROPIC.to_string();
        Ok(result)
    }
}

fn analysis_prompt(content: &str) -> String {
    format!(
        "You are an expert conversation analyst. Below is a set of chat logs \
         between users and an assistant.\n\n```\n{content}\n```\n\nAnalyze \
         these conversations and respond with insights in the following JSON \
         format:\n\n1. \"categories\": the main categories of conversations \
         you observe\n2. \"top_discussions\": the top 5 most common discussion \
         topics, each as {{\"topic\": ..., \"count\": ...}}\n3. \
         \"response_quality\": {{\"average_score\": 1-10, \"good_examples\": \
         [...], \"poor_examples\": [...]}}\n4. \"improvement_areas\": specific \
         areas where the assistant could improve\n5. \"user_satisfaction\": \
         {{\"overall_assessment\": ..., \"positive_indicators\": [...], \
         \"negative_indicators\": [...]}}\n6. \"unmet_needs\": cases where \
         users did not get what they wanted\n7. \"product_effectiveness\": \
         {{\"assessment\": ..., \"strengths\": [...], \"weaknesses\": [...]}}\n\
         8. \"key_insights\": 3-5 key insights from your analysis\n9. \
         \"negative_chats\": {{\"categories\": [{{\"category\": ..., \
         \"count\": ..., \"examples\": [...]}}]}}\n\nImportant: return only \
         valid JSON. The entire response must be parseable as JSON."
    )
}

/// Pull the assistant text out of a messages-API payload.
pub fn extract_response_text(payload: &Value) -> Option<String> {
    let blocks = payload.get("content")?.as_array()?;
    let mut out = String::new();
    for block in blocks {
        if block.get("type").and_then(Value::as_str) == Some("text") {
            if let Some(text) = block.get("text").and_then(Value::as_str) {
                out.push_str(text);
            }
        }
    }
    if out.trim().is_empty() { None } else { Some(out) }
}

fn widest_object_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\{.*\}").unwrap())
}

/// Recover a JSON object from loosely formatted model output. Tried in
/// order: a ```json fence, any fence, a string-aware brace-balance scan from
/// the first `{`, and finally the widest `{...}` span.
pub fn recover_json(text: &str) -> Option<Value> {
    if let Some(fenced) = fenced_block(text, "```json") {
        if let Ok(value) = serde_json::from_str::<Value>(fenced.trim()) {
            if value.is_object() {
                return Some(value);
            }
        }
    }
    if let Some(fenced) = fenced_block(text, "```") {
        if let Ok(value) = serde_json::from_str::<Value>(fenced.trim()) {
            if value.is_object() {
                return Some(value);
            }
        }
    }
    if let Some(balanced) = balanced_object(text) {
        if let Ok(value) = serde_json::from_str::<Value>(balanced) {
            if value.is_object() {
                return Some(value);
            }
        }
    }
    if let Some(m) = widest_object_re().find(text) {
        if let Ok(value) = serde_json::from_str::<Value>(m.as_str()) {
            if value.is_object() {
                return Some(value);
            }
        }
    }
    None
}

fn fenced_block<'a>(text: &'a str, opener: &str) -> Option<&'a str> {
    let start = text.find(opener)? + opener.len();
    let rest = &text[start..];
    let end = rest.find("```")?;
    Some(&rest[..end])
}

/// Scan from the first `{` counting brace depth, skipping braces inside
/// string literals and escapes, and return the slice up to the matching
/// close brace.
fn balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// The fixed, documented mock analysis used when no real backend is
/// available or a real call fails.
pub fn mock_analysis() -> AnalysisResult {
    let value = json!({
        "categories": [
            "Music Production Assistance",
            "Songwriting Help",
            "Music Theory Questions",
            "Licensing & Copyright",
            "Music Business",
            "Genre Exploration"
        ],
        "top_discussions": [
            {"topic": "Song Structure Development", "count": 8},
            {"topic": "Genre Transformation", "count": 7},
            {"topic": "Lyric Writing", "count": 6},
            {"topic": "Production References", "count": 5},
            {"topic": "Music Licensing", "count": 4}
        ],
        "response_quality": {
            "average_score": 8.5,
            "good_examples": [
                "Asked about licensing, the assistant gave a comprehensive breakdown of license types, why they matter, and next steps.",
                "For a songwriting request, the assistant offered personalized lyric suggestions with clear steps for refining them.",
                "The assistant guided a user through choosing a production reference, asking clarifying questions along the way."
            ],
            "poor_examples": [
                "One request for specific drum patterns got only generic advice.",
                "A non-English inquiry was answered in English without acknowledging the language difference."
            ]
        },
        "improvement_areas": [
            "More specialized knowledge in music theory concepts",
            "Better handling of non-English inquiries",
            "More detailed guidance on technical aspects of music production",
            "More personalized responses based on the user's skill level",
            "Better continuity between conversations with the same user"
        ],
        "user_satisfaction": {
            "overall_assessment": "Users generally appear satisfied, particularly with guidance on song structure, genre transformation, and lyric writing. Satisfaction drops when technical production questions are not fully addressed.",
            "positive_indicators": [
                "Users often continue conversations after initial responses",
                "Multiple users engage in multi-message threads",
                "Users frequently adopt assistant suggestions",
                "Several users return for additional help on their projects"
            ],
            "negative_indicators": [
                "Some abandoned conversations after unclear responses",
                "Occasional repeated questions suggesting the first answer fell short",
                "Some users seek more technical production detail than provided"
            ]
        },
        "unmet_needs": [
            "Deeper technical production guidance",
            "Support for multiple languages",
            "More personalized feedback on uploaded music",
            "Better understanding of specific musical genres",
            "More detailed music business advice"
        ],
        "product_effectiveness": {
            "assessment": "The assistant serves well as a music production and songwriting helper, excelling at lyric generation, song structure guidance, and basic music business advice, with room to grow in technical depth.",
            "strengths": [
                "Personalized songwriting assistance",
                "Accessible explanations of music concepts",
                "Helpful guidance for genre exploration",
                "Good at maintaining engagement through conversation"
            ],
            "weaknesses": [
                "Limited technical depth for advanced producers",
                "Occasional misunderstanding of specific genre contexts",
                "Inconsistent handling of non-English requests"
            ]
        },
        "key_insights": [
            "Users most frequently seek help with song structure and genre transformation, suggesting these are challenging areas.",
            "The conversational format works well for songwriting, where an iterative approach helps users refine ideas.",
            "Users appreciate personalized feedback but want more technical depth in production guidance.",
            "There is significant interest in licensing and copyright, indicating concern about the business side of music.",
            "Feedback on uploaded music is highly valued by users."
        ]
    });

    let mut result = schema::sanitize_analysis(value);
    result.provider = PROVIDER_MOCK.to_string();
    result
}
