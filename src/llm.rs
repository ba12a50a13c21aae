//! Summarization and classification through an OpenAI compatible
//! chat-completions API.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use crate::{
    bookmarks::{normalize_tags, truncate_chars},
    config::{Config, LlmConfig},
    scrape::{with_retries, Transient},
};

pub const INTENT_TYPES: [&str; 5] = ["reference", "tutorial", "inspiration", "deep-dive", "tool"];
pub const TECHNICAL_LEVELS: [&str; 4] = ["beginner", "intermediate", "advanced", "general"];
pub const CONTENT_TYPES: [&str; 6] = ["article", "documentation", "video", "tool", "paper", "other"];

pub const MAX_TAGS: usize = 5;
const MAX_TITLE_CHARS: usize = 60;
const MAX_SUMMARY_CHARS: usize = 220;
const MAX_QUOTES: usize = 3;
const MAX_QUOTE_CHARS: usize = 300;
const CONTENT_HEAD_TAIL_CHARS: usize = 2000;

const SYSTEM_PROMPT: &str = "You are a helpful assistant that analyzes web content and provides \
structured metadata. Always respond with valid JSON only.";

#[derive(Debug, Clone, Default)]
pub struct AnalysisRequest {
    pub url: String,
    pub title: Option<String>,
    pub content: String,
    pub notes: Option<String>,
    pub folders: Vec<String>,
    pub use_nano_model: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Analysis {
    pub clean_title: String,
    pub ai_summary: String,
    pub auto_tags: Vec<String>,
    pub intent_type: String,
    pub technical_level: String,
    pub content_type: String,
    pub key_quotes: Vec<String>,
    pub suggested_folder: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM is not configured: missing api key")]
    NotConfigured,

    #[error("LLM request timed out")]
    Timeout,

    #[error("LLM request failed: {0}")]
    Request(String),

    #[error("LLM returned status {0}: {1}")]
    Status(u16, String),

    #[error("LLM returned malformed output: {0}")]
    Malformed(String),
}

impl Transient for LlmError {
    fn is_transient(&self) -> bool {
        match self {
            LlmError::Timeout | LlmError::Request(_) => true,
            LlmError::Status(code, _) => *code == 429 || *code >= 500,
            _ => false,
        }
    }
}

/// Capability used by the enrichment pipeline to turn page text into metadata.
pub trait LanguageModel: Send + Sync {
    fn analyze(&self, request: &AnalysisRequest) -> Result<Analysis, LlmError>;
}

/// Keeps the intro and the conclusion of long documents.
pub fn smart_truncate(content: &str) -> String {
    let len = content.chars().count();
    if len <= CONTENT_HEAD_TAIL_CHARS * 2 {
        return content.to_string();
    }

    let head: String = content.chars().take(CONTENT_HEAD_TAIL_CHARS).collect();
    let tail: String = content.chars().skip(len - CONTENT_HEAD_TAIL_CHARS).collect();
    format!("{head}\n\n[... middle content truncated ...]\n\n{tail}")
}

pub fn build_prompt(request: &AnalysisRequest) -> String {
    let content = smart_truncate(&request.content);
    let content = if content.trim().is_empty() {
        "No content extracted".to_string()
    } else {
        content
    };
    let folders = if request.folders.is_empty() {
        "None created yet".to_string()
    } else {
        request.folders.join(", ")
    };

    format!(
        r#"Analyze this bookmarked article and provide structured metadata.
If the content is missing or sparse, use the URL and title to infer the most likely metadata.

CONTEXT:
URL: {url}
Title: {title}
Content: {content}
User Notes: {notes}
Available Folders: {folders}

TASK:
Provide a JSON object with strictly these fields:
1. "clean_title": A clean, concise title (max 60 chars). Remove clickbait or site names if redundant.
2. "ai_summary": A single, dense summary (max 220 chars). Focus on "What is this?" and "Why save it?". No fluff.
3. "auto_tags": Array (3-5 items). Lowercase, hyphenated (e.g. "ai-agents", "python-dev").
4. "intent_type": EXACTLY one of: {intents}
5. "technical_level": EXACTLY one of: {levels}
6. "content_type": EXACTLY one of: {types}
7. "key_quotes": Array (0-3 short, impactful quotes). Leave empty if no specific quotes stand out.
8. "suggested_folder": EXACT NAME from 'Available Folders' or null if no fit.

OUTPUT FORMAT:
Return ONLY valid JSON. No markdown, no pre-amble, no code blocks."#,
        url = request.url,
        title = request.title.as_deref().unwrap_or("Unknown"),
        notes = request.notes.as_deref().unwrap_or("None provided"),
        intents = serde_json::json!(INTENT_TYPES),
        levels = serde_json::json!(TECHNICAL_LEVELS),
        types = serde_json::json!(CONTENT_TYPES),
    )
}

fn pick_enum(value: Option<&Value>, allowed: &[&str], default: &str) -> String {
    value
        .and_then(Value::as_str)
        .map(|v| v.trim().to_lowercase())
        .filter(|v| allowed.contains(&v.as_str()))
        .unwrap_or_else(|| default.to_string())
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s.clone()),
                    Value::Null => None,
                    other => Some(other.to_string()),
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Parses and clamps a model answer to the shape the store accepts.
pub fn parse_analysis(raw: &str, request: &AnalysisRequest) -> Result<Analysis, LlmError> {
    let raw = raw
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let value: Value =
        serde_json::from_str(raw).map_err(|err| LlmError::Malformed(err.to_string()))?;
    let obj = value
        .as_object()
        .ok_or_else(|| LlmError::Malformed("expected a JSON object".to_string()))?;

    let fallback_title = request
        .title
        .clone()
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| "Untitled".to_string());
    let clean_title = obj
        .get("clean_title")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .unwrap_or(fallback_title);

    let ai_summary = obj
        .get("ai_summary")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();

    let mut auto_tags = normalize_tags(string_list(obj.get("auto_tags")));
    auto_tags.truncate(MAX_TAGS);

    let key_quotes = string_list(obj.get("key_quotes"))
        .into_iter()
        .map(|q| truncate_chars(q.trim(), MAX_QUOTE_CHARS))
        .filter(|q| !q.is_empty())
        .take(MAX_QUOTES)
        .collect();

    let suggested_folder = obj
        .get("suggested_folder")
        .and_then(Value::as_str)
        .filter(|name| request.folders.iter().any(|f| f == name))
        .map(String::from);

    Ok(Analysis {
        clean_title: truncate_chars(&clean_title, MAX_TITLE_CHARS),
        ai_summary: truncate_chars(ai_summary, MAX_SUMMARY_CHARS),
        auto_tags,
        intent_type: pick_enum(obj.get("intent_type"), &INTENT_TYPES, "reference"),
        technical_level: pick_enum(obj.get("technical_level"), &TECHNICAL_LEVELS, "general"),
        content_type: pick_enum(obj.get("content_type"), &CONTENT_TYPES, "article"),
        key_quotes,
        suggested_folder,
    })
}

/// Strips a trailing `/openai` or `/v1` so both plain and Azure endpoints
/// can be configured the way their dashboards print them.
pub fn clean_endpoint(endpoint: &str) -> String {
    let mut cleaned = endpoint.trim().trim_end_matches('/');
    if let Some(stripped) = cleaned.strip_suffix("/openai") {
        cleaned = stripped;
    }
    if let Some(stripped) = cleaned.strip_suffix("/v1") {
        cleaned = stripped;
    }
    cleaned.to_string()
}

/// Builds the url of an OpenAI style `operation` (`chat/completions`, `embeddings`).
pub fn api_url(endpoint: &str, api_version: Option<&str>, model: &str, operation: &str) -> String {
    let endpoint = clean_endpoint(endpoint);
    match api_version {
        Some(version) => {
            format!("{endpoint}/openai/deployments/{model}/{operation}?api-version={version}")
        }
        None => format!("{endpoint}/v1/{operation}"),
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    max_completion_tokens: u32,
    response_format: ResponseFormat,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Chat-completions client. Settings are read on every call so config
/// reloads apply to queued work.
pub struct OpenAiModel {
    config: Arc<RwLock<Config>>,
}

impl OpenAiModel {
    pub fn new(config: Arc<RwLock<Config>>) -> Self {
        OpenAiModel { config }
    }

    fn settings(&self) -> LlmConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .llm
            .clone()
    }

    fn complete(&self, settings: &LlmConfig, model: &str, prompt: String) -> Result<String, LlmError> {
        let api_key = settings
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or(LlmError::NotConfigured)?;

        let url = api_url(
            &settings.endpoint,
            settings.api_version.as_deref(),
            model,
            "chat/completions",
        );

        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|err| LlmError::Request(err.to_string()))?;

        let body = ChatRequest {
            model: model.to_string(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: prompt,
                },
            ],
            max_completion_tokens: settings.max_completion_tokens,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        with_retries(model, || {
            let mut req = client.post(&url).json(&body);
            req = if settings.api_version.is_some() {
                req.header("api-key", api_key)
            } else {
                req.bearer_auth(api_key)
            };

            let resp = req.send().map_err(|err| {
                if err.is_timeout() {
                    LlmError::Timeout
                } else {
                    LlmError::Request(err.to_string())
                }
            })?;

            let status = resp.status();
            if !status.is_success() {
                let text = resp.text().unwrap_or_default();
                return Err(LlmError::Status(status.as_u16(), truncate_chars(&text, 200)));
            }

            let parsed: ChatResponse = resp
                .json()
                .map_err(|err| LlmError::Malformed(err.to_string()))?;

            parsed
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.message.content)
                .ok_or_else(|| LlmError::Malformed("response has no content".to_string()))
        })
    }
}

impl LanguageModel for OpenAiModel {
    fn analyze(&self, request: &AnalysisRequest) -> Result<Analysis, LlmError> {
        let settings = self.settings();
        let model = match (&settings.nano_model, request.use_nano_model) {
            (Some(nano), true) if !nano.is_empty() => nano.clone(),
            _ => settings.model.clone(),
        };

        log::debug!("analyzing {} with {model}", request.url);
        let raw = self.complete(&settings, &model, build_prompt(request))?;
        parse_analysis(&raw, request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> AnalysisRequest {
        AnalysisRequest {
            url: "https://example.com/post".to_string(),
            title: Some("Original".to_string()),
            content: "content".to_string(),
            folders: vec!["Rust".to_string(), "Reading".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_smart_truncate_keeps_head_and_tail() {
        let content = format!("{}{}{}", "a".repeat(2000), "m".repeat(1000), "z".repeat(2000));
        let out = smart_truncate(&content);

        assert!(out.starts_with(&"a".repeat(2000)));
        assert!(out.ends_with(&"z".repeat(2000)));
        assert!(out.contains("[... middle content truncated ...]"));
        assert!(!out.contains('m'));

        assert_eq!(smart_truncate("short"), "short");
    }

    #[test]
    fn test_parse_analysis_sanitizes_fields() {
        let raw = serde_json::json!({
            "clean_title": "t".repeat(80),
            "ai_summary": "s".repeat(300),
            "auto_tags": ["Rust Lang", "async", "tokio", "web", "io", "extra"],
            "intent_type": "Tutorial",
            "technical_level": "expert",
            "content_type": "blog",
            "key_quotes": ["q1", "q2", "q3", "q4"],
            "suggested_folder": "Rust"
        })
        .to_string();

        let analysis = parse_analysis(&raw, &request()).unwrap();
        assert_eq!(analysis.clean_title.len(), 60);
        assert_eq!(analysis.ai_summary.len(), 220);
        assert_eq!(analysis.auto_tags, vec!["rust-lang", "async", "tokio", "web", "io"]);
        assert_eq!(analysis.intent_type, "tutorial");
        assert_eq!(analysis.technical_level, "general");
        assert_eq!(analysis.content_type, "article");
        assert_eq!(analysis.key_quotes.len(), 3);
        assert_eq!(analysis.suggested_folder.as_deref(), Some("Rust"));
    }

    #[test]
    fn test_parse_analysis_rejects_unknown_folder_and_defaults_title() {
        let raw = r#"{"ai_summary": "x", "suggested_folder": "rust"}"#;
        let analysis = parse_analysis(raw, &request()).unwrap();

        assert_eq!(analysis.clean_title, "Original");
        assert_eq!(analysis.suggested_folder, None);
        assert!(analysis.auto_tags.is_empty());
    }

    #[test]
    fn test_parse_analysis_accepts_fenced_json() {
        let raw = "```json\n{\"clean_title\": \"Hi\"}\n```";
        assert_eq!(parse_analysis(raw, &request()).unwrap().clean_title, "Hi");
    }

    #[test]
    fn test_parse_analysis_malformed() {
        assert!(matches!(
            parse_analysis("not json", &request()),
            Err(LlmError::Malformed(_))
        ));
        assert!(matches!(
            parse_analysis("[1,2]", &request()),
            Err(LlmError::Malformed(_))
        ));
    }

    #[test]
    fn test_api_url() {
        assert_eq!(
            api_url("https://api.openai.com/v1/", None, "gpt", "chat/completions"),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            api_url(
                "https://res.openai.azure.com/openai",
                Some("2024-06-01"),
                "gpt-dep",
                "embeddings"
            ),
            "https://res.openai.azure.com/openai/deployments/gpt-dep/embeddings?api-version=2024-06-01"
        );
    }

    #[test]
    fn test_prompt_lists_folders() {
        let prompt = build_prompt(&request());
        assert!(prompt.contains("Available Folders: Rust, Reading"));
        assert!(prompt.contains("User Notes: None provided"));
    }

    #[test]
    fn test_missing_key_is_reported() {
        let model = OpenAiModel::new(Arc::new(RwLock::new(Config::default())));
        assert!(matches!(model.analyze(&request()), Err(LlmError::NotConfigured)));
    }
}
