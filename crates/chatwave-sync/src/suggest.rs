//! File suggestion helper.
//!
//! Given the active conversation's transcript and a catalogue of file
//! names, ask a language model which files are worth sharing. The call is
//! a plain request/response outside the sync core; whatever the model
//! answers is filtered down to names that are actually in the catalogue.

use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SuggestRequest {
    pub conversation_history: String,
    #[serde(default)]
    pub available_files: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SuggestResponse {
    #[serde(default)]
    pub suggested_files: Vec<String>,
}

#[derive(Error, Debug)]
pub enum SuggestError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("model endpoint returned status {0}")]
    Status(u16),

    #[error("malformed model reply: {0}")]
    Malformed(String),
}

pub trait FileSuggester: Send + Sync {
    fn suggest<'a>(&'a self, request: &'a SuggestRequest) -> BoxFuture<'a, Result<Vec<String>, SuggestError>>;
}

/// Endpoint settings of an OpenAI-compatible chat-completions API.
#[derive(Debug, Clone)]
pub struct SuggestConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout: Duration,
}

impl SuggestConfig {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: None,
            model: model.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

pub struct HttpSuggester {
    client: reqwest::Client,
    config: SuggestConfig,
}

impl HttpSuggester {
    pub fn new(config: SuggestConfig) -> Result<Self, SuggestError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    async fn call(&self, request: &SuggestRequest) -> Result<Vec<String>, SuggestError> {
        if request.available_files.is_empty() {
            return Ok(Vec::new());
        }

        let body = json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": "Reply with a JSON object of the form {\"suggestedFiles\": [\"name\", ...]}."},
                {"role": "user", "content": build_prompt(request)},
            ],
            "response_format": {"type": "json_object"},
            "temperature": 0,
        });

        let mut builder = self.client.post(&self.config.endpoint).json(&body);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), "suggestion endpoint rejected request");
            return Err(SuggestError::Status(status.as_u16()));
        }

        let reply: ChatCompletion = response.json().await?;
        let content = reply
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| SuggestError::Malformed("no choices".into()))?;

        let suggested = parse_suggestions(&content)?;
        let kept = filter_to_catalogue(suggested, &request.available_files);
        debug!(suggested = kept.len(), "file suggestions received");
        Ok(kept)
    }
}

impl FileSuggester for HttpSuggester {
    fn suggest<'a>(&'a self, request: &'a SuggestRequest) -> BoxFuture<'a, Result<Vec<String>, SuggestError>> {
        Box::pin(self.call(request))
    }
}

/// Answers every request with a fixed list (still catalogue-filtered).
#[derive(Debug, Clone, Default)]
pub struct FixtureSuggester {
    files: Vec<String>,
}

impl FixtureSuggester {
    pub fn new(files: Vec<String>) -> Self {
        Self { files }
    }
}

impl FileSuggester for FixtureSuggester {
    fn suggest<'a>(&'a self, request: &'a SuggestRequest) -> BoxFuture<'a, Result<Vec<String>, SuggestError>> {
        let kept = filter_to_catalogue(self.files.clone(), &request.available_files);
        Box::pin(async move { Ok(kept) })
    }
}

#[derive(Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: String,
}

pub fn build_prompt(request: &SuggestRequest) -> String {
    let files: String = request
        .available_files
        .iter()
        .map(|f| format!("- {f}\n"))
        .collect();

    format!(
        "You are an AI assistant helping users find relevant files to share in a chat.\n\n\
         Given the following conversation history and a list of available files, \
         suggest which files are most relevant to the conversation.\n\n\
         Conversation History:\n{}\n\n\
         Available Files:\n{}\n\
         Only return file names from the provided list of available files.\n\
         If none of the files seem relevant, return an empty array.\n\
         Do not add any other explanation.\n",
        request.conversation_history, files
    )
}

/// Accepts `{"suggestedFiles": [...]}` or a bare array, optionally inside
/// a fenced code block.
pub fn parse_suggestions(content: &str) -> Result<Vec<String>, SuggestError> {
    let trimmed = content.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    if let Ok(response) = serde_json::from_str::<SuggestResponse>(unfenced) {
        return Ok(response.suggested_files);
    }
    serde_json::from_str::<Vec<String>>(unfenced)
        .map_err(|e| SuggestError::Malformed(e.to_string()))
}

/// Keep names present in `catalogue`, in reply order, without duplicates.
pub fn filter_to_catalogue(suggested: Vec<String>, catalogue: &[String]) -> Vec<String> {
    let mut kept: Vec<String> = Vec::new();
    for name in suggested {
        let name = name.trim().to_string();
        if catalogue.contains(&name) && !kept.contains(&name) {
            kept.push(name);
        }
    }
    kept
}
