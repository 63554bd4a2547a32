//! Messages-style chat completion provider used by the analyzing stage.
//!
//! The LLM answers synchronously, so [`Provider::submit`] always returns
//! [`Submission::Ready`] and there is nothing to poll.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::http::HttpClient;
use super::{Provider, StageInput, Submission, TaskStatus};
use crate::error::ProviderError;
use crate::state_machine::{Analysis, ModelChoice, StageOutput};

const API_URL: &str = "https://api.anthropic.com/v1/messages";

/// Request body for the `/v1/messages` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesRequest {
    pub model: String,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// "user" or "assistant".
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub id: String,
    pub content: Vec<ContentBlock>,
    pub model: String,
    pub stop_reason: Option<String>,
    pub usage: Usage,
}

/// A content block of the response. Serialized with a `"type"` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Map a [`ModelChoice`] to the API model identifier.
pub fn model_for_choice(choice: ModelChoice) -> &'static str {
    match choice {
        ModelChoice::Fast => "claude-haiku-4-5",
        ModelChoice::Balanced => "claude-sonnet-4-5",
        ModelChoice::Best => "claude-opus-4-1",
    }
}

const SYSTEM_PROMPT: &str = "You are the creative director of a short music video. \
Respond with ONLY valid JSON, no other text.\n\
Format: {\"title\": string, \"music_prompt\": string, \"image_prompt\": string, \
\"style\": string, \"tags\": [string]}\n\
music_prompt describes genre, mood and tempo for a music generator. \
image_prompt describes a single cover image. tags are short lowercase genre/mood keywords.";

pub struct LlmProvider {
    api_key: String,
    base_url: String,
    http: HttpClient,
}

impl LlmProvider {
    pub fn new(api_key: String, base_url: Option<String>, http: HttpClient) -> Self {
        Self {
            api_key,
            base_url: base_url.unwrap_or_else(|| API_URL.to_string()),
            http,
        }
    }

    pub async fn send_message(&self, req: &MessagesRequest) -> Result<MessagesResponse, ProviderError> {
        self.http
            .send_json(|client| {
                client
                    .post(&self.base_url)
                    .header("x-api-key", &self.api_key)
                    .header("anthropic-version", "2023-06-01")
                    .header("content-type", "application/json")
                    .json(req)
            })
            .await
    }
}

/// Build the analysis request for a concept.
pub fn analysis_request(concept: &str, choice: ModelChoice) -> MessagesRequest {
    MessagesRequest {
        model: model_for_choice(choice).to_string(),
        max_tokens: 1024,
        system: Some(SYSTEM_PROMPT.to_string()),
        messages: vec![Message {
            role: "user".into(),
            content: format!("Concept: {concept}"),
        }],
    }
}

/// Extract the analysis JSON from the model's text, tolerating a surrounding code fence.
pub fn parse_analysis(response: &MessagesResponse) -> Result<Analysis, ProviderError> {
    let text: String = response
        .content
        .iter()
        .filter(|b| b.content_type == "text")
        .map(|b| b.text.as_str())
        .collect();
    let trimmed = text.trim();
    let json = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if end > start => &trimmed[start..=end],
        _ => {
            return Err(ProviderError::InvalidResponse(
                "analysis response contains no JSON object".into(),
            ));
        }
    };
    let analysis: Analysis = serde_json::from_str(json)
        .map_err(|e| ProviderError::InvalidResponse(format!("failed to parse analysis: {e}")))?;
    if analysis.music_prompt.trim().is_empty() || analysis.image_prompt.trim().is_empty() {
        return Err(ProviderError::InvalidResponse(
            "analysis is missing a music or image prompt".into(),
        ));
    }
    Ok(analysis)
}

#[async_trait]
impl Provider for LlmProvider {
    fn name(&self) -> &str {
        "llm"
    }

    fn supports_callbacks(&self) -> bool {
        false
    }

    async fn submit(&self, input: &StageInput) -> Result<Submission, ProviderError> {
        let req = analysis_request(&input.concept, input.model_choice);
        let response = self.send_message(&req).await?;
        let analysis = parse_analysis(&response)?;
        Ok(Submission::Ready(StageOutput::Analysis(analysis)))
    }

    async fn fetch_status(&self, task_id: &str) -> Result<TaskStatus, ProviderError> {
        Err(ProviderError::InvalidResponse(format!(
            "llm provider has no asynchronous tasks (asked for {task_id})"
        )))
    }

    fn parse_callback(&self, _body: &serde_json::Value) -> Result<(String, TaskStatus), ProviderError> {
        Err(ProviderError::InvalidResponse(
            "llm provider does not send callbacks".into(),
        ))
    }
}
