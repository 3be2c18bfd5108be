use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::story::safety::SafetyVerdict;
use crate::story::Choice;

/// Prior story text: either one block or the ordered list of earlier segments.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StoryText {
    Whole(String),
    Segments(Vec<String>),
}

impl StoryText {
    pub fn joined(&self) -> String {
        match self {
            StoryText::Whole(text) => text.trim().to_string(),
            StoryText::Segments(parts) => parts
                .iter()
                .map(|p| p.trim())
                .filter(|p| !p.is_empty())
                .collect::<Vec<_>>()
                .join("\n\n"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CharacterInput {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub role: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinueStoryRequest {
    pub previous_story: Option<StoryText>,
    pub chosen_option: Option<String>,
    pub choice_index: Option<u32>,
    pub age_group: Option<String>,
    pub story_type: Option<String>,
    pub tone: Option<String>,
    pub characters: Option<Vec<CharacterInput>>,
    pub setting: Option<String>,
    pub theme: Option<String>,
    #[serde(default)]
    pub add_more_choices: bool,
    pub target_word_count: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateStoryRequest {
    pub prompt: Option<String>,
    pub age_group: Option<String>,
    pub story_type: Option<String>,
    pub length: Option<String>,
    pub characters: Option<Vec<CharacterInput>>,
    pub setting: Option<String>,
    pub theme: Option<String>,
    pub tone: Option<String>,
    pub word_limit: Option<usize>,
    pub custom_instructions: Option<String>,
    #[serde(default)]
    pub is_interactive: bool,
    pub choice_points: Option<u32>,
}

/// One turn of a free-form adventure: the current situation plus plain-text context.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdventureRequest {
    pub prompt: Option<String>,
    pub characters: Option<String>,
    pub story_history: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AdventureResponse {
    pub story: String,
    pub choices: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub characters: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinuationMetadata {
    pub word_count: usize,
    pub estimated_reading_time: usize,
    pub has_more_choices: bool,
    pub safety_check: SafetyVerdict,
    pub generation_time: u64,
    pub request_id: Uuid,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinueStoryResponse {
    pub success: bool,
    pub continuation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<Choice>>,
    pub metadata: ContinuationMetadata,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryMetadata {
    pub word_count: usize,
    pub estimated_reading_time: usize,
    pub safety_check: SafetyVerdict,
    pub generation_time: u64,
    pub is_interactive: bool,
    pub request_id: Uuid,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateStoryResponse {
    pub success: bool,
    pub story: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<Choice>>,
    pub metadata: StoryMetadata,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStatus {
    pub connected: bool,
    pub available_models: Vec<String>,
    pub active_requests: usize,
    pub max_concurrent_requests: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub success: bool,
    pub message: &'static str,
    pub supported_features: &'static [&'static str],
    pub status: BackendStatus,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
        }
    }
}
