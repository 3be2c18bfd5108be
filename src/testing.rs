//! Scripted backend shared by the pipeline and handler tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use futures::StreamExt;

use crate::config::Settings;
use crate::limit::RateLimiter;
use crate::model::{ChunkStream, GenerateOptions, Generation, InferenceError, StreamChunk, TextGenerator};
use crate::story::Orchestrator;
use crate::web::models::{CharacterInput, ContinueStoryRequest, StoryText};

pub const GOOD_REPLY: &str = "STORY: Mia stepped into the glowing cave and met a friendly fox. \
The fox wagged its tail and pointed at a hidden door.\n\nCHOICES:\nA: Open the hidden door\n\
B: Follow the fox deeper\nC: Run back to find her brother";

#[derive(Debug, Clone)]
pub struct GenerateCall {
    pub prompt: String,
    pub options: GenerateOptions,
}

pub struct ScriptedGenerator {
    connected: bool,
    replies: Mutex<VecDeque<Result<String, InferenceError>>>,
    chunks: Mutex<Vec<Result<StreamChunk, InferenceError>>>,
    stream_refusal: Option<String>,
    calls: Mutex<Vec<GenerateCall>>,
    connection_checks: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn replying(replies: impl IntoIterator<Item = Result<String, InferenceError>>) -> Self {
        Self {
            connected: true,
            replies: Mutex::new(replies.into_iter().collect()),
            chunks: Mutex::new(Vec::new()),
            stream_refusal: None,
            calls: Mutex::new(Vec::new()),
            connection_checks: AtomicUsize::new(0),
        }
    }

    pub fn offline() -> Self {
        Self {
            connected: false,
            ..Self::replying([])
        }
    }

    pub fn streaming(chunks: &[&str]) -> Self {
        let generator = Self::replying([]);
        let last = chunks.len().saturating_sub(1);
        *generator.chunks.lock().unwrap() = chunks
            .iter()
            .enumerate()
            .map(|(i, text)| {
                Ok(StreamChunk {
                    response: text.to_string(),
                    done: i == last,
                })
            })
            .collect();
        generator
    }

    /// Streams fail the way the client rejects a bad prompt.
    pub fn refusing_streams(message: &str) -> Self {
        Self {
            stream_refusal: Some(message.to_string()),
            ..Self::replying([])
        }
    }

    pub fn calls(&self) -> Vec<GenerateCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn connection_checks(&self) -> usize {
        self.connection_checks.load(Ordering::SeqCst)
    }

    fn record(&self, prompt: &str, options: &GenerateOptions) {
        self.calls.lock().unwrap().push(GenerateCall {
            prompt: prompt.to_string(),
            options: options.clone(),
        });
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(&self, prompt: &str, options: GenerateOptions) -> Result<Generation, InferenceError> {
        self.record(prompt, &options);
        let reply = self.replies.lock().unwrap().pop_front().unwrap_or(Err(InferenceError::Backend {
            status: 500,
            body: "no scripted reply".to_string(),
        }))?;
        Ok(Generation {
            model: options.model.unwrap_or_default(),
            text: reply,
            eval_count: None,
        })
    }

    async fn generate_stream(&self, prompt: &str, options: GenerateOptions) -> Result<ChunkStream, InferenceError> {
        self.record(prompt, &options);
        if let Some(message) = &self.stream_refusal {
            return Err(InferenceError::InvalidInput(message.clone()));
        }
        let chunks = std::mem::take(&mut *self.chunks.lock().unwrap());
        Ok(stream::iter(chunks).boxed())
    }

    async fn test_connection(&self) -> bool {
        self.connection_checks.fetch_add(1, Ordering::SeqCst);
        self.connected
    }

    async fn list_models(&self) -> Result<Vec<String>, InferenceError> {
        Ok(vec!["primary:latest".to_string(), "fallback:latest".to_string()])
    }

    fn active_requests(&self) -> usize {
        0
    }

    fn max_concurrent_requests(&self) -> usize {
        5
    }
}

pub fn test_settings() -> Settings {
    Settings {
        primary_model: "primary:latest".to_string(),
        fallback_model: "fallback:latest".to_string(),
        ..Settings::default()
    }
}

pub fn orchestrator(generator: Arc<ScriptedGenerator>, limit: u32) -> Orchestrator {
    let settings = test_settings();
    let limiter = Arc::new(RateLimiter::new(limit, Duration::from_secs(60)));
    Orchestrator::from_settings(&settings, limiter, generator).unwrap()
}

pub fn continue_request() -> ContinueStoryRequest {
    ContinueStoryRequest {
        previous_story: Some(StoryText::Whole(
            "Mia found a map under her bed. It showed a cave behind the old mill.".to_string(),
        )),
        chosen_option: Some("Go to the cave".to_string()),
        age_group: Some("5-8".to_string()),
        story_type: Some("adventure".to_string()),
        characters: Some(vec![CharacterInput {
            name: "Mia".to_string(),
            description: "a curious girl".to_string(),
            role: Some("protagonist".to_string()),
        }]),
        add_more_choices: true,
        ..ContinueStoryRequest::default()
    }
}
