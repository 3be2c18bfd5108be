use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::BoxStream;
use futures::StreamExt;
use log::{debug, error, info, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::config::Settings;
use crate::error::StoryError;
use crate::limit::RateLimiter;
use crate::model::{GenerateOptions, InferenceError, StreamChunk, TextGenerator};
use crate::web::models::{AdventureRequest, BackendStatus, ContinueStoryRequest, GenerateStoryRequest};

use super::parse::parse_with_choices;
use super::prompt::{
    continuation_temperature, default_word_limit, new_story_temperature, token_budget, PromptBuilder, PromptError,
    PromptStyle,
};
use super::safety::{term_issues, SafetyValidator, SafetyVerdict};
use super::title::story_title;
use super::{reading_minutes, word_count, AdventureTurn, Choice, GeneratedSegment, GenerationRequest, NewStoryRequest};

const CONTINUATION_TOKEN_CAP: usize = 1000;
const NEW_STORY_TOKEN_CAP: usize = 3000;
const ADVENTURE_PLAN: SamplingPlan = SamplingPlan {
    temperature: 0.8,
    max_tokens: 500,
};

/// One rung of the model ladder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelProfile {
    pub model: String,
    pub style: PromptStyle,
}

/// Primary then fallback, tried in that order and never more.
#[derive(Debug, Clone)]
pub struct ModelLadder {
    rungs: [ModelProfile; 2],
}

impl ModelLadder {
    pub fn new(primary: &str, fallback: &str) -> Self {
        Self {
            rungs: [
                ModelProfile {
                    model: primary.to_string(),
                    style: PromptStyle::Full,
                },
                ModelProfile {
                    model: fallback.to_string(),
                    style: PromptStyle::Compact,
                },
            ],
        }
    }

    pub fn primary(&self) -> &ModelProfile {
        &self.rungs[0]
    }

    pub fn models(&self) -> Vec<&str> {
        self.rungs.iter().map(|r| r.model.as_str()).collect()
    }

    fn profile(&self, state: Attempt) -> Option<&ModelProfile> {
        match state {
            Attempt::Primary => Some(&self.rungs[0]),
            Attempt::Fallback => Some(&self.rungs[1]),
            Attempt::Failed => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Primary,
    Fallback,
    Failed,
}

impl Attempt {
    fn next(self) -> Self {
        match self {
            Attempt::Primary => Attempt::Fallback,
            Attempt::Fallback | Attempt::Failed => Attempt::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SamplingPlan {
    temperature: f32,
    max_tokens: u32,
}

/// A successful continuation with everything the response needs.
#[derive(Debug, Clone)]
pub struct Continuation {
    pub request_id: Uuid,
    pub segment: GeneratedSegment,
    pub verdict: SafetyVerdict,
    pub word_count: usize,
    pub reading_minutes: usize,
    pub has_more_choices: bool,
    pub generation_time: Duration,
}

#[derive(Debug, Clone)]
pub struct NewStory {
    pub request_id: Uuid,
    pub title: String,
    pub segment: GeneratedSegment,
    pub verdict: SafetyVerdict,
    pub word_count: usize,
    pub reading_minutes: usize,
    pub interactive: bool,
    pub generation_time: Duration,
}

#[derive(Debug, Clone)]
pub struct AdventureScene {
    pub request_id: Uuid,
    pub segment: GeneratedSegment,
    pub generation_time: Duration,
}

/// Line emitted on a streamed continuation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StreamEvent {
    Chunk(StreamChunk),
    Error { error: String, done: bool },
}

pub struct Orchestrator {
    limiter: Arc<RateLimiter>,
    generator: Arc<dyn TextGenerator>,
    prompts: PromptBuilder,
    safety: SafetyValidator,
    ladder: ModelLadder,
}

impl Orchestrator {
    pub fn new(
        limiter: Arc<RateLimiter>,
        generator: Arc<dyn TextGenerator>,
        prompts: PromptBuilder,
        safety: SafetyValidator,
        ladder: ModelLadder,
    ) -> Self {
        Self {
            limiter,
            generator,
            prompts,
            safety,
            ladder,
        }
    }

    pub fn from_settings(
        settings: &Settings,
        limiter: Arc<RateLimiter>,
        generator: Arc<dyn TextGenerator>,
    ) -> Result<Self, PromptError> {
        Ok(Self::new(
            limiter,
            generator,
            PromptBuilder::new(settings.word_ranges, settings.max_context_chars)?,
            SafetyValidator::new(settings.safety.clone()),
            ModelLadder::new(&settings.primary_model, &settings.fallback_model),
        ))
    }

    /// Generates the next story segment for the reader's chosen option.
    pub async fn continue_story(
        &self,
        client_id: &str,
        input: &ContinueStoryRequest,
    ) -> Result<Continuation, StoryError> {
        let started = Instant::now();
        let request_id = Uuid::new_v4();

        self.admit(client_id)?;
        let request = GenerationRequest::from_input(input)?;
        self.ensure_backend().await?;

        let target = self.prompts.target_words(&request);
        let plan = SamplingPlan {
            temperature: continuation_temperature(request.story_type, request.tone),
            max_tokens: token_budget(target, CONTINUATION_TOKEN_CAP),
        };
        info!(
            "[{}] Continuing {} story for {} (target {} words, choices: {})",
            request_id, request.story_type, request.age_band, target, request.add_more_choices
        );

        let segment = self
            .run_ladder(
                request_id,
                |style| self.prompts.build_styled(&request, style),
                plan,
                request.add_more_choices,
            )
            .await?;

        let verdict = self.check_safety(request_id, &segment)?;
        let words = word_count(&segment.story);
        let generation_time = started.elapsed();
        info!("[{}] Continuation ready in {:?} ({} words)", request_id, generation_time, words);

        Ok(Continuation {
            request_id,
            segment,
            verdict,
            word_count: words,
            reading_minutes: reading_minutes(words),
            has_more_choices: request.add_more_choices,
            generation_time,
        })
    }

    /// Generates a brand-new story from a free-text prompt.
    pub async fn generate_story(&self, client_id: &str, input: &GenerateStoryRequest) -> Result<NewStory, StoryError> {
        let started = Instant::now();
        let request_id = Uuid::new_v4();

        self.admit(client_id)?;
        let request = NewStoryRequest::from_input(input)?;
        self.ensure_backend().await?;

        let word_limit = request
            .word_limit
            .unwrap_or_else(|| default_word_limit(request.age_band, request.length));
        let plan = SamplingPlan {
            temperature: new_story_temperature(request.story_type, request.tone),
            max_tokens: token_budget(word_limit, NEW_STORY_TOKEN_CAP),
        };
        info!(
            "[{}] New {} story for {} (about {} words, interactive: {})",
            request_id, request.story_type, request.age_band, word_limit, request.interactive
        );

        // New stories have one template; both rungs render it.
        let segment = self
            .run_ladder(
                request_id,
                |_| self.prompts.build_new_story(&request),
                plan,
                request.interactive,
            )
            .await?;

        let verdict = self.check_safety(request_id, &segment)?;
        let words = word_count(&segment.story);

        Ok(NewStory {
            request_id,
            title: story_title(&segment.story, request.story_type, request.interactive),
            segment,
            verdict,
            word_count: words,
            reading_minutes: reading_minutes(words),
            interactive: request.interactive,
            generation_time: started.elapsed(),
        })
    }

    /// Plays one turn of a free-form adventure. Always asks for three choices.
    pub async fn continue_adventure(
        &self,
        client_id: &str,
        input: &AdventureRequest,
    ) -> Result<AdventureScene, StoryError> {
        let started = Instant::now();
        let request_id = Uuid::new_v4();

        self.admit(client_id)?;
        let turn = AdventureTurn::from_input(input)?;
        self.ensure_backend().await?;
        info!("[{}] Adventure turn: {}", request_id, turn.situation);

        let segment = self
            .run_ladder(
                request_id,
                |style| self.prompts.build_adventure(&turn, style),
                ADVENTURE_PLAN,
                true,
            )
            .await?;
        self.check_safety(request_id, &segment)?;

        Ok(AdventureScene {
            request_id,
            segment,
            generation_time: started.elapsed(),
        })
    }

    /// Streams a continuation from the primary model. The text is scanned for
    /// disallowed terms as it accumulates; a hit ends the stream with an error line.
    pub async fn stream_continuation(
        &self,
        client_id: &str,
        input: &ContinueStoryRequest,
    ) -> Result<BoxStream<'static, StreamEvent>, StoryError> {
        self.admit(client_id)?;
        let request = GenerationRequest::from_input(input)?;
        self.ensure_backend().await?;

        let primary = self.ladder.primary();
        let prompt = self.prompts.build_styled(&request, primary.style)?;
        let target = self.prompts.target_words(&request);
        let options = GenerateOptions {
            model: Some(primary.model.clone()),
            temperature: Some(continuation_temperature(request.story_type, request.tone)),
            max_tokens: Some(token_budget(target, CONTINUATION_TOKEN_CAP)),
        };

        let chunks = self
            .generator
            .generate_stream(&prompt, options)
            .await
            .map_err(StoryError::from)?;

        Ok(guard_stream(chunks))
    }

    pub fn models(&self) -> Vec<&str> {
        self.ladder.models()
    }

    pub async fn backend_status(&self) -> BackendStatus {
        let connected = self.generator.test_connection().await;
        let available_models = if connected {
            self.generator.list_models().await.unwrap_or_else(|e| {
                error!("Failed to get models for status: {}", e);
                Vec::new()
            })
        } else {
            Vec::new()
        };
        BackendStatus {
            connected,
            available_models,
            active_requests: self.generator.active_requests(),
            max_concurrent_requests: self.generator.max_concurrent_requests(),
        }
    }

    fn admit(&self, client_id: &str) -> Result<(), StoryError> {
        let decision = self.limiter.admit(client_id);
        if decision.allowed {
            debug!("Admitted {} ({} remaining)", client_id, decision.remaining);
            Ok(())
        } else {
            Err(StoryError::TooManyRequests(decision))
        }
    }

    async fn ensure_backend(&self) -> Result<(), StoryError> {
        if self.generator.test_connection().await {
            Ok(())
        } else {
            error!("Story generation backend is unreachable");
            Err(StoryError::ServiceUnavailable)
        }
    }

    async fn run_ladder<F>(
        &self,
        request_id: Uuid,
        build_prompt: F,
        plan: SamplingPlan,
        want_choices: bool,
    ) -> Result<GeneratedSegment, StoryError>
    where
        F: Fn(PromptStyle) -> Result<String, PromptError>,
    {
        let mut state = Attempt::Primary;
        let mut last_error: Option<InferenceError> = None;

        while let Some(profile) = self.ladder.profile(state) {
            // Template problems are configuration errors: fatal, not retried.
            let prompt = build_prompt(profile.style)?;

            match self.attempt(profile, &prompt, plan, want_choices).await {
                Ok(segment) => {
                    info!("[{}] {:?} attempt succeeded", request_id, state);
                    return Ok(segment);
                }
                // The prompt itself was refused; another model would refuse it too.
                Err(e @ InferenceError::InvalidInput(_)) => {
                    warn!("[{}] Prompt rejected before generation: {}", request_id, e);
                    return Err(e.into());
                }
                Err(e) => {
                    warn!("[{}] {:?} model {} failed: {}", request_id, state, profile.model, e);
                    last_error = Some(e);
                    state = state.next();
                }
            }
        }

        let message = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no model attempted".to_string());
        error!("[{}] All models failed: {}", request_id, message);
        Err(StoryError::GenerationFailed(message))
    }

    async fn attempt(
        &self,
        profile: &ModelProfile,
        prompt: &str,
        plan: SamplingPlan,
        want_choices: bool,
    ) -> Result<GeneratedSegment, InferenceError> {
        let options = GenerateOptions {
            model: Some(profile.model.clone()),
            temperature: Some(plan.temperature),
            max_tokens: Some(plan.max_tokens),
        };
        let generation = self.generator.generate(prompt, options).await?;
        info!(
            "Served by {} ({} tokens)",
            generation.model,
            generation.eval_count.map_or_else(|| "?".to_string(), |n| n.to_string())
        );
        debug!("Raw model output:\n{}", generation.text);

        let parsed = parse_with_choices(&generation.text, want_choices);
        if parsed.story.is_empty() {
            return Err(InferenceError::InvalidResponse);
        }
        Ok(GeneratedSegment {
            story: parsed.story,
            choices: parsed.choices.into_iter().map(Choice::new).collect(),
        })
    }

    fn check_safety(&self, request_id: Uuid, segment: &GeneratedSegment) -> Result<SafetyVerdict, StoryError> {
        let verdict = self
            .safety
            .validate_segment(&segment.story, segment.choices.iter().map(|c| c.text.as_str()));
        if verdict.safe {
            Ok(verdict)
        } else {
            warn!("[{}] Generated story failed safety check: {:?}", request_id, verdict.issues);
            Err(StoryError::ContentRejected(verdict.issues))
        }
    }
}

fn guard_stream(chunks: BoxStream<'static, Result<StreamChunk, InferenceError>>) -> BoxStream<'static, StreamEvent> {
    chunks
        .scan((String::new(), false), |(seen, stopped), item| {
            let event = if *stopped {
                None
            } else {
                match item {
                    Ok(chunk) => {
                        seen.push_str(&chunk.response);
                        let issues = term_issues(seen);
                        if issues.is_empty() {
                            Some(StreamEvent::Chunk(chunk))
                        } else {
                            warn!("Streamed story failed safety check: {:?}", issues);
                            *stopped = true;
                            Some(StreamEvent::Error {
                                error: "Generated story did not meet safety guidelines.".to_string(),
                                done: true,
                            })
                        }
                    }
                    Err(e) => {
                        *stopped = true;
                        Some(StreamEvent::Error {
                            error: e.to_string(),
                            done: true,
                        })
                    }
                }
            };
            futures::future::ready(event)
        })
        .boxed()
}

#[cfg(test)]
mod tests;
