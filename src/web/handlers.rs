use actix_web::{web, HttpRequest, HttpResponse};
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use log::{info, warn};
use serde_json::json;

use crate::error::StoryError;
use crate::story::orchestrator::{Continuation, NewStory};
use crate::story::Orchestrator;
use crate::web::models::{
    AdventureRequest, AdventureResponse, ContinuationMetadata, ContinueStoryRequest, ContinueStoryResponse,
    GenerateStoryRequest, GenerateStoryResponse, HealthResponse, StoryMetadata,
};

pub const SUPPORTED_FEATURES: &[&str] = &[
    "story-continuation",
    "new-story-generation",
    "adventure-turns",
    "streaming",
    "choice-generation",
    "safety-validation",
    "rate-limiting",
];

const UNKNOWN_CLIENT: &str = "unknown-client";

/// Rate-limit key: first forwarded address, then the real-ip and CDN headers.
/// Requests carrying none of them share one bucket.
pub fn client_id(req: &HttpRequest) -> String {
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    header("x-forwarded-for")
        .or_else(|| header("x-real-ip"))
        .or_else(|| header("cf-connecting-ip"))
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

// Liveness check
pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}

pub async fn continuation_status(orchestrator: web::Data<Orchestrator>) -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse {
        success: true,
        message: "Story continuation service is operational",
        supported_features: SUPPORTED_FEATURES,
        status: orchestrator.backend_status().await,
    })
}

pub async fn generation_status(orchestrator: web::Data<Orchestrator>) -> HttpResponse {
    let status = orchestrator.backend_status().await;
    HttpResponse::Ok().json(json!({ "success": true, "status": status }))
}

pub async fn continue_story(
    req: HttpRequest,
    orchestrator: web::Data<Orchestrator>,
    body: web::Json<ContinueStoryRequest>,
) -> Result<HttpResponse, StoryError> {
    let client = client_id(&req);
    info!("Continuation request from {}", client);
    let continuation = orchestrator.continue_story(&client, &body).await?;
    Ok(HttpResponse::Ok().json(continuation_response(continuation)))
}

pub async fn generate_story(
    req: HttpRequest,
    orchestrator: web::Data<Orchestrator>,
    body: web::Json<GenerateStoryRequest>,
) -> Result<HttpResponse, StoryError> {
    let client = client_id(&req);
    info!("New story request from {}", client);
    let story = orchestrator.generate_story(&client, &body).await?;
    Ok(HttpResponse::Ok().json(new_story_response(story)))
}

pub async fn adventure_status(orchestrator: web::Data<Orchestrator>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "message": "Adventure Story API is running",
        "models": orchestrator.models(),
        "status": "active"
    }))
}

pub async fn adventure(
    req: HttpRequest,
    orchestrator: web::Data<Orchestrator>,
    body: web::Json<AdventureRequest>,
) -> Result<HttpResponse, StoryError> {
    let client = client_id(&req);
    info!("Adventure turn from {}", client);
    let scene = orchestrator.continue_adventure(&client, &body).await?;
    info!("[{}] Adventure turn ready in {:?}", scene.request_id, scene.generation_time);

    Ok(HttpResponse::Ok().json(AdventureResponse {
        story: scene.segment.story,
        choices: scene.segment.choices.into_iter().map(|c| c.text).collect(),
        characters: body.into_inner().characters,
        timestamp: Utc::now(),
    }))
}

/// Streams the continuation as newline-delimited JSON.
pub async fn stream_story(
    req: HttpRequest,
    orchestrator: web::Data<Orchestrator>,
    body: web::Json<ContinueStoryRequest>,
) -> Result<HttpResponse, StoryError> {
    let client = client_id(&req);
    info!("Streaming continuation for {}", client);
    let events = orchestrator.stream_continuation(&client, &body).await?;

    let lines = events.map(|event| {
        serde_json::to_vec(&event).map(|mut line| {
            line.push(b'\n');
            Bytes::from(line)
        })
    });
    Ok(HttpResponse::Ok().content_type("application/x-ndjson").streaming(lines))
}

/// Malformed bodies get the same error shape as every other failure.
pub fn json_error(err: actix_web::error::JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    warn!("Rejected request body: {}", err);
    StoryError::bad_request("Invalid JSON in request body").into()
}

fn continuation_response(continuation: Continuation) -> ContinueStoryResponse {
    let Continuation {
        request_id,
        segment,
        verdict,
        word_count,
        reading_minutes,
        has_more_choices,
        generation_time,
    } = continuation;

    ContinueStoryResponse {
        success: true,
        continuation: segment.story,
        choices: (!segment.choices.is_empty()).then_some(segment.choices),
        metadata: ContinuationMetadata {
            word_count,
            estimated_reading_time: reading_minutes,
            has_more_choices,
            safety_check: verdict,
            generation_time: generation_time.as_millis() as u64,
            request_id,
        },
    }
}

fn new_story_response(story: NewStory) -> GenerateStoryResponse {
    GenerateStoryResponse {
        success: true,
        story: story.segment.story,
        title: story.title,
        choices: (!story.segment.choices.is_empty()).then_some(story.segment.choices),
        metadata: StoryMetadata {
            word_count: story.word_count,
            estimated_reading_time: story.reading_minutes,
            safety_check: story.verdict,
            generation_time: story.generation_time.as_millis() as u64,
            is_interactive: story.interactive,
            request_id: story.request_id,
        },
    }
}
