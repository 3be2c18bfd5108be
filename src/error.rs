use actix_web::http::header::{HeaderName, HeaderValue, RETRY_AFTER};
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;

use crate::limit::RateLimitDecision;
use crate::model::InferenceError;
use crate::story::prompt::PromptError;
use crate::web::models::ErrorResponse;

/// Every way a story request can end without a story.
#[derive(Debug, Error)]
pub enum StoryError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Too many requests. Please try again later.")]
    TooManyRequests(RateLimitDecision),

    #[error("Story generation service is currently unavailable. Please try again later.")]
    ServiceUnavailable,

    #[error("Story generation failed: {0}")]
    GenerationFailed(String),

    #[error("Generated story did not meet safety guidelines. Please try a different choice.")]
    ContentRejected(Vec<String>),

    #[error(transparent)]
    Prompt(#[from] PromptError),
}

impl StoryError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        StoryError::BadRequest(message.into())
    }
}

impl From<InferenceError> for StoryError {
    fn from(err: InferenceError) -> Self {
        match err {
            InferenceError::InvalidInput(message) => StoryError::BadRequest(message),
            other => StoryError::GenerationFailed(other.to_string()),
        }
    }
}

impl ResponseError for StoryError {
    fn status_code(&self) -> StatusCode {
        match self {
            StoryError::BadRequest(_) | StoryError::ContentRejected(_) => StatusCode::BAD_REQUEST,
            StoryError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
            StoryError::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            StoryError::GenerationFailed(_) | StoryError::Prompt(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut builder = HttpResponse::build(self.status_code());
        if let StoryError::TooManyRequests(decision) = self {
            let reset = decision.reset_at.timestamp();
            let retry_after = decision.retry_after().as_secs().max(1);
            builder
                .insert_header((HeaderName::from_static("x-ratelimit-limit"), HeaderValue::from(decision.limit)))
                .insert_header((
                    HeaderName::from_static("x-ratelimit-remaining"),
                    HeaderValue::from(decision.remaining),
                ))
                .insert_header((HeaderName::from_static("x-ratelimit-reset"), HeaderValue::from(reset)))
                .insert_header((RETRY_AFTER, HeaderValue::from(retry_after)));
        }
        builder.json(ErrorResponse::new(self.to_string()))
    }
}
