use std::sync::Arc;

use futures::StreamExt;

use super::*;
use crate::story::parse::FALLBACK_CHOICES;
use crate::story::{AgeBand, StoryLength};
use crate::testing::{continue_request, orchestrator, ScriptedGenerator, GOOD_REPLY};
use crate::web::models::{AdventureRequest, GenerateStoryRequest};

const CLIENT: &str = "10.0.0.1";

#[tokio::test]
async fn primary_success_yields_story_choices_and_metadata() {
    let generator = Arc::new(ScriptedGenerator::replying([Ok(GOOD_REPLY.to_string())]));
    let pipeline = orchestrator(generator.clone(), 10);

    let result = pipeline.continue_story(CLIENT, &continue_request()).await.unwrap();

    assert!(result.segment.story.starts_with("Mia stepped into the glowing cave"));
    let choices: Vec<&str> = result.segment.choices.iter().map(|c| c.text.as_str()).collect();
    assert_eq!(
        choices,
        vec!["Open the hidden door", "Follow the fox deeper", "Run back to find her brother"]
    );
    assert!(result.verdict.safe);
    assert!(result.has_more_choices);
    assert_eq!(result.word_count, word_count(&result.segment.story));
    assert_eq!(result.reading_minutes, 1);

    let calls = generator.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].options.model.as_deref(), Some("primary:latest"));
    assert_eq!(calls[0].options.max_tokens, Some(token_budget(250, 1000)));
    assert!(calls[0].prompt.contains(crate::story::prompt::CHOICE_SENTINEL));
}

#[tokio::test]
async fn invalid_input_never_reaches_the_backend() {
    let generator = Arc::new(ScriptedGenerator::replying([Ok(GOOD_REPLY.to_string())]));
    let pipeline = orchestrator(generator.clone(), 10);
    let mut request = continue_request();
    request.chosen_option = None;

    let err = pipeline.continue_story(CLIENT, &request).await.unwrap_err();

    assert!(matches!(err, StoryError::BadRequest(_)));
    assert_eq!(generator.connection_checks(), 0);
    assert!(generator.calls().is_empty());
}

#[tokio::test]
async fn unknown_age_group_is_rejected() {
    let generator = Arc::new(ScriptedGenerator::replying([]));
    let pipeline = orchestrator(generator, 10);
    let mut request = continue_request();
    request.age_group = Some("3-4".to_string());

    let err = pipeline.continue_story(CLIENT, &request).await.unwrap_err();
    assert!(err.to_string().starts_with("Invalid age group"), "{}", err);
}

#[tokio::test]
async fn rate_limit_is_checked_first() {
    let generator = Arc::new(ScriptedGenerator::replying([Ok(GOOD_REPLY.to_string())]));
    let pipeline = orchestrator(generator.clone(), 1);

    pipeline.continue_story(CLIENT, &continue_request()).await.unwrap();
    let err = pipeline.continue_story(CLIENT, &continue_request()).await.unwrap_err();

    match err {
        StoryError::TooManyRequests(decision) => {
            assert!(!decision.allowed);
            assert_eq!(decision.remaining, 0);
        }
        other => panic!("expected rate limit, got {:?}", other),
    }
    assert_eq!(generator.calls().len(), 1);

    // Other clients keep their own budget.
    let err = pipeline.continue_story("10.0.0.2", &continue_request()).await.unwrap_err();
    assert!(!matches!(err, StoryError::TooManyRequests(_)));
}

#[tokio::test]
async fn unreachable_backend_is_service_unavailable() {
    let generator = Arc::new(ScriptedGenerator::offline());
    let pipeline = orchestrator(generator.clone(), 10);

    let err = pipeline.continue_story(CLIENT, &continue_request()).await.unwrap_err();

    assert!(matches!(err, StoryError::ServiceUnavailable));
    assert!(generator.calls().is_empty());
}

#[tokio::test]
async fn primary_failure_falls_back_to_compact_prompt() {
    let generator = Arc::new(ScriptedGenerator::replying([
        Err(InferenceError::Backend {
            status: 404,
            body: "model not found".to_string(),
        }),
        Ok(GOOD_REPLY.to_string()),
    ]));
    let pipeline = orchestrator(generator.clone(), 10);

    let result = pipeline.continue_story(CLIENT, &continue_request()).await.unwrap();
    assert!(result.segment.story.contains("friendly fox"));

    let calls = generator.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].options.model.as_deref(), Some("primary:latest"));
    assert_eq!(calls[1].options.model.as_deref(), Some("fallback:latest"));
    assert!(calls[1].prompt.contains("STORY: [story text]"));
}

#[tokio::test]
async fn empty_primary_story_counts_as_failure() {
    let generator = Arc::new(ScriptedGenerator::replying([
        Ok("What do you choose?\nA) Go\nB) Stay\nC) Wait".to_string()),
        Ok(GOOD_REPLY.to_string()),
    ]));
    let pipeline = orchestrator(generator.clone(), 10);

    let result = pipeline.continue_story(CLIENT, &continue_request()).await.unwrap();
    assert!(!result.segment.story.is_empty());
    assert_eq!(generator.calls().len(), 2);
}

#[tokio::test]
async fn both_models_failing_reports_the_last_error() {
    let generator = Arc::new(ScriptedGenerator::replying([
        Err(InferenceError::Backend {
            status: 500,
            body: "busy".to_string(),
        }),
        Err(InferenceError::CapacityExceeded),
    ]));
    let pipeline = orchestrator(generator.clone(), 10);

    let err = pipeline.continue_story(CLIENT, &continue_request()).await.unwrap_err();

    match err {
        StoryError::GenerationFailed(message) => {
            assert!(message.contains("Maximum concurrent requests exceeded"), "{}", message)
        }
        other => panic!("expected generation failure, got {:?}", other),
    }
    assert_eq!(generator.calls().len(), 2);
}

#[tokio::test]
async fn refused_prompt_is_a_bad_request_without_fallback() {
    let generator = Arc::new(ScriptedGenerator::replying([
        Err(InferenceError::InvalidInput("Prompt too long. Maximum 4000 characters allowed.".to_string())),
        Ok(GOOD_REPLY.to_string()),
    ]));
    let pipeline = orchestrator(generator.clone(), 10);

    let err = pipeline.continue_story(CLIENT, &continue_request()).await.unwrap_err();

    match err {
        StoryError::BadRequest(message) => assert!(message.starts_with("Prompt too long")),
        other => panic!("expected bad request, got {:?}", other),
    }
    assert_eq!(generator.calls().len(), 1);
}

#[tokio::test]
async fn unsafe_output_is_rejected() {
    let generator = Arc::new(ScriptedGenerator::replying([Ok(
        "STORY: The pirates plotted a murder aboard the ship while the parrot listened.\nCHOICES:\nA: Warn the captain"
            .to_string(),
    )]));
    let pipeline = orchestrator(generator, 10);

    let err = pipeline.continue_story(CLIENT, &continue_request()).await.unwrap_err();

    match err {
        StoryError::ContentRejected(issues) => {
            assert!(issues.contains(&"Contains inappropriate content: murder".to_string()))
        }
        other => panic!("expected rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn choices_are_backfilled_or_omitted() {
    let generator = Arc::new(ScriptedGenerator::replying([
        Ok("STORY: The kite rose high over the green hill and everyone cheered loudly.".to_string()),
        Ok(GOOD_REPLY.to_string()),
    ]));
    let pipeline = orchestrator(generator, 10);

    let result = pipeline.continue_story(CLIENT, &continue_request()).await.unwrap();
    let choices: Vec<&str> = result.segment.choices.iter().map(|c| c.text.as_str()).collect();
    assert_eq!(choices, FALLBACK_CHOICES.to_vec());

    let mut request = continue_request();
    request.add_more_choices = false;
    let result = pipeline.continue_story("10.0.0.2", &request).await.unwrap();
    assert!(result.segment.choices.is_empty());
    assert!(!result.has_more_choices);
}

#[tokio::test]
async fn new_story_gets_title_and_choices() {
    let generator = Arc::new(ScriptedGenerator::replying([Ok(GOOD_REPLY.to_string())]));
    let pipeline = orchestrator(generator.clone(), 10);
    let request = GenerateStoryRequest {
        prompt: Some("A girl and a fox find a secret door".to_string()),
        age_group: Some("5-8".to_string()),
        story_type: Some("fantasy".to_string()),
        is_interactive: true,
        ..GenerateStoryRequest::default()
    };

    let story = pipeline.generate_story(CLIENT, &request).await.unwrap();

    assert!(story.interactive);
    assert!(story.title.ends_with("- Choose Your Adventure") || story.title.ends_with("..."));
    assert_eq!(story.segment.choices.len(), 3);
    let calls = generator.calls();
    assert!(calls[0].prompt.contains("A girl and a fox find a secret door"));
    assert_eq!(
        calls[0].options.max_tokens,
        Some(token_budget(default_word_limit(AgeBand::Young, StoryLength::Medium), 3000))
    );
}

fn adventure_request() -> AdventureRequest {
    AdventureRequest {
        prompt: Some("The rope bridge over the canyon snaps".to_string()),
        characters: Some("Mia and her fox Ember".to_string()),
        story_history: Some("Mia and Ember followed the map to the canyon.".to_string()),
    }
}

#[tokio::test]
async fn adventure_turn_uses_fixed_sampling_and_three_choices() {
    let generator = Arc::new(ScriptedGenerator::replying([Ok(GOOD_REPLY.to_string())]));
    let pipeline = orchestrator(generator.clone(), 10);

    let scene = pipeline.continue_adventure(CLIENT, &adventure_request()).await.unwrap();

    assert!(scene.segment.story.starts_with("Mia stepped into the glowing cave"));
    assert_eq!(scene.segment.choices.len(), 3);
    let calls = generator.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].options.temperature, Some(0.8));
    assert_eq!(calls[0].options.max_tokens, Some(500));
    assert!(calls[0].prompt.contains("Current Situation: The rope bridge over the canyon snaps"));
    assert!(calls[0].prompt.contains("Story History: Mia and Ember followed the map"));
}

#[tokio::test]
async fn adventure_falls_back_and_backfills_choices() {
    let generator = Arc::new(ScriptedGenerator::replying([
        Err(InferenceError::Cancelled),
        Ok("STORY: Ember found a second path along the cliff and barked happily.".to_string()),
    ]));
    let pipeline = orchestrator(generator.clone(), 10);

    let scene = pipeline.continue_adventure(CLIENT, &adventure_request()).await.unwrap();

    let choices: Vec<&str> = scene.segment.choices.iter().map(|c| c.text.as_str()).collect();
    assert_eq!(choices, FALLBACK_CHOICES.to_vec());
    let calls = generator.calls();
    assert_eq!(calls[1].options.model.as_deref(), Some("fallback:latest"));
    assert!(calls[1].prompt.contains("Previous Story: Mia and Ember"));
}

#[tokio::test]
async fn adventure_without_prompt_is_rejected_before_generation() {
    let generator = Arc::new(ScriptedGenerator::replying([Ok(GOOD_REPLY.to_string())]));
    let pipeline = orchestrator(generator.clone(), 10);
    let request = AdventureRequest {
        prompt: None,
        ..adventure_request()
    };

    let err = pipeline.continue_adventure(CLIENT, &request).await.unwrap_err();

    assert_eq!(err.to_string(), "Prompt is required");
    assert!(generator.calls().is_empty());
}

#[tokio::test]
async fn stream_passes_clean_chunks_through() {
    let generator = Arc::new(ScriptedGenerator::streaming(&["The fox ", "smiled."]));
    let pipeline = orchestrator(generator, 10);

    let events: Vec<StreamEvent> = pipeline
        .stream_continuation(CLIENT, &continue_request())
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(
        events,
        vec![
            StreamEvent::Chunk(StreamChunk {
                response: "The fox ".to_string(),
                done: false
            }),
            StreamEvent::Chunk(StreamChunk {
                response: "smiled.".to_string(),
                done: true
            }),
        ]
    );
}

#[tokio::test]
async fn stream_stops_at_a_disallowed_term_split_across_chunks() {
    let generator = Arc::new(ScriptedGenerator::streaming(&["They found the mur", "der weapon", " and ran."]));
    let pipeline = orchestrator(generator, 10);

    let events: Vec<StreamEvent> = pipeline
        .stream_continuation(CLIENT, &continue_request())
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(events.len(), 2);
    let line = serde_json::to_value(&events[1]).unwrap();
    assert_eq!(line["done"], true);
    assert!(line["error"].as_str().unwrap().contains("safety"));
}

#[tokio::test]
async fn stream_refusal_is_a_bad_request() {
    let generator = Arc::new(ScriptedGenerator::refusing_streams("Prompt cannot be empty"));
    let pipeline = orchestrator(generator, 10);

    match pipeline.stream_continuation(CLIENT, &continue_request()).await {
        Err(StoryError::BadRequest(message)) => assert_eq!(message, "Prompt cannot be empty"),
        Err(other) => panic!("expected bad request, got {:?}", other),
        Ok(_) => panic!("expected bad request, got a stream"),
    }
}

#[test]
fn ladder_runs_primary_then_fallback_then_stops() {
    let ladder = ModelLadder::new("a", "b");
    let mut state = Attempt::Primary;
    let mut seen = Vec::new();
    while let Some(profile) = ladder.profile(state) {
        seen.push((profile.model.clone(), profile.style));
        state = state.next();
    }
    assert_eq!(
        seen,
        vec![
            ("a".to_string(), PromptStyle::Full),
            ("b".to_string(), PromptStyle::Compact)
        ]
    );
    assert_eq!(ladder.models(), vec!["a", "b"]);
}
