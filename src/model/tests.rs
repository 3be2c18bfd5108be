use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::*;

/// Minimal HTTP server answering every request with the same canned reply.
async fn fake_ollama(status: u16, content_type: &'static str, body: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(answer(socket, status, content_type, body));
        }
    });
    format!("http://{}", addr)
}

async fn answer(mut socket: TcpStream, status: u16, content_type: &str, body: &str) {
    let mut request = Vec::new();
    let mut buf = [0u8; 4096];
    // Read headers, then whatever body Content-Length announces.
    loop {
        let n = socket.read(&mut buf).await.unwrap_or(0);
        if n == 0 {
            return;
        }
        request.extend_from_slice(&buf[..n]);
        if let Some(end) = find_header_end(&request) {
            let headers = String::from_utf8_lossy(&request[..end]).to_lowercase();
            let length = headers
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            while request.len() < end + 4 + length {
                let n = socket.read(&mut buf).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            break;
        }
    }

    let reply = format!(
        "HTTP/1.1 {} Status\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    );
    let _ = socket.write_all(reply.as_bytes()).await;
    let _ = socket.shutdown().await;
}

fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Server that accepts connections and never answers.
async fn silent_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    format!("http://{}", addr)
}

const CLOSED_PORT: &str = "http://127.0.0.1:1";

#[tokio::test]
async fn rejects_empty_and_oversized_prompts() {
    let client = OllamaClient::new(CLOSED_PORT, "test-model", 5);

    let empty = client.generate("   ", GenerateOptions::default()).await;
    assert!(matches!(empty, Err(InferenceError::InvalidInput(_))));

    let long = "a".repeat(MAX_PROMPT_CHARS + 1);
    let too_long = client.generate(&long, GenerateOptions::default()).await;
    match too_long {
        Err(InferenceError::InvalidInput(msg)) => assert!(msg.contains("4000")),
        other => panic!("expected InvalidInput, got {:?}", other),
    }
}

#[tokio::test]
async fn fails_fast_when_at_capacity() {
    let client = OllamaClient::new(CLOSED_PORT, "test-model", 1);
    let _held = client.permits.clone().try_acquire_owned().unwrap();
    assert_eq!(client.active_requests(), 1);

    let result = client.generate("Tell a story", GenerateOptions::default()).await;
    assert!(matches!(result, Err(InferenceError::CapacityExceeded)));
}

#[tokio::test]
async fn permit_is_released_after_transport_failure() {
    let client = OllamaClient::new(CLOSED_PORT, "test-model", 2);
    let result = client.generate("Tell a story", GenerateOptions::default()).await;
    assert!(matches!(result, Err(InferenceError::Transport(_))));
    assert_eq!(client.active_requests(), 0);
    assert!(!client.test_connection().await);
}

#[tokio::test]
async fn returns_generated_text() {
    let url = fake_ollama(
        200,
        "application/json",
        r#"{"model":"test-model","response":"Once upon a time.","done":true,"eval_count":7}"#,
    )
    .await;
    let client = OllamaClient::new(&url, "test-model", 5);

    let generation = client.generate("Tell a story", GenerateOptions::default()).await.unwrap();
    assert_eq!(generation.text, "Once upon a time.");
    assert_eq!(generation.model, "test-model");
    assert_eq!(generation.eval_count, Some(7));
    assert_eq!(client.active_requests(), 0);
}

#[tokio::test]
async fn missing_text_is_an_invalid_response() {
    let url = fake_ollama(200, "application/json", r#"{"model":"m","done":true}"#).await;
    let client = OllamaClient::new(&url, "m", 5);
    let result = client.generate("Tell a story", GenerateOptions::default()).await;
    assert!(matches!(result, Err(InferenceError::InvalidResponse)));
}

#[tokio::test]
async fn non_success_status_carries_body() {
    let url = fake_ollama(500, "text/plain", "model not loaded").await;
    let client = OllamaClient::new(&url, "m", 5);
    match client.generate("Tell a story", GenerateOptions::default()).await {
        Err(InferenceError::Backend { status, body }) => {
            assert_eq!(status, 500);
            assert_eq!(body, "model not loaded");
        }
        other => panic!("expected Backend error, got {:?}", other),
    }
}

#[tokio::test]
async fn lists_models_and_reports_connection() {
    let url = fake_ollama(
        200,
        "application/json",
        r#"{"models":[{"name":"storyforge:latest"},{"name":"deepseek-r1:1.5b"}]}"#,
    )
    .await;
    let client = OllamaClient::new(&url, "m", 5);
    assert!(client.test_connection().await);
    assert_eq!(
        client.list_models().await.unwrap(),
        vec!["storyforge:latest".to_string(), "deepseek-r1:1.5b".to_string()]
    );
}

#[tokio::test]
async fn streams_fragments_and_holds_permit_while_open() {
    let url = fake_ollama(
        200,
        "application/x-ndjson",
        "{\"response\":\"Once \",\"done\":false}\n{\"response\":\"upon\",\"done\":false}\n{\"response\":\"\",\"done\":true}\n",
    )
    .await;
    let client = OllamaClient::new(&url, "m", 5);

    let stream = client.generate_stream("Tell a story", GenerateOptions::default()).await.unwrap();
    assert_eq!(client.active_requests(), 1);

    let text: String = stream
        .map(|chunk| chunk.unwrap().response)
        .collect::<Vec<_>>()
        .await
        .concat();
    assert_eq!(text, "Once upon");
    assert_eq!(client.active_requests(), 0);
}

#[tokio::test]
async fn cancel_all_aborts_in_flight_calls() {
    let url = silent_server().await;
    let client = Arc::new(OllamaClient::new(&url, "m", 5));

    let worker = {
        let client = client.clone();
        tokio::spawn(async move { client.generate("Tell a story", GenerateOptions::default()).await })
    };

    for _ in 0..100 {
        if client.active_requests() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(client.active_requests(), 1);

    client.cancel_all();
    let result = tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .expect("cancelled call should return")
        .unwrap();
    assert!(matches!(result, Err(InferenceError::Cancelled)));
    assert_eq!(client.active_requests(), 0);
}
