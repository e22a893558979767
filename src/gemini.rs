use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::GeminiConfig;
use crate::models::{ImageRef, InlineData};

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("{0}")]
    Transport(String),
    #[error("No image generated")]
    EmptyResult,
    #[error("Malformed response: {0}")]
    Malformed(String),
}

/// Boundary between the session controller and whatever produces images.
#[async_trait]
pub trait ImageBackend: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<ImageRef, GenerationError>;
    async fn edit(&self, base: &ImageRef, prompt: &str) -> Result<ImageRef, GenerationError>;
}

// Helper function to truncate base64 data in JSON for cleaner logging
fn truncate_base64_in_json(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, val) in map.iter_mut() {
                if key == "data" {
                    if let serde_json::Value::String(s) = val {
                        if s.len() > 100 && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '=') {
                            *val = serde_json::Value::String(format!("{}...[truncated {} chars]", &s[..50], s.len() - 50));
                        }
                    }
                } else {
                    truncate_base64_in_json(val);
                }
            }
        }
        serde_json::Value::Array(arr) => {
            for val in arr.iter_mut() {
                truncate_base64_in_json(val);
            }
        }
        _ => {}
    }
}

fn loggable(value: &serde_json::Value) -> String {
    let mut copy = value.clone();
    truncate_base64_in_json(&mut copy);
    copy.to_string()
}

pub struct GeminiClient {
    client: Client,
    config: GeminiConfig,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Result<Self, GenerationError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GenerationError::Transport(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            self.config.model
        )
    }

    async fn perform_api_call(&self, request_body: serde_json::Value) -> Result<ImageRef, GenerationError> {
        let url = self.endpoint();
        info!("🔗 Making request to: {}", url);
        debug!("📤 Request body: {}", loggable(&request_body));

        let response = self.client
            .post(&url)
            .header("x-goog-api-key", &self.config.api_key)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| GenerationError::Transport(e.to_string()))?;

        let status = response.status();
        info!("📥 Response status: {}", status);

        let response_text = response.text().await
            .map_err(|e| GenerationError::Transport(e.to_string()))?;

        if !status.is_success() {
            error!("❌ API Error response: {}", response_text);
            return Err(GenerationError::Transport(describe_api_failure(status, &response_text)));
        }

        let parsed: GeminiResponse = serde_json::from_str(&response_text)
            .map_err(|e| GenerationError::Malformed(format!("parse error: {}", e)))?;

        if tracing::enabled!(tracing::Level::DEBUG) {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&response_text) {
                debug!("📥 Raw Gemini API response: {}", loggable(&value));
            }
        }

        let inline = extract_first_image(&parsed).ok_or_else(|| {
            warn!("⚠️ No image data found in API response");
            GenerationError::EmptyResult
        })?;

        let image = ImageRef::from_inline(inline)
            .map_err(|e| GenerationError::Malformed(format!("invalid image payload: {}", e)))?;
        info!("🖼️ Extracted {} image ({} bytes)", image.mime_type(), image.size());
        Ok(image)
    }
}

#[async_trait]
impl ImageBackend for GeminiClient {
    async fn generate(&self, prompt: &str) -> Result<ImageRef, GenerationError> {
        info!("Generating image with Gemini API...");
        let request_body = json!({
            "contents": [{
                "parts": [{"text": prompt}]
            }],
            "generationConfig": {
                "responseModalities": ["TEXT", "IMAGE"],
                "imageConfig": {
                    "aspectRatio": self.config.aspect_ratio
                }
            }
        });

        let result = self.perform_api_call(request_body).await;
        if let Err(e) = &result {
            error!("❌ Failed to generate image: {}", e);
        }
        result
    }

    async fn edit(&self, base: &ImageRef, prompt: &str) -> Result<ImageRef, GenerationError> {
        info!("Editing image ({}, {} bytes) with Gemini API...", base.mime_type(), base.size());
        let request_body = json!({
            "contents": [{
                "parts": [
                    {"inlineData": base.to_inline()},
                    {"text": prompt}
                ]
            }],
            "generationConfig": {
                "responseModalities": ["TEXT", "IMAGE"]
            }
        });

        let result = self.perform_api_call(request_body).await;
        if let Err(e) = &result {
            error!("❌ Failed to edit image: {}", e);
        }
        result
    }
}

fn describe_api_failure(status: reqwest::StatusCode, body: &str) -> String {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(parsed) if !parsed.error.message.is_empty() => {
            format!("status={} {}", status.as_u16(), parsed.error.message)
        }
        _ => format!("status={} body={}", status.as_u16(), body),
    }
}

// --- Response Parsing Helpers ---

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate { #[serde(default)] content: Content }

#[derive(Debug, Deserialize, Default)]
struct Content { #[serde(default)] parts: Vec<Part> }

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Part {
    Inline {
        #[serde(rename = "inlineData")]
        inline_data: InlineData
    },
    #[allow(dead_code)]
    Text { text: String },
    #[allow(dead_code)]
    Other(serde_json::Value)
}

/// First inline image among the first candidate's parts, in order.
fn extract_first_image(resp: &GeminiResponse) -> Option<&InlineData> {
    let candidate = resp.candidates.first()?;
    candidate.content.parts.iter().find_map(|p| match p {
        Part::Inline { inline_data } => Some(inline_data),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn parse(value: serde_json::Value) -> GeminiResponse {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn first_image_part_wins() {
        let resp = parse(json!({
            "candidates": [{
                "content": {
                    "parts": [
                        {"text": "here you go"},
                        {"inlineData": {"mimeType": "image/png", "data": "Zmlyc3Q="}},
                        {"inlineData": {"mimeType": "image/png", "data": "c2Vjb25k"}}
                    ]
                }
            }]
        }));
        let inline = extract_first_image(&resp).unwrap();
        assert_eq!(inline.data, "Zmlyc3Q=");
    }

    #[test]
    fn text_only_response_has_no_image() {
        let resp = parse(json!({
            "candidates": [{"content": {"parts": [{"text": "I cannot draw that"}]}}]
        }));
        assert!(extract_first_image(&resp).is_none());
        assert!(extract_first_image(&parse(json!({}))).is_none());
    }

    #[test]
    fn base64_payloads_are_truncated_for_logs() {
        let long = "A".repeat(400);
        let logged = loggable(&json!({"parts": [{"inlineData": {"data": long, "mimeType": "image/png"}}]}));
        assert!(logged.contains("[truncated 350 chars]"));
        assert!(!logged.contains(&"A".repeat(100)));
    }

    #[test]
    fn non_ascii_data_is_logged_untouched() {
        let text = "中".repeat(40);
        let logged = loggable(&json!({"parts": [{"inlineData": {"data": text, "mimeType": "image/png"}}]}));
        assert!(logged.contains(&"中".repeat(40)));
        assert!(!logged.contains("truncated"));
    }

    #[test]
    fn api_error_message_is_surfaced() {
        let body = r#"{"error":{"code":429,"message":"Resource has been exhausted","status":"RESOURCE_EXHAUSTED"}}"#;
        assert_eq!(
            describe_api_failure(reqwest::StatusCode::TOO_MANY_REQUESTS, body),
            "status=429 Resource has been exhausted"
        );
        assert_eq!(
            describe_api_failure(reqwest::StatusCode::BAD_GATEWAY, "upstream down"),
            "status=502 body=upstream down"
        );
    }

    #[derive(Clone)]
    struct Stub {
        status: StatusCode,
        reply: serde_json::Value,
        seen: Arc<Mutex<Vec<(Option<String>, serde_json::Value)>>>,
    }

    async fn stub_handler(
        State(stub): State<Stub>,
        headers: axum::http::HeaderMap,
        Json(body): Json<serde_json::Value>,
    ) -> (StatusCode, Json<serde_json::Value>) {
        let key = headers
            .get("x-goog-api-key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        stub.seen.lock().push((key, body));
        (stub.status, Json(stub.reply.clone()))
    }

    async fn spawn_stub(stub: Stub) -> GeminiClient {
        let app = Router::new()
            .route("/v1beta/models/:call", post(stub_handler))
            .with_state(stub);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let mut config = GeminiConfig::new("test-key");
        config.base_url = format!("http://{}/v1beta", addr);
        GeminiClient::new(config).unwrap()
    }

    fn image_reply(data: &str) -> serde_json::Value {
        json!({
            "candidates": [{
                "content": {"parts": [{"inlineData": {"mimeType": "image/png", "data": data}}]}
            }]
        })
    }

    #[tokio::test]
    async fn generate_sends_text_part_and_aspect_ratio() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let client = spawn_stub(Stub { status: StatusCode::OK, reply: image_reply("aGVsbG8="), seen: seen.clone() }).await;

        let image = client.generate("a cat").await.unwrap();
        assert_eq!(image.bytes().as_ref(), b"hello");
        assert_eq!(image.mime_type(), "image/png");

        let seen = seen.lock();
        let (key, body) = &seen[0];
        assert_eq!(key.as_deref(), Some("test-key"));
        assert_eq!(body["contents"][0]["parts"], json!([{"text": "a cat"}]));
        assert_eq!(body["generationConfig"]["imageConfig"]["aspectRatio"], "16:9");
    }

    #[tokio::test]
    async fn edit_sends_image_then_text_without_prefix() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let client = spawn_stub(Stub { status: StatusCode::OK, reply: image_reply("ZWRpdGVk"), seen: seen.clone() }).await;

        let base = ImageRef::new(b"hello".to_vec(), "image/png");
        let image = client.edit(&base, "add a hat").await.unwrap();
        assert_eq!(image.bytes().as_ref(), b"edited");

        let seen = seen.lock();
        let parts = &seen[0].1["contents"][0]["parts"];
        assert_eq!(
            parts,
            &json!([
                {"inlineData": {"mimeType": "image/png", "data": "aGVsbG8="}},
                {"text": "add a hat"}
            ])
        );
    }

    #[tokio::test]
    async fn non_success_status_is_transport_error() {
        let client = spawn_stub(Stub {
            status: StatusCode::FORBIDDEN,
            reply: json!({"error": {"message": "API key not valid"}}),
            seen: Arc::default(),
        })
        .await;

        match client.generate("a cat").await {
            Err(GenerationError::Transport(msg)) => assert_eq!(msg, "status=403 API key not valid"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn response_without_image_is_empty_result() {
        let client = spawn_stub(Stub {
            status: StatusCode::OK,
            reply: json!({"candidates": [{"content": {"parts": [{"text": "no"}]}}]}),
            seen: Arc::default(),
        })
        .await;

        let err = client.generate("a cat").await.unwrap_err();
        assert!(matches!(err, GenerationError::EmptyResult));
        assert_eq!(err.to_string(), "No image generated");
    }

    #[tokio::test]
    async fn unreachable_service_is_transport_error() {
        let mut config = GeminiConfig::new("test-key");
        config.base_url = "http://127.0.0.1:1/v1beta".into();
        let client = GeminiClient::new(config).unwrap();
        assert!(matches!(client.generate("a cat").await, Err(GenerationError::Transport(_))));
    }
}
