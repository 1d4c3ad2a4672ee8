use std::time::Instant;

use base64::{engine::general_purpose, Engine as _};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::{Config, CONFIG};
use crate::llm::{
    ChatMessage, Completion, CompletionGateway, CompletionRequest, GatewayError, LoadedImage, Role,
    TokenUsage,
};
use crate::utils::http::get_http_client;
use crate::utils::json::truncate_for_log;
use crate::utils::timing::{log_llm_timing, LlmCall};

static THINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^\s*<think>(.*?)</think>(.*)$").expect("valid think regex"));

#[derive(Debug, Clone)]
pub struct OpenRouterGateway {
    base_url: String,
    api_key: String,
    referer: String,
    title: String,
}

impl OpenRouterGateway {
    pub fn from_config(config: &Config) -> Result<Self, GatewayError> {
        let api_key = config.openrouter_api_key.trim();
        if api_key.is_empty() {
            return Err(GatewayError::NotConfigured(
                "OPENROUTER_API_KEY is required for this command".to_string(),
            ));
        }
        Ok(OpenRouterGateway {
            base_url: config.openrouter_base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            referer: config.app_referer.clone(),
            title: config.app_title.clone(),
        })
    }

    pub fn from_env() -> Result<Self, GatewayError> {
        Self::from_config(&CONFIG)
    }

    async fn post_chat_completion(&self, payload: &Value) -> Result<Value, GatewayError> {
        debug!("OpenRouter request: {}", summarize_payload(payload));

        let response = get_http_client()
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .header("HTTP-Referer", &self.referer)
            .header("X-Title", &self.title)
            .json(payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let (message, body_summary) = summarize_error_body(&body);
            warn!(
                "OpenRouter API error: status={}, body={}",
                status, body_summary
            );
            return Err(GatewayError::Status {
                status: status.as_u16(),
                detail: message.unwrap_or(body_summary),
            });
        }

        let value = response
            .json::<Value>()
            .await
            .map_err(|err| GatewayError::InvalidBody(err.to_string()))?;

        // OpenRouter reports some upstream failures inside a 200 body.
        if let Some(message) = value.pointer("/error/message").and_then(|v| v.as_str()) {
            return Err(GatewayError::Status {
                status: value
                    .pointer("/error/code")
                    .and_then(|v| v.as_u64())
                    .and_then(|code| u16::try_from(code).ok())
                    .unwrap_or(502),
                detail: message.to_string(),
            });
        }

        Ok(value)
    }
}

impl CompletionGateway for OpenRouterGateway {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, GatewayError> {
        let payload = build_payload(&request);
        let metadata = json!({
            "images": request.images.len(),
            "json_mode": request.json_mode,
            "messages": request.messages.len(),
        });
        let call = LlmCall {
            provider: "openrouter",
            model: &request.model,
            operation: &request.operation,
        };

        log_llm_timing(call, metadata, async {
            let started = Instant::now();
            let response = self.post_chat_completion(&payload).await?;
            let latency_ms = started.elapsed().as_millis() as u64;
            parse_completion(&request.model, &response, latency_ms)
        })
        .await
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

fn build_message_content(text: &str, images: &[LoadedImage]) -> Value {
    if images.is_empty() {
        return Value::String(text.to_string());
    }

    let mut parts = Vec::with_capacity(images.len() + 1);
    for image in images {
        let encoded = general_purpose::STANDARD.encode(&image.bytes);
        let data_url = format!("data:{};base64,{}", image.mime_type, encoded);
        parts.push(json!({
            "type": "image_url",
            "image_url": { "url": data_url }
        }));
    }
    parts.push(json!({
        "type": "text",
        "text": text
    }));

    Value::Array(parts)
}

fn build_messages(messages: &[ChatMessage], images: &[LoadedImage]) -> Vec<Value> {
    let last_user = messages.iter().rposition(|m| m.role == Role::User);
    messages
        .iter()
        .enumerate()
        .map(|(idx, message)| {
            let content = if Some(idx) == last_user {
                build_message_content(&message.content, images)
            } else {
                Value::String(message.content.clone())
            };
            json!({ "role": role_name(message.role), "content": content })
        })
        .collect()
}

fn build_payload(request: &CompletionRequest) -> Value {
    let mut payload = json!({
        "model": request.model,
        "messages": build_messages(&request.messages, &request.images),
        "max_tokens": request.max_tokens,
        "temperature": request.temperature,
    });
    if request.json_mode {
        payload["response_format"] = json!({ "type": "json_object" });
    }
    payload
}

fn summarize_payload(payload: &Value) -> String {
    let model = payload
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");
    let message_count = payload
        .get("messages")
        .and_then(|v| v.as_array())
        .map(|messages| messages.len())
        .unwrap_or(0);
    let json_mode = payload.get("response_format").is_some();

    format!(
        "model={}, messages={}, json_mode={}, max_tokens={}",
        model,
        message_count,
        json_mode,
        payload
            .get("max_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    )
}

fn summarize_error_body(body: &str) -> (Option<String>, String) {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return (None, "empty response body".to_string());
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        let message = value
            .pointer("/error/message")
            .and_then(|v| v.as_str())
            .map(|v| v.to_string())
            .or_else(|| {
                value
                    .get("message")
                    .and_then(|v| v.as_str())
                    .map(|v| v.to_string())
            });
        return (message, truncate_for_log(&value.to_string(), 2000));
    }

    (None, truncate_for_log(trimmed, 2000))
}

fn strip_reasoning_preamble(content: &str) -> String {
    if let Some(caps) = THINK_RE.captures(content) {
        let final_text = caps.get(2).map(|m| m.as_str()).unwrap_or("").trim();
        if !final_text.is_empty() {
            return final_text.to_string();
        }
        let analysis = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        return analysis.trim().to_string();
    }
    content.trim().to_string()
}

fn extract_reasoning_text(message: &Value) -> Option<String> {
    if let Some(reasoning) = message.get("reasoning").and_then(|v| v.as_str()) {
        let trimmed = reasoning.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_string());
        }
    }

    let details = message.get("reasoning_details").and_then(|v| v.as_array())?;
    let parts = details
        .iter()
        .filter_map(|detail| detail.get("text").and_then(|v| v.as_str()))
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>();

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

fn parse_usage(response: &Value) -> TokenUsage {
    let field = |name: &str| {
        response
            .get("usage")
            .and_then(|usage| usage.get(name))
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    };
    let mut usage = TokenUsage::new(field("prompt_tokens"), field("completion_tokens"));
    let reported_total = field("total_tokens");
    if reported_total > 0 {
        usage.total = reported_total;
    }
    usage
}

fn parse_completion(
    requested_model: &str,
    response: &Value,
    latency_ms: u64,
) -> Result<Completion, GatewayError> {
    let choice = response
        .get("choices")
        .and_then(|v| v.get(0))
        .cloned()
        .unwrap_or(Value::Null);
    let message = choice.get("message").cloned().unwrap_or(Value::Null);

    let raw_content = message
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let mut content = strip_reasoning_preamble(raw_content);
    if content.is_empty() {
        content = extract_reasoning_text(&message).unwrap_or_default();
    }
    if content.is_empty() {
        warn!(
            "OpenRouter response had empty content: {}",
            truncate_for_log(&response.to_string(), 2000)
        );
        return Err(GatewayError::EmptyResponse);
    }

    let finish_reason = choice
        .get("finish_reason")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let model = response
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or(requested_model)
        .to_string();

    Ok(Completion {
        content,
        model,
        finish_reason,
        usage: parse_usage(response),
        latency_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskParams;

    fn params() -> TaskParams {
        TaskParams {
            model: "google/gemini-2.5-flash".to_string(),
            max_tokens: 1024,
            temperature: 0.3,
        }
    }

    #[test]
    fn payload_attaches_images_to_last_user_message() {
        let request = CompletionRequest::new(
            "vision",
            &params(),
            vec![
                ChatMessage::system("sys"),
                ChatMessage::user("first"),
                ChatMessage::assistant("ok"),
                ChatMessage::user("describe"),
            ],
        )
        .json_mode(true)
        .with_image(LoadedImage {
            bytes: vec![1, 2, 3],
            mime_type: "image/png".to_string(),
        });

        let payload = build_payload(&request);
        let messages = payload["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[1]["content"], "first");
        let parts = messages[3]["content"].as_array().unwrap();
        assert_eq!(parts[0]["image_url"]["url"], "data:image/png;base64,AQID");
        assert_eq!(parts[1]["text"], "describe");
        assert_eq!(payload["response_format"]["type"], "json_object");
        assert_eq!(payload["max_tokens"], 1024);
    }

    #[test]
    fn plain_payload_has_no_response_format() {
        let request = CompletionRequest::new("story", &params(), vec![ChatMessage::user("hi")]);
        let payload = build_payload(&request);
        assert!(payload.get("response_format").is_none());
        assert_eq!(payload["messages"][0]["content"], "hi");
    }

    #[test]
    fn parses_content_usage_and_finish_reason() {
        let response = json!({
            "model": "google/gemini-2.5-flash-001",
            "choices": [{
                "message": { "role": "assistant", "content": "<think>hmm</think>\n{\"a\":1}" },
                "finish_reason": "length"
            }],
            "usage": { "prompt_tokens": 120, "completion_tokens": 30, "total_tokens": 150 }
        });
        let completion = parse_completion("fallback/model", &response, 42).unwrap();
        assert_eq!(completion.content, "{\"a\":1}");
        assert_eq!(completion.model, "google/gemini-2.5-flash-001");
        assert_eq!(completion.usage, TokenUsage::new(120, 30));
        assert!(completion.was_truncated());
        assert_eq!(completion.latency_ms, 42);
    }

    #[test]
    fn falls_back_to_reasoning_text_then_errors_when_empty() {
        let response = json!({
            "choices": [{ "message": { "content": "", "reasoning": "only reasoning" } }]
        });
        let completion = parse_completion("m", &response, 0).unwrap();
        assert_eq!(completion.content, "only reasoning");
        assert_eq!(completion.model, "m");

        let empty = json!({ "choices": [{ "message": { "content": "  " } }] });
        assert!(matches!(
            parse_completion("m", &empty, 0),
            Err(GatewayError::EmptyResponse)
        ));
    }

    #[test]
    fn blank_api_key_is_reported_as_not_configured() {
        let config = Config {
            openrouter_api_key: "   ".to_string(),
            ..Config::load()
        };
        let err = OpenRouterGateway::from_config(&config).unwrap_err();
        assert!(matches!(err, GatewayError::NotConfigured(_)));
        assert!(err.to_string().contains("OPENROUTER_API_KEY"));

        let config = Config {
            openrouter_api_key: " sk-or-test ".to_string(),
            openrouter_base_url: "https://openrouter.ai/api/v1/".to_string(),
            ..Config::load()
        };
        let gateway = OpenRouterGateway::from_config(&config).unwrap();
        assert_eq!(gateway.api_key, "sk-or-test");
        assert_eq!(gateway.base_url, "https://openrouter.ai/api/v1");
    }

    #[test]
    fn error_body_prefers_nested_message() {
        let (message, summary) =
            summarize_error_body(r#"{"error":{"message":"No auth credentials found","code":401}}"#);
        assert_eq!(message.as_deref(), Some("No auth credentials found"));
        assert!(summary.contains("401"));
        assert_eq!(summarize_error_body("  ").1, "empty response body");
    }
}
