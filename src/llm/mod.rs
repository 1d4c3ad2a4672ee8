pub mod media;
pub mod openrouter;

use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::TaskParams;

pub use media::LoadedImage;
pub use openrouter::OpenRouterGateway;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        ChatMessage {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub operation: String,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub json_mode: bool,
    /// Attached to the last user message as data URLs.
    pub images: Vec<LoadedImage>,
}

impl CompletionRequest {
    pub fn new(operation: &str, params: &TaskParams, messages: Vec<ChatMessage>) -> Self {
        CompletionRequest {
            operation: operation.to_string(),
            model: params.model.clone(),
            messages,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            json_mode: false,
            images: Vec::new(),
        }
    }

    pub fn json_mode(mut self, enabled: bool) -> Self {
        self.json_mode = enabled;
        self
    }

    pub fn with_image(mut self, image: LoadedImage) -> Self {
        self.images.push(image);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub total: u64,
}

impl TokenUsage {
    pub fn new(input: u64, output: u64) -> Self {
        TokenUsage {
            input,
            output,
            total: input + output,
        }
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.input += other.input;
        self.output += other.output;
        self.total += other.total;
    }
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub model: String,
    pub finish_reason: Option<String>,
    pub usage: TokenUsage,
    pub latency_ms: u64,
}

impl Completion {
    pub fn was_truncated(&self) -> bool {
        matches!(
            self.finish_reason.as_deref().map(str::to_ascii_lowercase).as_deref(),
            Some("length") | Some("max_tokens")
        )
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway is not configured: {0}")]
    NotConfigured(String),
    #[error("gateway request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("gateway returned status {status}: {detail}")]
    Status { status: u16, detail: String },
    #[error("gateway returned an unreadable body: {0}")]
    InvalidBody(String),
    #[error("gateway returned an empty completion")]
    EmptyResponse,
}

/// A remote text/vision completion service.
pub trait CompletionGateway: Send + Sync {
    fn complete(
        &self,
        request: CompletionRequest,
    ) -> impl Future<Output = Result<Completion, GatewayError>> + Send;
}

#[cfg(test)]
pub mod testing {
    use parking_lot::Mutex;

    use super::*;

    type Responder = dyn Fn(&CompletionRequest) -> Result<String, GatewayError> + Send + Sync;

    /// In-memory gateway that answers every request through a closure and
    /// records what it was asked.
    pub struct ScriptedGateway {
        responder: Box<Responder>,
        pub requests: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedGateway {
        pub fn new<F>(responder: F) -> Self
        where
            F: Fn(&CompletionRequest) -> Result<String, GatewayError> + Send + Sync + 'static,
        {
            ScriptedGateway {
                responder: Box::new(responder),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn replying(text: &str) -> Self {
            let text = text.to_string();
            Self::new(move |_| Ok(text.clone()))
        }

        pub fn failing() -> Self {
            Self::new(|_| {
                Err(GatewayError::Status {
                    status: 503,
                    detail: "upstream unavailable".to_string(),
                })
            })
        }

        pub fn request_count(&self) -> usize {
            self.requests.lock().len()
        }
    }

    impl CompletionGateway for ScriptedGateway {
        async fn complete(&self, request: CompletionRequest) -> Result<Completion, GatewayError> {
            let reply = (self.responder)(&request);
            let model = request.model.clone();
            self.requests.lock().push(request);
            let content = reply?;
            Ok(Completion {
                content,
                model,
                finish_reason: Some("stop".to_string()),
                usage: TokenUsage::new(10, 5),
                latency_ms: 1,
            })
        }
    }
}
