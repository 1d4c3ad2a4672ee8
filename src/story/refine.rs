use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::CONFIG;
use crate::llm::{ChatMessage, CompletionGateway, CompletionRequest};
use crate::story::{complete_text, generated, Generated};
use crate::utils::language::resolve_output_language;

const NOT_YET_WRITTEN: &str = "(Not yet written)";
const PLACEHOLDER_MARKERS: [&str; 2] = ["Not yet written", "아직 작성되지 않음"];

static HOOK_HEADER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)== HOOK ==\s*\n").expect("valid hook header regex"));
static BODY_HEADER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)== BODY ==\s*\n").expect("valid body header regex"));
static CTA_HEADER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)== CTA ==\s*\n").expect("valid cta header regex"));
static SECTION_END_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\n== |\nresponse:").expect("valid section end regex"));
static RESPONSE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)response:\s*(.*)$").expect("valid response regex"));

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Refinement {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hook: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cta: Option<String>,
    pub response: String,
}

/// Returns `None` when the header is absent, `Some(None)` when the section is
/// present but empty or still a placeholder.
fn extract_section(raw: &str, header: &Regex) -> Option<Option<String>> {
    let found = header.find(raw)?;
    let start = found.end();
    let end = SECTION_END_RE
        .find_at(raw, start)
        .map(|m| m.start())
        .unwrap_or(raw.len());
    let content = raw[start..end].trim();
    if content.is_empty() || PLACEHOLDER_MARKERS.iter().any(|m| content.contains(m)) {
        return Some(None);
    }
    Some(Some(content.to_string()))
}

pub fn parse_refine_response(raw: &str) -> Refinement {
    let hook = extract_section(raw, &HOOK_HEADER_RE);
    let body = extract_section(raw, &BODY_HEADER_RE);
    let cta = extract_section(raw, &CTA_HEADER_RE);
    let any_section = hook.is_some() || body.is_some() || cta.is_some();

    let response = match RESPONSE_RE.captures(raw).and_then(|caps| caps.get(1)) {
        Some(message) => message.as_str().trim().to_string(),
        None if !any_section => raw.trim().to_string(),
        None => String::new(),
    };

    Refinement {
        hook: hook.flatten(),
        body: body.flatten(),
        cta: cta.flatten(),
        response,
    }
}

/// The editable HOOK/BODY/CTA draft plus the conversation that shaped it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RefineSession {
    pub hook: String,
    pub body: String,
    pub cta: String,
    pub history: Vec<ChatMessage>,
}

fn section_or_placeholder(value: &str) -> &str {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        NOT_YET_WRITTEN
    } else {
        trimmed
    }
}

impl RefineSession {
    pub fn new(hook: String, body: String, cta: String) -> Self {
        RefineSession {
            hook,
            body,
            cta,
            history: Vec::new(),
        }
    }

    fn system_prompt(&self) -> String {
        let language = resolve_output_language(
            &[self.body.as_str(), self.hook.as_str()],
            None,
            &CONFIG.story_language,
        );
        format!(
            "You are a professional story editing assistant.\n\
             Polish the user's story so it is more engaging and complete.\n\
             Improve or modify the HOOK, BODY and CTA sections as the user requests.\n\n\
             Present only the modified sections using == HOOK ==, == BODY ==, == CTA == separators.\n\
             If nothing changes, return only the response.\n\
             For simple questions or advice, answer naturally without modifications.\n\n\
             IMPORTANT: Write all content in {language}.\n\n\
             # Current Story Structure\n\n\
             == HOOK ==\n{hook}\n\n\
             == BODY ==\n{body}\n\n\
             == CTA ==\n{cta}\n\n\n\
             # Output Format\n\n\
             == HOOK ==\n[Modified HOOK text if there are changes]\n\n\
             == BODY ==\n[Modified BODY text if there are changes]\n\n\
             == CTA ==\n[Modified CTA text if there are changes]\n\n\
             response: [Short message to return to the user]",
            language = language,
            hook = section_or_placeholder(&self.hook),
            body = section_or_placeholder(&self.body),
            cta = section_or_placeholder(&self.cta),
        )
    }

    pub fn build_request(&self, message: &str) -> CompletionRequest {
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        messages.push(ChatMessage::system(self.system_prompt()));
        messages.extend(self.history.iter().cloned());
        messages.push(ChatMessage::user(message));
        CompletionRequest::new("refine", &CONFIG.refine, messages)
    }

    pub fn apply(&mut self, refinement: &Refinement) {
        if let Some(hook) = &refinement.hook {
            self.hook = hook.clone();
        }
        if let Some(body) = &refinement.body {
            self.body = body.clone();
        }
        if let Some(cta) = &refinement.cta {
            self.cta = cta.clone();
        }
    }

    pub async fn send<G: CompletionGateway>(
        &mut self,
        gateway: &G,
        message: &str,
    ) -> Result<Generated<Refinement>> {
        let completion = complete_text(gateway, self.build_request(message)).await?;
        let refinement = parse_refine_response(&completion.content);
        self.apply(&refinement);
        self.history.push(ChatMessage::user(message));
        self.history
            .push(ChatMessage::assistant(completion.content.clone()));
        info!(
            "Refinement applied: hook={} body={} cta={}",
            refinement.hook.is_some(),
            refinement.body.is_some(),
            refinement.cta.is_some()
        );
        Ok(generated(&completion, refinement))
    }
}
