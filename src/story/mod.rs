pub mod refine;
pub mod scenes;
pub mod sections;
pub mod viral;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::CONFIG;
use crate::llm::{ChatMessage, Completion, CompletionGateway, CompletionRequest, TokenUsage};
use crate::state::UsageLedger;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Keywords {
    pub genre: String,
    pub mood: String,
    pub setting: Option<String>,
    pub characters: Vec<String>,
    pub extra: Vec<String>,
}

impl Keywords {
    pub fn is_horror(&self) -> bool {
        self.mood.trim().eq_ignore_ascii_case("scary")
    }

    fn normalized_list(values: &[String]) -> Vec<&str> {
        values
            .iter()
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .collect()
    }
}

/// A generated value together with the call that produced it.
#[derive(Debug, Clone)]
pub struct Generated<T> {
    pub output: T,
    pub model: String,
    pub usage: TokenUsage,
    pub latency_ms: u64,
}

impl<T> Generated<T> {
    pub fn record(&self, ledger: &UsageLedger, operation: &str) {
        ledger.record(operation, &self.model, self.usage, self.latency_ms);
    }
}

pub(crate) async fn complete_text<G: CompletionGateway>(
    gateway: &G,
    request: CompletionRequest,
) -> Result<Completion> {
    let operation = request.operation.clone();
    let completion = gateway
        .complete(request)
        .await
        .map_err(|err| anyhow!("{} request failed: {}", operation, err))?;
    if completion.was_truncated() {
        warn!(
            "{} output was truncated (finish_reason={:?})",
            operation, completion.finish_reason
        );
    }
    Ok(completion)
}

pub(crate) fn generated<T>(completion: &Completion, output: T) -> Generated<T> {
    Generated {
        output,
        model: completion.model.clone(),
        usage: completion.usage,
        latency_ms: completion.latency_ms,
    }
}

fn build_story_system_prompt(language: &str, horror: bool) -> String {
    let mut prompt = String::from(
        "You are an online community user who loves sharing personal stories.\n\
         Write a vivid first-person story based on the keywords you receive.\n\
         Skip greetings and get straight to the point. Keep it gripping and witty so \
         viewers stay until the end.\n\n\
         # Rules\n\
         - Around 600 characters.\n\
         - No markdown, no emojis, no title.\n\
         - Dialogue is written as (Name)\"line\".\n",
    );
    if horror {
        prompt.push_str(
            "\n# Horror\n\
             - Build dread slowly and keep the unsettling detail concrete.\n\
             - End on an unresolved, chilling beat.\n",
        );
    }
    prompt.push_str(&format!("\nIMPORTANT: Write the story in {}.", language));
    prompt
}

fn build_story_user_prompt(keywords: &Keywords) -> String {
    let mut sections = Vec::new();
    if !keywords.genre.trim().is_empty() {
        sections.push(format!("== Genre ==\n{}", keywords.genre.trim()));
    }
    if !keywords.mood.trim().is_empty() {
        sections.push(format!("== Mood ==\n{}", keywords.mood.trim()));
    }
    if let Some(setting) = keywords
        .setting
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        sections.push(format!("== Setting ==\n{}", setting));
    }
    let characters = Keywords::normalized_list(&keywords.characters);
    if !characters.is_empty() {
        sections.push(format!("== Characters ==\n{}", characters.join(", ")));
    }
    let extra = Keywords::normalized_list(&keywords.extra);
    if !extra.is_empty() {
        sections.push(format!("== Keywords ==\n{}", extra.join(", ")));
    }

    if sections.is_empty() {
        return "Write a story on any topic you like.".to_string();
    }
    format!(
        "Write a story using the following keywords.\n\n{}",
        sections.join("\n\n")
    )
}

pub fn build_story_request(keywords: &Keywords) -> CompletionRequest {
    let system = build_story_system_prompt(&CONFIG.story_language, keywords.is_horror());
    CompletionRequest::new(
        "story",
        &CONFIG.story,
        vec![
            ChatMessage::system(system),
            ChatMessage::user(build_story_user_prompt(keywords)),
        ],
    )
}

pub async fn generate_story<G: CompletionGateway>(
    gateway: &G,
    keywords: &Keywords,
) -> Result<Generated<String>> {
    let completion = complete_text(gateway, build_story_request(keywords)).await?;
    let story = completion.content.trim().to_string();
    if story.is_empty() {
        return Err(anyhow!("Story generation returned empty text"));
    }
    info!("Generated story with {} characters", story.chars().count());
    Ok(generated(&completion, story))
}
