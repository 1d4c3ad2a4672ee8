use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::config::CONFIG;
use crate::llm::{ChatMessage, CompletionGateway, CompletionRequest};
use crate::story::{complete_text, generated, Generated};
use crate::utils::language::resolve_output_language;

static KOREAN_TAGS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\[설명\](.*?)\[해시태그\](.*)").expect("valid korean tag regex"));
static ENGLISH_TAGS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)\[Description\](.*?)\[Hashtags?\](.*)").expect("valid english tag regex")
});

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ViralCopy {
    pub description: String,
    pub hashtags: String,
}

fn viral_system_prompt(language: &str) -> String {
    format!(
        "Generate an SNS description and hashtags for short-form content.\n\n\
         # Description\n\
         1. A catchy viral line that grabs viewers' attention\n\
         2. Style suited to Instagram, YouTube Shorts and TikTok\n\
         3. Use emojis sparingly\n\
         4. Include a phrase that invites comments\n\n\
         # Hashtags\n\
         1. Generate 15-20 hashtags\n\
         2. Only use hashtags related to the content\n\
         3. Write them space-separated on a single line\n\n\
         # Output Format\n\n\
         [Description, about 300 characters]\n\n\
         [#hashtag1 #hashtag2 #hashtag3 ...]\n\n\
         IMPORTANT: Write all content in {}.",
        language
    )
}

pub fn build_viral_request(story: &str) -> CompletionRequest {
    let language = resolve_output_language(&[story], None, &CONFIG.story_language);
    CompletionRequest::new(
        "viral",
        &CONFIG.viral,
        vec![
            ChatMessage::system(viral_system_prompt(&language)),
            ChatMessage::user(story),
        ],
    )
}

pub fn parse_viral_response(raw: &str) -> ViralCopy {
    for pattern in [&*KOREAN_TAGS_RE, &*ENGLISH_TAGS_RE] {
        if let Some(caps) = pattern.captures(raw) {
            let part = |idx: usize| {
                caps.get(idx)
                    .map(|m| m.as_str().trim().to_string())
                    .unwrap_or_default()
            };
            return ViralCopy {
                description: part(1),
                hashtags: part(2),
            };
        }
    }

    let mut description_lines: Vec<&str> = Vec::new();
    let mut hashtag_lines: Vec<&str> = Vec::new();
    for line in raw.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('[') {
            continue;
        }
        if line.starts_with('#') || !hashtag_lines.is_empty() {
            hashtag_lines.push(line);
        } else {
            description_lines.push(line);
        }
    }

    if description_lines.is_empty() && hashtag_lines.is_empty() {
        return ViralCopy {
            description: raw.trim().to_string(),
            hashtags: String::new(),
        };
    }

    ViralCopy {
        description: description_lines.join("\n"),
        hashtags: hashtag_lines.join(" "),
    }
}

pub async fn generate_viral<G: CompletionGateway>(
    gateway: &G,
    story: &str,
) -> Result<Generated<ViralCopy>> {
    let completion = complete_text(gateway, build_viral_request(story)).await?;
    Ok(generated(&completion, parse_viral_response(&completion.content)))
}
