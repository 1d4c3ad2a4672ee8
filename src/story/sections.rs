use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::CONFIG;
use crate::llm::{ChatMessage, CompletionGateway, CompletionRequest};
use crate::story::{complete_text, generated, Generated};
use crate::utils::language::resolve_output_language;

static VARIANT_HEADER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"== (.*?) ==\s*\n").expect("valid variant header regex"));

const MISSING_BODY: &str = "(BODY content not provided)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HookType {
    #[default]
    Auto,
    Question,
    ShockingFact,
    Contrast,
    StoryTeaser,
    Statistics,
    ActionInducing,
}

impl HookType {
    pub const ALL: [HookType; 7] = [
        HookType::Auto,
        HookType::Question,
        HookType::ShockingFact,
        HookType::Contrast,
        HookType::StoryTeaser,
        HookType::Statistics,
        HookType::ActionInducing,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            HookType::Auto => "auto",
            HookType::Question => "question",
            HookType::ShockingFact => "shocking_fact",
            HookType::Contrast => "contrast",
            HookType::StoryTeaser => "story_teaser",
            HookType::Statistics => "statistics",
            HookType::ActionInducing => "action_inducing",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            HookType::Auto => "automatic",
            HookType::Question => "question-style",
            HookType::ShockingFact => "shocking-fact",
            HookType::Contrast => "contrast-style",
            HookType::StoryTeaser => "story-teaser",
            HookType::Statistics => "statistics-driven",
            HookType::ActionInducing => "action-inducing",
        }
    }
}

impl FromStr for HookType {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let normalized = value.trim().to_lowercase().replace('-', "_");
        HookType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| anyhow!("Unknown hook type '{}'", value))
    }
}

impl fmt::Display for HookType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CtaType {
    #[default]
    Auto,
    Engagement,
    Subscribe,
    Extend,
    Convert,
    Urgent,
}

impl CtaType {
    pub const ALL: [CtaType; 6] = [
        CtaType::Auto,
        CtaType::Engagement,
        CtaType::Subscribe,
        CtaType::Extend,
        CtaType::Convert,
        CtaType::Urgent,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CtaType::Auto => "auto",
            CtaType::Engagement => "engagement",
            CtaType::Subscribe => "subscribe",
            CtaType::Extend => "extend",
            CtaType::Convert => "convert",
            CtaType::Urgent => "urgent",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            CtaType::Auto => "automatic",
            CtaType::Engagement => "engagement-driving",
            CtaType::Subscribe => "subscribe/follow",
            CtaType::Extend => "keep-watching",
            CtaType::Convert => "action-conversion",
            CtaType::Urgent => "act-now urgency",
        }
    }
}

impl FromStr for CtaType {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let normalized = value.trim().to_lowercase();
        CtaType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| anyhow!("Unknown CTA type '{}'", value))
    }
}

impl fmt::Display for CtaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn body_or_placeholder(body: &str) -> &str {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        MISSING_BODY
    } else {
        trimmed
    }
}

fn hook_system_prompt(body: &str, language: &str) -> String {
    format!(
        "You are a professional content HOOK writer.\n\
         Create a hook that grabs viewers' attention based on the user's BODY story.\n\
         Identify the core of the BODY and make a strong first impression.\n\n\
         - Write the HOOK as a single, concise and powerful sentence.\n\
         - Do not use markdown.\n\
         - Reflect the tone of the BODY.\n\
         - IMPORTANT: Write the HOOK in {language}.\n\n\
         # Body Story (BODY)\n{body}\n\n\
         # HOOK Examples\n\
         - Question: arouse curiosity - \"Did you know about XX?\"\n\
         - Shocking fact: hint at a twist - \"Most people completely misunderstand XX.\"\n\
         - Contrast: create tension - \"XX vs XX, which is more dangerous?\"\n\
         - Story teaser: hint at the arc - \"A man who XX eventually ends up XX.\"\n\
         - Statistics: lean on a striking number - \"8 out of 10 people fail because of XX.\"\n\
         - Action inducing: guide the viewer - \"Watch until the end to learn XX.\"",
        body = body_or_placeholder(body),
        language = language,
    )
}

fn cta_system_prompt(body: &str, language: &str) -> String {
    format!(
        "You are a professional CTA (Call To Action) writer.\n\
         Create a CTA that closes the user's BODY story and drives viewer action.\n\n\
         - The CTA is placed at the end of the BODY.\n\
         - Write the CTA as a single, concise and clear sentence.\n\
         - Do not use markdown.\n\
         - Reflect the tone and atmosphere of the BODY.\n\
         - IMPORTANT: Write the CTA in {language}.\n\n\
         # Body (BODY)\n{body}\n\n\
         # CTA Examples\n\
         - Engagement: \"Share your thoughts in the comments.\"\n\
         - Subscribe/follow: \"Follow so you don't miss the next story.\"\n\
         - Keep watching: \"The sequel is even wilder. It's in the next video.\"\n\
         - Action conversion: \"Check the link in my profile for more.\"\n\
         - Urgency: \"This won't be up for long. Act now.\"",
        body = body_or_placeholder(body),
        language = language,
    )
}

fn variant_user_message(section: &str, is_auto: bool, label: &str) -> String {
    if is_auto {
        format!(
            "Based on the BODY story above, please write the most suitable {}.",
            section
        )
    } else {
        format!(
            "Based on the BODY story above, please write a {} {}.",
            label, section
        )
    }
}

fn output_language(body: &str) -> String {
    resolve_output_language(&[body], None, &CONFIG.story_language)
}

pub fn build_hook_request(body: &str, hook_type: HookType) -> CompletionRequest {
    CompletionRequest::new(
        "hook",
        &CONFIG.hook,
        vec![
            ChatMessage::system(hook_system_prompt(body, &output_language(body))),
            ChatMessage::user(variant_user_message(
                "HOOK",
                hook_type == HookType::Auto,
                hook_type.label(),
            )),
        ],
    )
}

pub fn build_cta_request(body: &str, cta_type: CtaType) -> CompletionRequest {
    CompletionRequest::new(
        "cta",
        &CONFIG.cta,
        vec![
            ChatMessage::system(cta_system_prompt(body, &output_language(body))),
            ChatMessage::user(variant_user_message(
                "closing CTA",
                cta_type == CtaType::Auto,
                cta_type.label(),
            )),
        ],
    )
}

/// Splits `== NAME ==` blocks into ordered `(name, text)` pairs. Without any
/// block the whole response is returned under `auto`.
pub fn parse_variants(raw: &str) -> Vec<(String, String)> {
    let mut variants: Vec<(String, String)> = Vec::new();
    let mut cursor = 0;

    while let Some(caps) = VARIANT_HEADER_RE.captures_at(raw, cursor) {
        let (Some(header), Some(name)) = (caps.get(0), caps.get(1)) else {
            break;
        };
        let body_start = header.end();
        let body_end = raw[body_start..]
            .find("\n\n==")
            .map(|offset| body_start + offset)
            .unwrap_or(raw.len());

        let name = name.as_str().trim().to_string();
        let text = raw[body_start..body_end].trim().to_string();
        match variants.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = text,
            None => variants.push((name, text)),
        }
        cursor = body_end;
    }

    if variants.is_empty() {
        variants.push(("auto".to_string(), raw.trim().to_string()));
    }
    variants
}

pub async fn generate_hook<G: CompletionGateway>(
    gateway: &G,
    body: &str,
    hook_type: HookType,
) -> Result<Generated<Vec<(String, String)>>> {
    let completion = complete_text(gateway, build_hook_request(body, hook_type)).await?;
    Ok(generated(&completion, parse_variants(&completion.content)))
}

pub async fn generate_cta<G: CompletionGateway>(
    gateway: &G,
    body: &str,
    cta_type: CtaType,
) -> Result<Generated<Vec<(String, String)>>> {
    let completion = complete_text(gateway, build_cta_request(body, cta_type)).await?;
    Ok(generated(&completion, parse_variants(&completion.content)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedGateway;

    #[test]
    fn parses_named_variants_in_order() {
        let raw = "== question ==\nDid you know?\n\n== contrast ==\nCats vs dogs.\nReally.";
        let variants = parse_variants(raw);
        assert_eq!(
            variants,
            vec![
                ("question".to_string(), "Did you know?".to_string()),
                ("contrast".to_string(), "Cats vs dogs.\nReally.".to_string()),
            ]
        );
    }

    #[test]
    fn plain_response_becomes_auto() {
        assert_eq!(
            parse_variants("  Just one hook.  "),
            vec![("auto".to_string(), "Just one hook.".to_string())]
        );
    }

    #[test]
    fn repeated_names_keep_first_position_and_last_text() {
        let raw = "== a ==\none\n\n== b ==\ntwo\n\n== a ==\nthree";
        let variants = parse_variants(raw);
        assert_eq!(variants.len(), 2);
        assert_eq!(variants[0], ("a".to_string(), "three".to_string()));
    }

    #[test]
    fn types_parse_from_cli_names() {
        assert_eq!("shocking-fact".parse::<HookType>().unwrap(), HookType::ShockingFact);
        assert_eq!(" URGENT ".parse::<CtaType>().unwrap(), CtaType::Urgent);
        assert!("loud".parse::<HookType>().is_err());
    }

    #[test]
    fn empty_body_uses_placeholder() {
        let prompt = hook_system_prompt("  ", "English");
        assert!(prompt.contains(MISSING_BODY));
        let request = build_cta_request("", CtaType::Subscribe);
        assert!(request.messages[1].content.contains("subscribe/follow"));
    }

    #[tokio::test]
    async fn hook_generation_parses_variants() {
        let gateway = ScriptedGateway::replying("== auto ==\nYou won't believe this.");
        let hooks = generate_hook(&gateway, "body text", HookType::Auto)
            .await
            .unwrap();
        assert_eq!(hooks.output[0].1, "You won't believe this.");
        assert_eq!(gateway.requests.lock()[0].operation, "hook");
    }
}
