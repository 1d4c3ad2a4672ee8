use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::CONFIG;
use crate::llm::{ChatMessage, CompletionGateway, CompletionRequest, GatewayError, TokenUsage};
use crate::placement::PlacementContext;
use crate::story::scenes::Phrase;
use crate::utils::json::{parse_json_lenient, truncate_for_log};
use crate::vision::ImageDescription;

const PLACEMENT_SYSTEM_PROMPT: &str = r#"You place images into a short-form story.
The story is split into scenes; each scene has numbered lines (statements).
Every image is described in text. Decide where each image fits best.

# Placement types
- "phrase": the image represents the whole scene, like a background.
- "statement": the image illustrates specific lines of one scene.

# Rules
1. Place every image exactly once.
2. A scene can have at most one "phrase" image.
3. A line can have at most one image.
4. Use only scene and line indices that appear in the input.
5. confidence is a number between 0 and 1.
6. reason is a short explanation of the match.

# Output
Respond with JSON only, no markdown:
{"placements":[{"imageIndex":0,"type":"phrase","phraseIndex":0,"confidence":0.8,"reason":"..."},
 {"imageIndex":1,"type":"statement","phraseIndex":2,"statementIndices":[0,1],"confidence":0.7,"reason":"..."}]}"#;

const PREVIEW_LIMIT: usize = 500;

#[derive(Debug, Error)]
pub enum ProposalError {
    #[error("placement request failed: {0}")]
    Transport(#[from] GatewayError),
    #[error("placement response is not valid JSON ({length} chars)")]
    Parse { length: usize, usage: TokenUsage },
    #[error("placement response has no `placements` array")]
    Shape { usage: TokenUsage },
}

impl ProposalError {
    /// Tokens spent before the failure was detected.
    pub fn usage(&self) -> TokenUsage {
        match self {
            ProposalError::Transport(_) => TokenUsage::default(),
            ProposalError::Parse { usage, .. } | ProposalError::Shape { usage } => *usage,
        }
    }
}

/// Raw, untrusted candidates plus the metadata of the call that produced them.
#[derive(Debug, Clone)]
pub struct Proposal {
    pub candidates: Vec<Value>,
    pub model: String,
    pub usage: TokenUsage,
    pub latency_ms: u64,
    pub finish_reason: Option<String>,
}

fn describe_image(image: &ImageDescription) -> String {
    let mut line = format!("Image {}: {}", image.index, image.description.trim());
    if let Some(mood) = image.mood.as_deref().filter(|m| !m.trim().is_empty()) {
        line.push_str(&format!("\n  mood: {}", mood.trim()));
    }
    if !image.subjects.is_empty() {
        line.push_str(&format!("\n  subjects: {}", image.subjects.join(", ")));
    }
    if !image.dominant_colors.is_empty() {
        line.push_str(&format!("\n  colors: {}", image.dominant_colors.join(", ")));
    }
    line
}

fn describe_context(context: &PlacementContext) -> String {
    let mut sections = Vec::new();

    let characters = context
        .characters
        .iter()
        .filter(|c| !c.name.trim().is_empty())
        .map(|c| {
            let traits = c
                .traits
                .iter()
                .map(|t| t.trim())
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>();
            if traits.is_empty() {
                format!("- {}", c.name.trim())
            } else {
                format!("- {}: {}", c.name.trim(), traits.join(", "))
            }
        })
        .collect::<Vec<_>>();
    if !characters.is_empty() {
        sections.push(format!("# Characters\n{}", characters.join("\n")));
    }

    let locations = context
        .locations
        .iter()
        .filter(|l| !l.location.trim().is_empty())
        .map(|l| format!("- Scene {}: {}", l.phrase_index, l.location.trim()))
        .collect::<Vec<_>>();
    if !locations.is_empty() {
        sections.push(format!("# Locations\n{}", locations.join("\n")));
    }

    sections.join("\n\n")
}

pub fn build_placement_prompt(
    phrases: &[Phrase],
    descriptions: &[ImageDescription],
    context: Option<&PlacementContext>,
) -> String {
    let scenes = phrases
        .iter()
        .map(|phrase| {
            let lines = phrase
                .statements
                .iter()
                .map(|stmt| format!("  [{}] {}", stmt.index, stmt.display_text))
                .collect::<Vec<_>>()
                .join("\n");
            format!("Scene {}:\n{}", phrase.index, lines)
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    let images = descriptions
        .iter()
        .map(describe_image)
        .collect::<Vec<_>>()
        .join("\n");

    let mut prompt = format!(
        "# Scenes ({} total)\n{}\n\n# Images ({} total)\n{}",
        phrases.len(),
        scenes,
        descriptions.len(),
        images
    );
    if let Some(context) = context.filter(|c| !c.is_empty()) {
        prompt.push_str("\n\n");
        prompt.push_str(&describe_context(context));
    }
    prompt.push_str(&format!(
        "\n\nPlace all {} images. Valid imageIndex values are 0 to {}.",
        descriptions.len(),
        descriptions.len().saturating_sub(1)
    ));
    prompt
}

pub fn build_placement_request(
    phrases: &[Phrase],
    descriptions: &[ImageDescription],
    context: Option<&PlacementContext>,
) -> CompletionRequest {
    CompletionRequest::new(
        "placement",
        &CONFIG.placement,
        vec![
            ChatMessage::system(PLACEMENT_SYSTEM_PROMPT),
            ChatMessage::user(build_placement_prompt(phrases, descriptions, context)),
        ],
    )
    .json_mode(CONFIG.placement_json_mode)
}

fn tail_chars(text: &str, limit: usize) -> String {
    let chars = text.chars().collect::<Vec<_>>();
    chars[chars.len().saturating_sub(limit)..].iter().collect()
}

/// Classifies a reply as a candidate list, a parse failure or a shape failure.
pub fn parse_proposal(raw: &str, usage: TokenUsage) -> Result<Vec<Value>, ProposalError> {
    let Some(value) = parse_json_lenient(raw) else {
        warn!(
            "Placement response is not JSON: length={} tail={}",
            raw.len(),
            tail_chars(raw, 200)
        );
        return Err(ProposalError::Parse {
            length: raw.len(),
            usage,
        });
    };

    match value.get("placements").and_then(|v| v.as_array()) {
        Some(candidates) => Ok(candidates.clone()),
        None => {
            warn!(
                "Placement response has no placements array: {}",
                truncate_for_log(&value.to_string(), PREVIEW_LIMIT)
            );
            Err(ProposalError::Shape { usage })
        }
    }
}

pub async fn propose<G: CompletionGateway>(
    gateway: &G,
    phrases: &[Phrase],
    descriptions: &[ImageDescription],
    context: Option<&PlacementContext>,
) -> Result<Proposal, ProposalError> {
    let request = build_placement_request(phrases, descriptions, context);
    debug!(
        "Placement prompt length: {} chars",
        request.messages[1].content.chars().count()
    );

    let completion = gateway.complete(request).await?;
    info!(
        "Placement response: latency_ms={} finish_reason={:?} input={} output={} length={}",
        completion.latency_ms,
        completion.finish_reason,
        completion.usage.input,
        completion.usage.output,
        completion.content.len()
    );
    if completion.was_truncated() {
        warn!("Placement response was truncated by the token limit");
    }
    debug!(
        "Placement response preview: {}",
        truncate_for_log(&completion.content, PREVIEW_LIMIT)
    );

    let candidates = parse_proposal(&completion.content, completion.usage)?;
    Ok(Proposal {
        candidates,
        model: completion.model,
        usage: completion.usage,
        latency_ms: completion.latency_ms,
        finish_reason: completion.finish_reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placement::{CharacterNote, LocationNote};
    use crate::story::scenes::{build_phrases, SceneBlock};

    fn scenes() -> Vec<Phrase> {
        build_phrases(&[
            SceneBlock {
                scene_number: 1,
                content: "The door creaked.\nNobody was there.".to_string(),
            },
            SceneBlock {
                scene_number: 2,
                content: "The phone rang.".to_string(),
            },
        ])
    }

    #[test]
    fn prompt_indexes_scenes_statements_and_images() {
        let mut image = ImageDescription::fallback(0);
        image.description = "A dark hallway".to_string();
        image.mood = Some("tense".to_string());
        let prompt = build_placement_prompt(&scenes(), &[image], None);
        assert!(prompt.contains("Scene 0:\n  [0] The door creaked.\n  [1] Nobody was there."));
        assert!(prompt.contains("Scene 1:\n  [0] The phone rang."));
        assert!(prompt.contains("Image 0: A dark hallway\n  mood: tense"));
        assert!(prompt.contains("0 to 0"));
        assert!(!prompt.contains("# Characters"));
    }

    #[test]
    fn context_is_appended_only_when_present() {
        let context = PlacementContext {
            characters: vec![CharacterNote {
                name: "Mina".to_string(),
                traits: vec!["red coat".to_string()],
            }],
            locations: vec![LocationNote {
                phrase_index: 1,
                location: "kitchen".to_string(),
            }],
        };
        let images = [ImageDescription::fallback(0)];
        let prompt = build_placement_prompt(&scenes(), &images, Some(&context));
        assert!(prompt.contains("# Characters\n- Mina: red coat"));
        assert!(prompt.contains("# Locations\n- Scene 1: kitchen"));

        let empty = PlacementContext::default();
        let prompt = build_placement_prompt(&scenes(), &images, Some(&empty));
        assert!(!prompt.contains("# Locations"));
    }

    #[test]
    fn classifies_parse_and_shape_failures() {
        let usage = TokenUsage::new(3, 4);
        match parse_proposal("no json at all", usage) {
            Err(ProposalError::Parse { length, usage: spent }) => {
                assert_eq!(length, 14);
                assert_eq!(spent, usage);
            }
            other => panic!("expected parse failure, got {:?}", other),
        }
        assert!(matches!(
            parse_proposal(r#"{"result": []}"#, usage),
            Err(ProposalError::Shape { .. })
        ));
        assert!(matches!(
            parse_proposal(r#"[{"imageIndex": 0}]"#, usage),
            Err(ProposalError::Shape { .. })
        ));
        assert!(matches!(
            parse_proposal(r#"{"placements": {"imageIndex": 0}}"#, usage),
            Err(ProposalError::Shape { .. })
        ));
    }

    #[test]
    fn extracts_candidates_from_wrapped_reply() {
        let raw = "Here is the plan:\n{\"placements\":[{\"imageIndex\":0},{\"bogus\":true}]}\nThanks!";
        let candidates = parse_proposal(raw, TokenUsage::default()).unwrap();
        assert_eq!(candidates.len(), 2);
    }

    #[test]
    fn transport_errors_carry_no_usage() {
        let err = ProposalError::from(GatewayError::EmptyResponse);
        assert_eq!(err.usage(), TokenUsage::default());
    }
}
