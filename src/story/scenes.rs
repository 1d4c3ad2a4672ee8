use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::CONFIG;
use crate::llm::{ChatMessage, CompletionGateway, CompletionRequest};
use crate::story::{complete_text, generated, Generated};

static DIALOGUE_START_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^\(([^)]+)\)"(.*)$"#).expect("valid dialogue regex"));
static SCENE_HEADER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)scene\s+(\d+)\s*\n").expect("valid scene header regex"));
static SCENE_BOUNDARY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)scene\s+\d+").expect("valid scene boundary regex"));

const SPLIT_SCENE_SYSTEM_PROMPT: &str = r#"You are a specialist at dividing stories into short scenes.
Split the given story into scenes according to the rules below.

# Most Important Rule
Do not change a single character of the original story.
- Copy the original text as-is.
- Only add line breaks, "scene" separators and dialogue tags.
- Place scene transitions where they feel natural.

# Output Rules
1. Start every scene with a "scene N" line.
2. Keep each scene small: 2-4 lines of content.
3. Keep each line short, around 20 characters.
4. Split long sentences over several lines.

# Dialogue Rules
- When dialogue spans several lines, close the quote at the end of each line and reopen it on the next.
- Repeat the (character) tag on every dialogue line.
- Omit the (character) tag when only one character speaks.

## Dialogue Format
(Lady)"Hello. I am"
(Lady)"the person living next door."

# Output Format
scene 1
(2-4 lines)

scene 2
(2-4 lines)

..."#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneBlock {
    pub scene_number: usize,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Statement {
    pub id: String,
    pub index: usize,
    pub display_text: String,
}

/// One scene of the story. Always holds at least one statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Phrase {
    pub id: String,
    pub index: usize,
    pub statements: Vec<Statement>,
}

pub fn build_split_scene_request(story: &str) -> CompletionRequest {
    CompletionRequest::new(
        "split_scene",
        &CONFIG.split_scene,
        vec![
            ChatMessage::system(SPLIT_SCENE_SYSTEM_PROMPT),
            ChatMessage::user(format!(
                "Please split the following story into scenes:\n\n{}",
                story
            )),
        ],
    )
}

/// Re-tags multi-line dialogue so that every line carries its `(Name)` tag
/// and its own closing quote.
pub fn format_dialogue_lines(content: &str) -> String {
    let mut result: Vec<String> = Vec::new();
    let mut speaker: Option<String> = None;

    for line in content.split('\n') {
        let trimmed = line.trim();

        if let Some(caps) = DIALOGUE_START_RE.captures(trimmed) {
            let name = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            let spoken = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            if spoken.ends_with('"') {
                result.push(trimmed.to_string());
                speaker = None;
            } else {
                result.push(format!("({})\"{}\"", name, spoken));
                speaker = Some(name.to_string());
            }
            continue;
        }

        match speaker.as_deref() {
            Some(name) if !trimmed.is_empty() => {
                if let Some(spoken) = trimmed.strip_suffix('"') {
                    result.push(format!("({})\"{}\"", name, spoken));
                    speaker = None;
                } else {
                    result.push(format!("({})\"{}\"", name, trimmed));
                }
            }
            _ => {
                if trimmed.is_empty() {
                    speaker = None;
                }
                result.push(line.to_string());
            }
        }
    }

    result.join("\n")
}

/// Extracts `scene N` blocks in order. Blocks without content are skipped.
pub fn parse_split_scene_response(raw: &str) -> Vec<SceneBlock> {
    let formatted = format_dialogue_lines(raw);
    let mut blocks = Vec::new();
    let mut cursor = 0;

    while let Some(caps) = SCENE_HEADER_RE.captures_at(&formatted, cursor) {
        let (Some(header), Some(number)) = (caps.get(0), caps.get(1)) else {
            break;
        };
        let body_start = header.end();
        let body_end = SCENE_BOUNDARY_RE
            .find_at(&formatted, body_start)
            .map(|m| m.start())
            .unwrap_or(formatted.len());

        let content = formatted[body_start..body_end].trim();
        if !content.is_empty() {
            blocks.push(SceneBlock {
                scene_number: number.as_str().parse().unwrap_or_default(),
                content: content.to_string(),
            });
        }
        cursor = body_end;
    }

    debug!("Parsed {} scene blocks", blocks.len());
    blocks
}

/// Builds the scene coordinate space with contiguous indices. Blocks with no
/// non-empty line are dropped.
pub fn build_phrases(blocks: &[SceneBlock]) -> Vec<Phrase> {
    let mut phrases = Vec::with_capacity(blocks.len());
    for block in blocks {
        let lines = block
            .content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>();
        if lines.is_empty() {
            continue;
        }

        let index = phrases.len();
        let statements = lines
            .into_iter()
            .enumerate()
            .map(|(stmt_index, line)| Statement {
                id: format!("phrase-{}-stmt-{}", index, stmt_index),
                index: stmt_index,
                display_text: line.to_string(),
            })
            .collect();
        phrases.push(Phrase {
            id: format!("phrase-{}", index),
            index,
            statements,
        });
    }
    phrases
}

/// Re-establishes the scene invariants on scenes that came from outside,
/// e.g. an input file: blank statements and scenes left without statements
/// are dropped, then ids and indices are renumbered from 0 in list order.
pub fn normalize_phrases(phrases: Vec<Phrase>) -> Vec<Phrase> {
    let mut normalized = Vec::with_capacity(phrases.len());
    for phrase in phrases {
        let lines = phrase
            .statements
            .into_iter()
            .map(|stmt| stmt.display_text.trim().to_string())
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>();
        if lines.is_empty() {
            warn!("Dropping scene {} ({}) with no statements", phrase.index, phrase.id);
            continue;
        }

        let index = normalized.len();
        let statements = lines
            .into_iter()
            .enumerate()
            .map(|(stmt_index, display_text)| Statement {
                id: format!("phrase-{}-stmt-{}", index, stmt_index),
                index: stmt_index,
                display_text,
            })
            .collect();
        normalized.push(Phrase {
            id: format!("phrase-{}", index),
            index,
            statements,
        });
    }
    normalized
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitStory {
    pub blocks: Vec<SceneBlock>,
    pub phrases: Vec<Phrase>,
}

pub async fn split_story<G: CompletionGateway>(
    gateway: &G,
    story: &str,
) -> Result<Generated<SplitStory>> {
    let completion = complete_text(gateway, build_split_scene_request(story)).await?;
    let blocks = parse_split_scene_response(&completion.content);
    let phrases = build_phrases(&blocks);
    if phrases.is_empty() {
        return Err(anyhow!("Scene split returned no usable scenes"));
    }
    info!(
        "Split story into {} scenes with {} statements",
        phrases.len(),
        phrases.iter().map(|p| p.statements.len()).sum::<usize>()
    );
    Ok(generated(&completion, SplitStory { blocks, phrases }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedGateway;

    #[test]
    fn dialogue_lines_are_retagged() {
        let raw = "(Lady)\"Hello. I am\nthe person next door.\"\nShe smiled.";
        let formatted = format_dialogue_lines(raw);
        assert_eq!(
            formatted,
            "(Lady)\"Hello. I am\"\n(Lady)\"the person next door.\"\nShe smiled."
        );
    }

    #[test]
    fn blank_line_ends_open_dialogue() {
        let raw = "(Jun)\"Wait\n\nNarration continues";
        let formatted = format_dialogue_lines(raw);
        assert_eq!(formatted, "(Jun)\"Wait\"\n\nNarration continues");
    }

    #[test]
    fn closed_dialogue_passes_through() {
        assert_eq!(format_dialogue_lines("(Mom)\"Dinner!\""), "(Mom)\"Dinner!\"");
    }

    #[test]
    fn parses_scene_blocks_and_skips_empty_ones() {
        let raw = "Here you go.\nscene 1\nI opened the door.\nNobody was there.\n\nscene 2\n\nSCENE 3\nThen the phone rang.\n";
        let blocks = parse_split_scene_response(raw);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].scene_number, 1);
        assert_eq!(blocks[0].content, "I opened the door.\nNobody was there.");
        assert_eq!(blocks[1].scene_number, 3);
        assert_eq!(blocks[1].content, "Then the phone rang.");
    }

    #[test]
    fn phrases_have_contiguous_ids() {
        let blocks = vec![
            SceneBlock {
                scene_number: 1,
                content: "a\n\n  b  ".to_string(),
            },
            SceneBlock {
                scene_number: 2,
                content: "   \n".to_string(),
            },
            SceneBlock {
                scene_number: 3,
                content: "c".to_string(),
            },
        ];
        let phrases = build_phrases(&blocks);
        assert_eq!(phrases.len(), 2);
        assert_eq!(phrases[0].id, "phrase-0");
        assert_eq!(phrases[0].statements[1].id, "phrase-0-stmt-1");
        assert_eq!(phrases[0].statements[1].display_text, "b");
        assert_eq!(phrases[1].index, 1);
        assert_eq!(phrases[1].statements[0].id, "phrase-1-stmt-0");
    }

    #[test]
    fn phrases_serialize_in_camel_case() {
        let phrases = build_phrases(&[SceneBlock {
            scene_number: 1,
            content: "line".to_string(),
        }]);
        let value = serde_json::to_value(&phrases).unwrap();
        assert_eq!(value[0]["statements"][0]["displayText"], "line");
    }

    #[tokio::test]
    async fn split_story_without_scenes_fails() {
        let gateway = ScriptedGateway::replying("I could not split this.");
        assert!(split_story(&gateway, "story").await.is_err());

        let gateway = ScriptedGateway::replying("scene 1\nline one\nline two");
        let split = split_story(&gateway, "story").await.unwrap();
        assert_eq!(split.output.phrases[0].statements.len(), 2);
    }

    fn scene(index: usize, lines: &[&str]) -> Phrase {
        Phrase {
            id: format!("custom-{}", index),
            index,
            statements: lines
                .iter()
                .enumerate()
                .map(|(i, text)| Statement {
                    id: format!("s{}", i),
                    index: i + 5,
                    display_text: text.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn normalizing_drops_empty_scenes_and_renumbers() {
        let phrases = normalize_phrases(vec![
            scene(1, &[]),
            scene(2, &["  ", "The door creaked. "]),
            scene(7, &["Nobody was there.", "Then the phone rang."]),
        ]);

        assert_eq!(phrases.len(), 2);
        assert_eq!(phrases[0].index, 0);
        assert_eq!(phrases[0].id, "phrase-0");
        assert_eq!(phrases[0].statements.len(), 1);
        assert_eq!(phrases[0].statements[0].index, 0);
        assert_eq!(phrases[0].statements[0].display_text, "The door creaked.");
        assert_eq!(phrases[1].index, 1);
        assert_eq!(phrases[1].statements[1].id, "phrase-1-stmt-1");
        assert_eq!(phrases[1].statements[1].index, 1);
    }

    #[test]
    fn normalizing_built_phrases_changes_nothing() {
        let blocks = parse_split_scene_response("scene 1\na\nb\nscene 2\nc");
        let phrases = build_phrases(&blocks);
        assert_eq!(normalize_phrases(phrases.clone()), phrases);
    }
}
