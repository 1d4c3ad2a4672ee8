use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::config::CONFIG;
use crate::llm::media::{load_image, ImageSource};
use crate::llm::{ChatMessage, CompletionGateway, CompletionRequest, TokenUsage};
use crate::utils::json::{parse_json_lenient, truncate_for_log};
use crate::utils::pool::run_bounded;

pub const IMAGE_ANALYSIS_PROMPT: &str = r#"Analyze this image so it can be matched to scenes of a short-form story.
Respond with a single JSON object and nothing else:
{
  "description": "one or two sentences describing what is shown",
  "mood": "overall mood in a few words",
  "subjects": ["main subjects, people or objects"],
  "dominantColors": ["up to four dominant colors"]
}"#;

const NO_DESCRIPTION: &str = "No description available";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageDescription {
    pub index: usize,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mood: Option<String>,
    #[serde(default)]
    pub subjects: Vec<String>,
    #[serde(default)]
    pub dominant_colors: Vec<String>,
}

impl ImageDescription {
    pub fn fallback(index: usize) -> Self {
        ImageDescription {
            index,
            description: format!("Image {}", index + 1),
            mood: None,
            subjects: Vec::new(),
            dominant_colors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemLog {
    pub index: usize,
    pub tokens: TokenUsage,
    pub latency_ms: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageAnalysis {
    pub descriptions: Vec<ImageDescription>,
    pub model: String,
    pub usage: TokenUsage,
    pub latency_ms: u64,
    pub item_logs: Vec<ItemLog>,
}

struct ItemOutcome {
    description: ImageDescription,
    log: ItemLog,
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str())
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Normalizes a vision reply into a description. `None` when the reply holds
/// no JSON object.
pub fn parse_image_description(index: usize, raw: &str) -> Option<ImageDescription> {
    let value = parse_json_lenient(raw)?;
    let object = value.as_object()?;

    let description = object
        .get("description")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .unwrap_or(NO_DESCRIPTION)
        .to_string();
    let mood = object
        .get("mood")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string);

    Some(ImageDescription {
        index,
        description,
        mood,
        subjects: string_list(object.get("subjects")),
        dominant_colors: string_list(object.get("dominantColors")),
    })
}

async fn analyze_one<G: CompletionGateway>(
    gateway: &G,
    index: usize,
    source: &ImageSource,
) -> ItemOutcome {
    let started = Instant::now();
    let failed = |error: String, tokens: TokenUsage| {
        warn!("Image {} analysis failed: {}", index, error);
        ItemOutcome {
            description: ImageDescription::fallback(index),
            log: ItemLog {
                index,
                tokens,
                latency_ms: started.elapsed().as_millis() as u64,
                success: false,
                error: Some(error),
            },
        }
    };

    let image = match load_image(source, CONFIG.max_image_bytes).await {
        Ok(image) => image,
        Err(err) => return failed(err.to_string(), TokenUsage::default()),
    };

    let request = CompletionRequest::new(
        "vision",
        &CONFIG.vision,
        vec![ChatMessage::user(IMAGE_ANALYSIS_PROMPT)],
    )
    .with_image(image);

    let completion = match gateway.complete(request).await {
        Ok(completion) => completion,
        Err(err) => return failed(err.to_string(), TokenUsage::default()),
    };

    let latency_ms = started.elapsed().as_millis() as u64;
    match parse_image_description(index, &completion.content) {
        Some(description) => ItemOutcome {
            description,
            log: ItemLog {
                index,
                tokens: completion.usage,
                latency_ms,
                success: true,
                error: None,
            },
        },
        None => {
            // The call itself succeeded; only the reply was unusable.
            warn!(
                "Image {} returned no JSON object: {}",
                index,
                truncate_for_log(&completion.content, 300)
            );
            ItemOutcome {
                description: ImageDescription::fallback(index),
                log: ItemLog {
                    index,
                    tokens: completion.usage,
                    latency_ms,
                    success: true,
                    error: Some("Failed to parse JSON response".to_string()),
                },
            }
        }
    }
}

/// Describes every image with at most `CONFIG.vision_concurrency` vision calls
/// in flight. One description is produced per source, in input order, even
/// when individual images fail.
pub async fn analyze_images<G>(gateway: Arc<G>, sources: Vec<ImageSource>) -> Result<ImageAnalysis>
where
    G: CompletionGateway + 'static,
{
    if sources.len() > CONFIG.max_images {
        return Err(anyhow!(
            "{} images supplied; at most {} are allowed",
            sources.len(),
            CONFIG.max_images
        ));
    }

    let started = Instant::now();
    let total = sources.len();
    let outcomes = run_bounded(sources, CONFIG.vision_concurrency, move |index, source| {
        let gateway = Arc::clone(&gateway);
        async move { analyze_one(gateway.as_ref(), index, &source).await }
    })
    .await;

    let mut slots: Vec<Option<ItemOutcome>> = (0..total).map(|_| None).collect();
    for outcome in outcomes {
        let index = outcome.log.index;
        if let Some(slot) = slots.get_mut(index) {
            *slot = Some(outcome);
        }
    }

    let mut usage = TokenUsage::default();
    let mut descriptions = Vec::with_capacity(total);
    let mut item_logs = Vec::with_capacity(total);
    for (index, slot) in slots.into_iter().enumerate() {
        // A worker that panicked leaves its slot empty.
        let outcome = slot.unwrap_or_else(|| ItemOutcome {
            description: ImageDescription::fallback(index),
            log: ItemLog {
                index,
                tokens: TokenUsage::default(),
                latency_ms: 0,
                success: false,
                error: Some("analysis task did not complete".to_string()),
            },
        });
        usage.add(outcome.log.tokens);
        descriptions.push(outcome.description);
        item_logs.push(outcome.log);
    }

    let failures = item_logs.iter().filter(|log| log.error.is_some()).count();
    info!(
        "Analyzed {} images ({} degraded), tokens={}",
        total, failures, usage.total
    );

    Ok(ImageAnalysis {
        descriptions,
        model: CONFIG.vision.model.clone(),
        usage,
        latency_ms: started.elapsed().as_millis() as u64,
        item_logs,
    })
}
