pub mod fallback;
pub mod proposal;
pub mod resolver;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::llm::{CompletionGateway, TokenUsage};
use crate::story::scenes::Phrase;
use crate::utils::timing::StageTimer;
use crate::vision::ImageDescription;

use self::fallback::{fallback_all, fill_missing, FALLBACK_PREFIX};
use self::proposal::propose;
use self::resolver::resolve;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlacementKind {
    /// The image stands for the whole scene.
    Phrase,
    /// The image is anchored to specific lines of a scene.
    Statement,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagePlacement {
    pub image_index: usize,
    #[serde(rename = "type")]
    pub kind: PlacementKind,
    pub phrase_index: usize,
    /// Present, sorted and non-empty exactly when `kind` is `Statement`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statement_indices: Option<Vec<usize>>,
    pub confidence: f64,
    pub reason: String,
}

impl ImagePlacement {
    pub fn is_fallback(&self) -> bool {
        self.reason.starts_with(FALLBACK_PREFIX)
    }

    pub fn claimed_statements(&self) -> &[usize] {
        match (self.kind, &self.statement_indices) {
            (PlacementKind::Statement, Some(indices)) => indices,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CharacterNote {
    pub name: String,
    pub traits: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocationNote {
    pub phrase_index: usize,
    pub location: String,
}

/// Extra story knowledge that helps the model match images to scenes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlacementContext {
    pub characters: Vec<CharacterNote>,
    pub locations: Vec<LocationNote>,
}

impl PlacementContext {
    pub fn is_empty(&self) -> bool {
        self.characters.iter().all(|c| c.name.trim().is_empty())
            && self.locations.iter().all(|l| l.location.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementSource {
    /// Nothing to place.
    Empty,
    /// Every image came from the model's proposal.
    Ai,
    /// The proposal covered only part of the images; the rest were filled.
    PartialFill,
    /// The proposal was unusable and every image was distributed.
    Fallback,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementOutcome {
    pub placements: Vec<ImagePlacement>,
    pub source: PlacementSource,
    pub model: Option<String>,
    pub usage: TokenUsage,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

impl PlacementOutcome {
    fn without_call(placements: Vec<ImagePlacement>, source: PlacementSource) -> Self {
        PlacementOutcome {
            placements,
            source,
            model: None,
            usage: TokenUsage::default(),
            latency_ms: 0,
            finish_reason: None,
        }
    }
}

/// Maps every image onto the scene model. Never fails: proposal problems
/// degrade to fallback placements with lower confidence. The result holds
/// exactly one placement per image, sorted by `image_index`.
pub async fn place_images<G: CompletionGateway>(
    gateway: &G,
    phrases: &[Phrase],
    descriptions: &[ImageDescription],
    context: Option<&PlacementContext>,
) -> PlacementOutcome {
    let image_count = descriptions.len();
    if image_count == 0 {
        return PlacementOutcome::without_call(Vec::new(), PlacementSource::Empty);
    }
    if phrases.is_empty() {
        warn!("No scenes to place {} images into; using fallback", image_count);
        return PlacementOutcome::without_call(
            fallback_all(image_count, 0),
            PlacementSource::Fallback,
        );
    }

    let mut timer = StageTimer::start("placement");
    info!(
        "Starting placement: scenes={} images={} statements={}",
        phrases.len(),
        image_count,
        phrases.iter().map(|p| p.statements.len()).sum::<usize>()
    );

    let proposal = match propose(gateway, phrases, descriptions, context).await {
        Ok(proposal) => proposal,
        Err(err) => {
            warn!("Placement proposal failed, distributing all images: {}", err);
            timer.mark_status("fallback", Some(err.to_string()));
            let mut outcome = PlacementOutcome::without_call(
                fallback_all(image_count, phrases.len()),
                PlacementSource::Fallback,
            );
            outcome.usage = err.usage();
            return outcome;
        }
    };

    let resolved = resolve(&proposal.candidates, phrases, image_count);
    info!(
        "Resolved {} of {} raw candidates",
        resolved.len(),
        proposal.candidates.len()
    );

    let (mut placements, source) = if resolved.is_empty() {
        warn!("No valid placements in proposal; distributing all images");
        timer.mark_status("fallback", Some("no valid placements".to_string()));
        (fallback_all(image_count, phrases.len()), PlacementSource::Fallback)
    } else if resolved.len() < image_count {
        warn!(
            "Only {}/{} images placed, filling gaps",
            resolved.len(),
            image_count
        );
        timer.mark_status("partial", None);
        (
            fill_missing(resolved, image_count, phrases.len()),
            PlacementSource::PartialFill,
        )
    } else {
        (resolved, PlacementSource::Ai)
    };
    placements.sort_by_key(|placement| placement.image_index);

    PlacementOutcome {
        placements,
        source,
        model: Some(proposal.model),
        usage: proposal.usage,
        latency_ms: proposal.latency_ms,
        finish_reason: proposal.finish_reason,
    }
}
