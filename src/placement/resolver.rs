//! Turns untrusted placement candidates into a conflict-free set.
//!
//! Three passes run in order over a batch: structural validation, scene
//! (phrase) conflicts, then line (statement) conflicts. Ties on confidence
//! always go to the placement seen first, so the outcome only depends on the
//! candidate order. The two conflict passes are not iterated: a placement that
//! loses every line is turned back into a scene image even if that scene
//! already has one.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use serde_json::Value;
use tracing::{debug, warn};

use crate::placement::{ImagePlacement, PlacementKind};
use crate::story::scenes::Phrase;

pub const DEFAULT_CONFIDENCE: f64 = 0.7;
pub const DEFAULT_REASON: &str = "Placed by AI analysis";

const SCENE_REASSIGN_PENALTY: f64 = 0.9;
const SCENE_TO_LINE_PENALTY: f64 = 0.7;
const LINE_TO_SCENE_PENALTY: f64 = 0.8;

fn as_image_index(value: Option<&Value>) -> Option<usize> {
    let value = value?;
    if let Some(index) = value.as_u64() {
        return usize::try_from(index).ok();
    }
    let number = value.as_f64()?;
    if number.is_finite() && number >= 0.0 && number.fract() == 0.0 {
        return Some(number as usize);
    }
    None
}

fn as_index_floor(value: &Value) -> Option<usize> {
    let number = value.as_f64()?;
    if !number.is_finite() || number < 0.0 {
        return None;
    }
    Some(number.floor() as usize)
}

fn clamp_phrase_index(value: Option<&Value>, scene_count: usize) -> usize {
    let last = scene_count.saturating_sub(1);
    match value.and_then(|v| v.as_f64()) {
        Some(number) if number.is_finite() && number > 0.0 => (number.floor() as usize).min(last),
        _ => 0,
    }
}

fn normalize_statement_indices(value: Option<&Value>, statement_count: usize) -> Vec<usize> {
    let last = statement_count.saturating_sub(1);
    let indices = value
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(as_index_floor)
                .map(|index| index.min(last))
                .collect::<BTreeSet<_>>()
        })
        .unwrap_or_default();

    if indices.is_empty() {
        vec![0]
    } else {
        indices.into_iter().collect()
    }
}

/// Stage A: drops candidates without a usable, unseen `imageIndex` and
/// clamps everything else into range. The first candidate for an image wins.
pub fn validate_candidates(
    candidates: &[Value],
    phrases: &[Phrase],
    image_count: usize,
) -> Vec<ImagePlacement> {
    if phrases.is_empty() {
        return Vec::new();
    }

    let mut seen = HashSet::new();
    let mut placements = Vec::with_capacity(candidates.len());

    for candidate in candidates {
        let Some(object) = candidate.as_object() else {
            warn!("Skipping non-object placement candidate: {}", candidate);
            continue;
        };

        let Some(image_index) =
            as_image_index(object.get("imageIndex")).filter(|index| *index < image_count)
        else {
            warn!("Skipping candidate with invalid imageIndex: {:?}", object.get("imageIndex"));
            continue;
        };
        if !seen.insert(image_index) {
            warn!("Skipping duplicate candidate for image {}", image_index);
            continue;
        }

        let phrase_index = clamp_phrase_index(object.get("phraseIndex"), phrases.len());
        let kind = match object.get("type").and_then(|v| v.as_str()) {
            Some("statement") => PlacementKind::Statement,
            _ => PlacementKind::Phrase,
        };
        let confidence = object
            .get("confidence")
            .and_then(|v| v.as_f64())
            .map(|c| c.clamp(0.0, 1.0))
            .unwrap_or(DEFAULT_CONFIDENCE);
        let reason = object
            .get("reason")
            .and_then(|v| v.as_str())
            .filter(|r| !r.trim().is_empty())
            .unwrap_or(DEFAULT_REASON)
            .to_string();

        let statement_indices = match kind {
            PlacementKind::Statement => Some(normalize_statement_indices(
                object.get("statementIndices"),
                phrases[phrase_index].statements.len(),
            )),
            PlacementKind::Phrase => None,
        };

        placements.push(ImagePlacement {
            image_index,
            kind,
            phrase_index,
            statement_indices,
            confidence,
            reason,
        });
    }

    placements
}

/// Stage B: at most one scene image per scene. Losers move to the lowest scene
/// without a scene image, or become an image on line 0 of their own scene when
/// every scene is taken.
pub fn resolve_phrase_conflicts(
    mut placements: Vec<ImagePlacement>,
    scene_count: usize,
) -> Vec<ImagePlacement> {
    let mut owners: HashMap<usize, usize> = HashMap::new();
    for (position, placement) in placements.iter().enumerate() {
        if placement.kind != PlacementKind::Phrase {
            continue;
        }
        match owners.get(&placement.phrase_index) {
            Some(&owner) if placements[owner].confidence >= placement.confidence => {}
            _ => {
                owners.insert(placement.phrase_index, position);
            }
        }
    }

    let mut free_scenes = (0..scene_count)
        .filter(|scene| !owners.contains_key(scene))
        .collect::<VecDeque<_>>();

    for (position, placement) in placements.iter_mut().enumerate() {
        if placement.kind != PlacementKind::Phrase
            || owners.get(&placement.phrase_index) == Some(&position)
        {
            continue;
        }

        match free_scenes.pop_front() {
            Some(scene) => {
                debug!(
                    "Image {} lost scene {}, moved to scene {}",
                    placement.image_index, placement.phrase_index, scene
                );
                placement.phrase_index = scene;
                placement.confidence *= SCENE_REASSIGN_PENALTY;
                placement.reason.push_str(" (moved to a free scene after a conflict)");
            }
            None => {
                debug!(
                    "Image {} lost scene {} with no free scene left, anchoring to line 0",
                    placement.image_index, placement.phrase_index
                );
                placement.kind = PlacementKind::Statement;
                placement.statement_indices = Some(vec![0]);
                placement.confidence *= SCENE_TO_LINE_PENALTY;
                placement.reason.push_str(" (anchored to the first line after a scene conflict)");
            }
        }
    }

    placements
}

/// Stage C: at most one image per line. Each line goes to its most confident
/// claimant; placements keep the lines they won and fall back to a scene image
/// when they won none.
pub fn resolve_statement_conflicts(mut placements: Vec<ImagePlacement>) -> Vec<ImagePlacement> {
    let mut owners: HashMap<(usize, usize), usize> = HashMap::new();
    for (position, placement) in placements.iter().enumerate() {
        for &line in placement.claimed_statements() {
            let key = (placement.phrase_index, line);
            match owners.get(&key) {
                Some(&owner) if placements[owner].confidence >= placement.confidence => {}
                _ => {
                    owners.insert(key, position);
                }
            }
        }
    }

    for (position, placement) in placements.iter_mut().enumerate() {
        if placement.kind != PlacementKind::Statement {
            continue;
        }
        let claimed = placement.statement_indices.take().unwrap_or_default();
        let won = claimed
            .iter()
            .copied()
            .filter(|&line| owners.get(&(placement.phrase_index, line)) == Some(&position))
            .collect::<Vec<_>>();

        if won.is_empty() {
            debug!(
                "Image {} lost every line in scene {}, using it as the scene image",
                placement.image_index, placement.phrase_index
            );
            placement.kind = PlacementKind::Phrase;
            placement.confidence *= LINE_TO_SCENE_PENALTY;
            placement.reason.push_str(" (used as scene image after losing its lines)");
        } else {
            if won.len() < claimed.len() {
                debug!(
                    "Image {} reduced from lines {:?} to {:?}",
                    placement.image_index, claimed, won
                );
            }
            placement.statement_indices = Some(won);
        }
    }

    placements
}

pub fn resolve_conflicts(placements: Vec<ImagePlacement>, scene_count: usize) -> Vec<ImagePlacement> {
    resolve_statement_conflicts(resolve_phrase_conflicts(placements, scene_count))
}

/// Runs all three passes. The result may cover fewer images than
/// `image_count`; filling the gaps is up to the caller.
pub fn resolve(candidates: &[Value], phrases: &[Phrase], image_count: usize) -> Vec<ImagePlacement> {
    let validated = validate_candidates(candidates, phrases, image_count);
    debug!(
        "Validated {} of {} candidates",
        validated.len(),
        candidates.len()
    );
    resolve_conflicts(validated, phrases.len())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::story::scenes::{build_phrases, SceneBlock};

    fn phrases(lines_per_scene: &[usize]) -> Vec<Phrase> {
        let blocks = lines_per_scene
            .iter()
            .enumerate()
            .map(|(scene, &lines)| SceneBlock {
                scene_number: scene + 1,
                content: (0..lines)
                    .map(|line| format!("line {}", line))
                    .collect::<Vec<_>>()
                    .join("\n"),
            })
            .collect::<Vec<_>>();
        build_phrases(&blocks)
    }

    fn close(actual: f64, expected: f64) -> bool {
        (actual - expected).abs() < 1e-9
    }

    fn by_image(placements: &[ImagePlacement], image: usize) -> &ImagePlacement {
        placements
            .iter()
            .find(|p| p.image_index == image)
            .expect("placement for image")
    }

    #[test]
    fn drops_invalid_and_duplicate_images() {
        let candidates = vec![
            json!("not an object"),
            json!({"imageIndex": -1}),
            json!({"imageIndex": 1.5}),
            json!({"imageIndex": "0"}),
            json!({"imageIndex": 3}),
            json!({"imageIndex": 1, "reason": "first"}),
            json!({"imageIndex": 1.0, "reason": "second"}),
            json!({}),
        ];
        let placements = validate_candidates(&candidates, &phrases(&[1]), 3);
        assert_eq!(placements.len(), 1);
        assert_eq!(placements[0].image_index, 1);
        assert_eq!(placements[0].reason, "first");
    }

    #[test]
    fn normalizes_fields_with_defaults_and_clamps() {
        let candidates = vec![
            json!({"imageIndex": 0, "phraseIndex": 9, "type": "STATEMENT", "confidence": 4.2, "reason": "  "}),
            json!({"imageIndex": 1, "phraseIndex": "2", "confidence": "high"}),
            json!({"imageIndex": 2, "phraseIndex": 1.7, "type": "statement",
                   "statementIndices": [7, -1, "x", 0, 2.9, 0]}),
            json!({"imageIndex": 3, "phraseIndex": -4, "type": "statement", "statementIndices": []}),
        ];
        let placements = validate_candidates(&candidates, &phrases(&[2, 3]), 4);

        let first = &placements[0];
        assert_eq!(first.kind, PlacementKind::Phrase);
        assert_eq!(first.phrase_index, 1);
        assert_eq!(first.confidence, 1.0);
        assert_eq!(first.reason, DEFAULT_REASON);
        assert!(first.statement_indices.is_none());

        assert_eq!(placements[1].phrase_index, 0);
        assert_eq!(placements[1].confidence, DEFAULT_CONFIDENCE);

        assert_eq!(placements[2].phrase_index, 1);
        assert_eq!(placements[2].statement_indices, Some(vec![0, 2]));

        assert_eq!(placements[3].phrase_index, 0);
        assert_eq!(placements[3].statement_indices, Some(vec![0]));
    }

    #[test]
    fn scene_conflict_moves_loser_to_free_scene() {
        let candidates = vec![
            json!({"imageIndex": 0, "type": "phrase", "phraseIndex": 0, "confidence": 0.9, "reason": "A"}),
            json!({"imageIndex": 1, "type": "phrase", "phraseIndex": 0, "confidence": 0.6, "reason": "B"}),
        ];
        let resolved = resolve(&candidates, &phrases(&[1, 1]), 2);

        let a = by_image(&resolved, 0);
        assert_eq!(a.phrase_index, 0);
        assert!(close(a.confidence, 0.9));

        let b = by_image(&resolved, 1);
        assert_eq!(b.kind, PlacementKind::Phrase);
        assert_eq!(b.phrase_index, 1);
        assert!(close(b.confidence, 0.54));
        assert!(b.reason.starts_with("B ("));
    }

    #[test]
    fn scene_ties_keep_the_first_candidate() {
        let candidates = vec![
            json!({"imageIndex": 1, "phraseIndex": 0, "confidence": 0.5}),
            json!({"imageIndex": 0, "phraseIndex": 0, "confidence": 0.5}),
        ];
        let resolved = resolve(&candidates, &phrases(&[1, 1]), 2);
        assert_eq!(by_image(&resolved, 1).phrase_index, 0);
        assert_eq!(by_image(&resolved, 0).phrase_index, 1);
    }

    #[test]
    fn scene_loser_without_free_scene_takes_first_line() {
        let candidates = vec![
            json!({"imageIndex": 0, "phraseIndex": 0, "confidence": 0.4}),
            json!({"imageIndex": 1, "phraseIndex": 0, "confidence": 0.8}),
        ];
        let resolved = resolve(&candidates, &phrases(&[2]), 2);

        let loser = by_image(&resolved, 0);
        assert_eq!(loser.kind, PlacementKind::Statement);
        assert_eq!(loser.phrase_index, 0);
        assert_eq!(loser.statement_indices, Some(vec![0]));
        assert!(close(loser.confidence, 0.28));
    }

    #[test]
    fn overlapping_lines_are_split_between_claimants() {
        let candidates = vec![
            json!({"imageIndex": 0, "type": "statement", "phraseIndex": 0,
                   "statementIndices": [0, 1], "confidence": 0.8}),
            json!({"imageIndex": 1, "type": "statement", "phraseIndex": 0,
                   "statementIndices": [1, 2], "confidence": 0.5}),
        ];
        let resolved = resolve(&candidates, &phrases(&[3]), 2);

        assert_eq!(by_image(&resolved, 0).statement_indices, Some(vec![0, 1]));
        let b = by_image(&resolved, 1);
        assert_eq!(b.kind, PlacementKind::Statement);
        assert_eq!(b.statement_indices, Some(vec![2]));
        assert!(close(b.confidence, 0.5));
    }

    #[test]
    fn losing_every_line_turns_into_scene_image() {
        let candidates = vec![
            json!({"imageIndex": 1, "type": "statement", "phraseIndex": 0,
                   "statementIndices": [1], "confidence": 0.3, "reason": "B"}),
            json!({"imageIndex": 0, "type": "statement", "phraseIndex": 0,
                   "statementIndices": [1], "confidence": 0.9}),
        ];
        let resolved = resolve(&candidates, &phrases(&[2]), 2);

        let b = by_image(&resolved, 1);
        assert_eq!(b.kind, PlacementKind::Phrase);
        assert_eq!(b.phrase_index, 0);
        assert!(b.statement_indices.is_none());
        assert!(close(b.confidence, 0.24));
        assert_eq!(by_image(&resolved, 0).statement_indices, Some(vec![1]));
    }

    #[test]
    fn penalties_compound_across_demotions() {
        // Image 1 loses the only scene, is anchored to line 0, then loses
        // that line to a stronger line claim.
        let candidates = vec![
            json!({"imageIndex": 0, "phraseIndex": 0, "confidence": 0.9}),
            json!({"imageIndex": 1, "phraseIndex": 0, "confidence": 0.5}),
            json!({"imageIndex": 2, "type": "statement", "phraseIndex": 0,
                   "statementIndices": [0], "confidence": 0.6}),
        ];
        let resolved = resolve(&candidates, &phrases(&[2]), 3);
        let demoted = by_image(&resolved, 1);
        assert_eq!(demoted.kind, PlacementKind::Phrase);
        assert!(close(demoted.confidence, 0.5 * 0.7 * 0.8));
    }

    #[test]
    fn conflict_resolution_is_idempotent() {
        let candidates = vec![
            json!({"imageIndex": 0, "phraseIndex": 0, "confidence": 0.9}),
            json!({"imageIndex": 1, "phraseIndex": 0, "confidence": 0.6}),
            json!({"imageIndex": 2, "phraseIndex": 1, "confidence": 0.7}),
            json!({"imageIndex": 3, "type": "statement", "phraseIndex": 2,
                   "statementIndices": [0, 1], "confidence": 0.8}),
            json!({"imageIndex": 4, "type": "statement", "phraseIndex": 2,
                   "statementIndices": [1, 2], "confidence": 0.4}),
        ];
        let scenes = phrases(&[1, 2, 3, 1]);
        let once = resolve(&candidates, &scenes, 5);
        let twice = resolve_conflicts(once.clone(), scenes.len());
        assert_eq!(once, twice);
    }

    #[test]
    fn resolved_sets_hold_the_invariants() {
        let candidates = (0..12)
            .map(|i| {
                json!({
                    "imageIndex": i % 9,
                    "type": if i % 3 == 0 { "statement" } else { "phrase" },
                    "phraseIndex": (i * 7) % 5,
                    "statementIndices": [i % 4, (i + 1) % 4],
                    "confidence": ((i * 37) % 100) as f64 / 100.0,
                })
            })
            .collect::<Vec<_>>();
        let scenes = phrases(&[2, 4, 1, 3, 2]);
        let resolved = resolve(&candidates, &scenes, 9);

        let mut images = HashSet::new();
        let mut lines = HashSet::new();
        for placement in &resolved {
            assert!(images.insert(placement.image_index));
            assert!(placement.phrase_index < scenes.len());
            assert!((0.0..=1.0).contains(&placement.confidence));
            match placement.kind {
                PlacementKind::Statement => {
                    let claimed = placement.statement_indices.as_ref().expect("lines");
                    assert!(!claimed.is_empty());
                    assert!(claimed.windows(2).all(|w| w[0] < w[1]));
                    for &line in claimed {
                        assert!(line < scenes[placement.phrase_index].statements.len());
                        assert!(lines.insert((placement.phrase_index, line)));
                    }
                }
                PlacementKind::Phrase => assert!(placement.statement_indices.is_none()),
            }
        }
    }

    #[test]
    fn line_loser_may_share_a_scene_with_its_scene_image() {
        // The passes run once each, so a Stage C demotion is not re-checked
        // against scene images.
        let candidates = vec![
            json!({"imageIndex": 0, "phraseIndex": 0, "confidence": 0.9}),
            json!({"imageIndex": 1, "type": "statement", "statementIndices": [0], "confidence": 0.3}),
            json!({"imageIndex": 2, "type": "statement", "statementIndices": [0], "confidence": 0.8}),
        ];
        let resolved = resolve(&candidates, &phrases(&[1]), 3);
        let scene_images = resolved
            .iter()
            .filter(|p| p.kind == PlacementKind::Phrase && p.phrase_index == 0)
            .count();
        assert_eq!(scene_images, 2);
    }

    #[test]
    fn no_scenes_yields_nothing() {
        let candidates = vec![json!({"imageIndex": 0})];
        assert!(resolve(&candidates, &[], 1).is_empty());
    }
}
