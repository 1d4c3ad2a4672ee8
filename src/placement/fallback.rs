use std::collections::HashSet;

use tracing::debug;

use crate::placement::{ImagePlacement, PlacementKind};

/// Every fallback reason starts with this, so callers can tell them apart.
pub const FALLBACK_PREFIX: &str = "Fallback:";

const FALLBACK_ALL_CONFIDENCE: f64 = 0.3;
const FALLBACK_FILL_CONFIDENCE: f64 = 0.5;

/// Spreads `indices` over scenes. Scenes not used by `existing` are taken
/// first, lowest index first; once they run out images are spread
/// proportionally over all scenes.
pub fn distribute_fallback(
    indices: &[usize],
    total: usize,
    scene_count: usize,
    existing: &[ImagePlacement],
    confidence: f64,
    reason: &str,
) -> Vec<ImagePlacement> {
    if scene_count == 0 {
        return indices
            .iter()
            .map(|&image_index| ImagePlacement {
                image_index,
                kind: PlacementKind::Phrase,
                phrase_index: 0,
                statement_indices: None,
                confidence,
                reason: format!("{} no scene information", FALLBACK_PREFIX),
            })
            .collect();
    }

    let mut used = existing
        .iter()
        .map(|placement| placement.phrase_index)
        .collect::<HashSet<_>>();
    let total = total.max(1);

    indices
        .iter()
        .map(|&image_index| {
            let phrase_index = match (0..scene_count).find(|scene| !used.contains(scene)) {
                Some(scene) => {
                    used.insert(scene);
                    scene
                }
                None => (image_index * scene_count / total).min(scene_count - 1),
            };
            ImagePlacement {
                image_index,
                kind: PlacementKind::Phrase,
                phrase_index,
                statement_indices: None,
                confidence,
                reason: reason.to_string(),
            }
        })
        .collect()
}

pub fn fallback_all(image_count: usize, scene_count: usize) -> Vec<ImagePlacement> {
    let indices = (0..image_count).collect::<Vec<_>>();
    distribute_fallback(
        &indices,
        image_count,
        scene_count,
        &[],
        FALLBACK_ALL_CONFIDENCE,
        &format!("{} automatic distribution", FALLBACK_PREFIX),
    )
}

/// Adds placements for every image missing from `resolved`.
pub fn fill_missing(
    mut resolved: Vec<ImagePlacement>,
    image_count: usize,
    scene_count: usize,
) -> Vec<ImagePlacement> {
    let placed = resolved
        .iter()
        .map(|placement| placement.image_index)
        .collect::<HashSet<_>>();
    let missing = (0..image_count)
        .filter(|index| !placed.contains(index))
        .collect::<Vec<_>>();
    debug!("Filling {} missing images: {:?}", missing.len(), missing);

    let filled = distribute_fallback(
        &missing,
        image_count,
        scene_count,
        &resolved,
        FALLBACK_FILL_CONFIDENCE,
        &format!("{} filled in after partial AI placement", FALLBACK_PREFIX),
    );
    resolved.extend(filled);
    resolved
}
