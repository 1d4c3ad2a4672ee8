use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::CONFIG;
use crate::llm::media::ImageSource;
use crate::llm::CompletionGateway;
use crate::placement::{place_images, ImagePlacement, PlacementContext, PlacementSource};
use crate::state::{UsageLedger, UsageSummary};
use crate::story::scenes::{split_story, Phrase};
use crate::story::{generate_story, Keywords};
use crate::utils::timing::StageTimer;
use crate::vision::{analyze_images, ImageDescription, ItemLog};

/// Input of a full storyboard run. Either `story` or `keywords` must be set;
/// a supplied story skips generation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Job {
    pub keywords: Option<Keywords>,
    pub story: Option<String>,
    pub images: Vec<String>,
    pub context: Option<PlacementContext>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineReport {
    pub story: String,
    pub phrases: Vec<Phrase>,
    pub descriptions: Vec<ImageDescription>,
    pub image_logs: Vec<ItemLog>,
    pub placements: Vec<ImagePlacement>,
    pub placement_source: PlacementSource,
    pub usage: UsageSummary,
}

async fn resolve_story<G: CompletionGateway>(
    gateway: &G,
    job: &Job,
    ledger: &UsageLedger,
) -> Result<String> {
    if let Some(story) = job.story.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        info!("Using supplied story ({} chars)", story.chars().count());
        return Ok(story.to_string());
    }
    let keywords = job
        .keywords
        .as_ref()
        .ok_or_else(|| anyhow!("Job needs either `story` or `keywords`"))?;

    let mut timer = StageTimer::start("story");
    let generated = match generate_story(gateway, keywords).await {
        Ok(generated) => generated,
        Err(err) => {
            timer.mark_status("error", Some(err.to_string()));
            return Err(err);
        }
    };
    generated.record(ledger, "story");
    Ok(generated.output)
}

/// Story, then scene split and image analysis side by side, then placement.
pub async fn run_pipeline<G>(gateway: Arc<G>, job: Job) -> Result<PipelineReport>
where
    G: CompletionGateway + 'static,
{
    let ledger = UsageLedger::new();
    let _timer = StageTimer::start("pipeline");

    let story = resolve_story(gateway.as_ref(), &job, &ledger).await?;
    let sources = job
        .images
        .iter()
        .map(|image| ImageSource::parse(image))
        .collect::<Vec<_>>();
    info!("Running pipeline with {} images", sources.len());

    let (split, analysis) = tokio::join!(
        async {
            let _timer = StageTimer::start("split_scene");
            split_story(gateway.as_ref(), &story).await
        },
        analyze_images(Arc::clone(&gateway), sources)
    );
    let split = split.context("Scene split failed")?;
    let analysis = analysis?;

    split.record(&ledger, "split_scene");
    if analysis.usage.total > 0 {
        ledger.record(
            "vision",
            &analysis.model,
            analysis.usage,
            analysis.latency_ms,
        );
    }

    let phrases = split.output.phrases;
    let outcome = place_images(
        gateway.as_ref(),
        &phrases,
        &analysis.descriptions,
        job.context.as_ref(),
    )
    .await;
    if outcome.model.is_some() || outcome.usage.total > 0 {
        let model = outcome
            .model
            .clone()
            .unwrap_or_else(|| CONFIG.placement.model.clone());
        ledger.record("placement", &model, outcome.usage, outcome.latency_ms);
    }

    Ok(PipelineReport {
        story,
        phrases,
        descriptions: analysis.descriptions,
        image_logs: analysis.item_logs,
        placements: outcome.placements,
        placement_source: outcome.source,
        usage: ledger.summary(),
    })
}
