use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

mod config;
mod llm;
mod pipeline;
mod placement;
mod state;
mod story;
mod utils;
mod vision;

use llm::media::ImageSource;
use llm::OpenRouterGateway;
use placement::{place_images, PlacementContext, PlacementOutcome};
use pipeline::{run_pipeline, Job};
use state::UsageLedger;
use story::refine::RefineSession;
use story::scenes::{normalize_phrases, split_story, Phrase};
use story::sections::{generate_cta, generate_hook, CtaType, HookType};
use story::viral::generate_viral;
use story::{generate_story, Keywords};
use utils::document::{load_document, to_pretty_json};
use utils::logging::init_logging;
use vision::{analyze_images, ImageDescription};

const COMMANDS: [&str; 9] = [
    "story", "split", "analyze", "place", "hook", "cta", "viral", "refine", "run",
];

fn usage() -> &'static str {
    "Usage: shortform_storyboard <command> [options] [--out <path>]\n\n\
     Commands:\n\
     \x20 story   --keywords <file.yaml|json>        Generate a story from keywords\n\
     \x20 split   --story <file.txt>                 Split a story into scenes\n\
     \x20 analyze <image>...                         Describe images (paths or URLs)\n\
     \x20 place   --input <file.yaml|json>           Place described images into scenes\n\
     \x20 hook    --body <file.txt> [--type <kind>]  Generate HOOK variants\n\
     \x20 cta     --body <file.txt> [--type <kind>]  Generate CTA variants\n\
     \x20 viral   --story <file.txt>                 Generate an SNS caption and hashtags\n\
     \x20 refine  [--session <file.json>]            Refine HOOK/BODY/CTA interactively\n\
     \x20 run     --job <file.yaml|json>             Run the full storyboard pipeline"
}

#[derive(Debug, Default, PartialEq)]
struct CliArgs {
    command: String,
    options: HashMap<String, String>,
    positional: Vec<String>,
}

impl CliArgs {
    fn option(&self, name: &str) -> Option<&str> {
        self.options.get(name).map(String::as_str)
    }

    fn required_path(&self, name: &str) -> Result<PathBuf> {
        self.option(name)
            .map(PathBuf::from)
            .ok_or_else(|| anyhow!("--{} is required for `{}`\n{}", name, self.command, usage()))
    }
}

fn parse_args(args: &[String]) -> Result<CliArgs> {
    let command = args
        .get(1)
        .map(|value| value.as_str())
        .ok_or_else(|| anyhow!(usage()))?;
    if matches!(command, "--help" | "-h" | "help") {
        return Err(anyhow!(usage()));
    }
    if !COMMANDS.contains(&command) {
        return Err(anyhow!("Unknown command: {command}\n{}", usage()));
    }

    let mut parsed = CliArgs {
        command: command.to_string(),
        ..CliArgs::default()
    };
    let mut index = 2;
    while index < args.len() {
        let arg = &args[index];
        match arg.strip_prefix("--") {
            Some("help") => return Err(anyhow!(usage())),
            Some(name) => {
                index += 1;
                let value = args
                    .get(index)
                    .ok_or_else(|| anyhow!("Missing value for --{name}"))?;
                parsed.options.insert(name.to_string(), value.clone());
            }
            None => parsed.positional.push(arg.clone()),
        }
        index += 1;
    }
    Ok(parsed)
}

async fn read_text(path: &Path) -> Result<String> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read '{}'", path.display()))?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("'{}' is empty", path.display()));
    }
    Ok(trimmed.to_string())
}

async fn emit(args: &CliArgs, output: &str) -> Result<()> {
    match args.option("out") {
        Some(path) => {
            tokio::fs::write(path, output)
                .await
                .with_context(|| format!("Failed to write '{}'", path))?;
            info!("Wrote output to {}", path);
        }
        None => println!("{}", output),
    }
    Ok(())
}

async fn emit_json<T: Serialize>(args: &CliArgs, value: &T) -> Result<()> {
    emit(args, &to_pretty_json(value)?).await
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaceInput {
    phrases: Vec<Phrase>,
    descriptions: Vec<ImageDescription>,
    #[serde(default)]
    context: Option<PlacementContext>,
}

impl PlaceInput {
    /// Scenes from a file carry no guarantees; placement indexes them by
    /// position, so they are renumbered before use.
    fn normalized(mut self) -> Self {
        let before = self.phrases.len();
        self.phrases = normalize_phrases(self.phrases);
        if self.phrases.len() != before {
            warn!(
                "Kept {} of {} input scenes after dropping empty ones",
                self.phrases.len(),
                before
            );
        }
        self
    }
}

#[derive(Debug, Serialize)]
struct PlaceReport {
    phrases: Vec<Phrase>,
    #[serde(flatten)]
    outcome: PlacementOutcome,
}

#[derive(Debug, Serialize)]
struct Variant {
    name: String,
    text: String,
}

fn variants(pairs: Vec<(String, String)>) -> Vec<Variant> {
    pairs
        .into_iter()
        .map(|(name, text)| Variant { name, text })
        .collect()
}

async fn run_refine(gateway: &OpenRouterGateway, args: &CliArgs) -> Result<()> {
    let mut session = match args.option("session") {
        Some(path) => load_document::<RefineSession>(Path::new(path)).await?,
        None => RefineSession::default(),
    };
    let ledger = UsageLedger::new();

    eprintln!("Refining HOOK/BODY/CTA. Type a request, or /done to finish.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let message = line.trim();
        if message.is_empty() {
            continue;
        }
        if message == "/done" || message == "/quit" {
            break;
        }
        match session.send(gateway, message).await {
            Ok(generated) => {
                generated.record(&ledger, "refine");
                let refinement = &generated.output;
                for (name, section) in [
                    ("HOOK", &refinement.hook),
                    ("BODY", &refinement.body),
                    ("CTA", &refinement.cta),
                ] {
                    if let Some(text) = section {
                        eprintln!("== {} ==\n{}\n", name, text);
                    }
                }
                if !refinement.response.is_empty() {
                    eprintln!("{}", refinement.response);
                }
            }
            Err(err) => {
                error!("Refinement failed: {}", err);
                eprintln!("Refinement failed: {}", err);
            }
        }
    }

    info!("Refine session used {} tokens", ledger.total().total);
    emit_json(args, &session).await
}

async fn run_command(args: CliArgs) -> Result<()> {
    let gateway = Arc::new(OpenRouterGateway::from_env()?);

    match args.command.as_str() {
        "story" => {
            let keywords: Keywords = load_document(&args.required_path("keywords")?).await?;
            let story = generate_story(gateway.as_ref(), &keywords).await?;
            emit(&args, &story.output).await
        }
        "split" => {
            let story = read_text(&args.required_path("story")?).await?;
            let split = split_story(gateway.as_ref(), &story).await?;
            emit_json(&args, &split.output).await
        }
        "analyze" => {
            if args.positional.is_empty() {
                return Err(anyhow!("`analyze` needs at least one image\n{}", usage()));
            }
            let sources = args
                .positional
                .iter()
                .map(|value| ImageSource::parse(value))
                .collect();
            let analysis = analyze_images(Arc::clone(&gateway), sources).await?;
            emit_json(&args, &analysis).await
        }
        "place" => {
            let input = load_document::<PlaceInput>(&args.required_path("input")?)
                .await?
                .normalized();
            let outcome = place_images(
                gateway.as_ref(),
                &input.phrases,
                &input.descriptions,
                input.context.as_ref(),
            )
            .await;
            emit_json(
                &args,
                &PlaceReport {
                    phrases: input.phrases,
                    outcome,
                },
            )
            .await
        }
        "hook" => {
            let body = read_text(&args.required_path("body")?).await?;
            let kind = args
                .option("type")
                .map(str::parse::<HookType>)
                .transpose()?
                .unwrap_or_default();
            let hooks = generate_hook(gateway.as_ref(), &body, kind).await?;
            emit_json(&args, &variants(hooks.output)).await
        }
        "cta" => {
            let body = read_text(&args.required_path("body")?).await?;
            let kind = args
                .option("type")
                .map(str::parse::<CtaType>)
                .transpose()?
                .unwrap_or_default();
            let ctas = generate_cta(gateway.as_ref(), &body, kind).await?;
            emit_json(&args, &variants(ctas.output)).await
        }
        "viral" => {
            let story = read_text(&args.required_path("story")?).await?;
            let copy = generate_viral(gateway.as_ref(), &story).await?;
            emit_json(&args, &copy.output).await
        }
        "refine" => run_refine(gateway.as_ref(), &args).await,
        "run" => {
            let job: Job = load_document(&args.required_path("job")?).await?;
            let report = run_pipeline(Arc::clone(&gateway), job).await?;
            info!(
                "Pipeline finished: scenes={} images={} tokens={}",
                report.phrases.len(),
                report.placements.len(),
                report.usage.total.total
            );
            emit_json(&args, &report).await
        }
        other => Err(anyhow!("Unknown command: {other}\n{}", usage())),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let _guards = init_logging();

    let args: Vec<String> = std::env::args().collect();
    let parsed = parse_args(&args)?;
    info!("Running command `{}`", parsed.command);

    if let Err(err) = run_command(parsed).await {
        error!("Command failed: {:#}", err);
        return Err(err);
    }
    Ok(())
}
