use std::fs;
use std::path::Path;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, Registry};

use crate::config::CONFIG;
use crate::utils::timing::TIMING_TARGET;

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Keeps the background log writers alive; drop it only at exit.
pub struct LoggingGuards {
    _guards: Vec<WorkerGuard>,
}

fn parse_log_level(value: &str) -> LevelFilter {
    value
        .trim()
        .to_lowercase()
        .replace("warning", "warn")
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO)
}

/// Everything except pipeline timing, with chatty HTTP internals clamped.
fn run_filter(level: LevelFilter) -> Targets {
    Targets::new()
        .with_default(level)
        .with_target(TIMING_TARGET, LevelFilter::OFF)
        .with_target("hyper", LevelFilter::WARN)
        .with_target("hyper_util", LevelFilter::WARN)
        .with_target("reqwest", LevelFilter::WARN)
}

fn timing_filter() -> Targets {
    Targets::new()
        .with_default(LevelFilter::OFF)
        .with_target(TIMING_TARGET, LevelFilter::INFO)
}

fn daily_writer(dir: &Path, file_name: &str, guards: &mut Vec<WorkerGuard>) -> NonBlocking {
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, file_name));
    guards.push(guard);
    writer
}

/// A text and a JSONL file for one stream of events.
fn file_layers(dir: &Path, stem: &str, filter: Targets, guards: &mut Vec<WorkerGuard>) -> Vec<BoxedLayer> {
    let text = daily_writer(dir, &format!("{stem}.log"), guards);
    let json = daily_writer(dir, &format!("{stem}.jsonl"), guards);
    vec![
        tracing_subscriber::fmt::layer()
            .with_writer(text)
            .with_ansi(false)
            .with_filter(filter.clone())
            .boxed(),
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(json)
            .with_filter(filter)
            .boxed(),
    ]
}

pub fn init_logging() -> LoggingGuards {
    let logs_dir = Path::new(&CONFIG.log_dir);
    if let Err(err) = fs::create_dir_all(logs_dir) {
        eprintln!("Failed to create log directory {}: {err}", logs_dir.display());
    }

    let level = parse_log_level(&CONFIG.log_level);
    let mut guards = Vec::with_capacity(4);
    let mut layers = file_layers(logs_dir, "storyboard", run_filter(level), &mut guards);
    layers.extend(file_layers(logs_dir, "timing", timing_filter(), &mut guards));
    // stdout carries command output
    layers.push(
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(run_filter(level))
            .boxed(),
    );

    tracing_subscriber::registry().with(layers).init();

    LoggingGuards { _guards: guards }
}
