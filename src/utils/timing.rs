use std::fmt::Display;
use std::future::Future;
use std::time::Instant;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use tracing::info;

pub const TIMING_TARGET: &str = "storyboard.timing";

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Times one pipeline stage. Completion is logged on `complete` or on drop,
/// whichever comes first.
#[derive(Debug)]
pub struct StageTimer {
    stage: String,
    started_at: DateTime<Utc>,
    started: Instant,
    status: &'static str,
    detail: Option<String>,
    done: bool,
}

impl StageTimer {
    pub fn start(stage: &str) -> Self {
        let started_at = Utc::now();
        info!(
            target: TIMING_TARGET,
            "event=stage_started stage={} started_at={}",
            stage,
            timestamp(started_at)
        );
        StageTimer {
            stage: stage.to_string(),
            started_at,
            started: Instant::now(),
            status: "success",
            detail: None,
            done: false,
        }
    }

    /// Overrides the default `success` status, e.g. `fallback` or `error`.
    pub fn mark_status(&mut self, status: &'static str, detail: Option<String>) {
        self.status = status;
        self.detail = detail;
    }

    pub fn complete(&mut self) {
        if std::mem::replace(&mut self.done, true) {
            return;
        }
        info!(
            target: TIMING_TARGET,
            "event=stage_completed stage={} started_at={} duration_ms={} status={} detail={}",
            self.stage,
            timestamp(self.started_at),
            self.started.elapsed().as_millis(),
            self.status,
            self.detail.as_deref().unwrap_or("-")
        );
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        self.complete();
    }
}

/// Identifies one gateway call in the timing log.
#[derive(Debug, Clone, Copy)]
pub struct LlmCall<'a> {
    pub provider: &'a str,
    pub model: &'a str,
    pub operation: &'a str,
}

/// Wraps a gateway call with `llm_request` / `llm_response` timing events.
/// Failures are logged with their message and passed through unchanged.
pub async fn log_llm_timing<T, E, Fut>(call: LlmCall<'_>, metadata: Value, future: Fut) -> Result<T, E>
where
    E: Display,
    Fut: Future<Output = Result<T, E>>,
{
    info!(
        target: TIMING_TARGET,
        "event=llm_request provider={} model={} operation={} started_at={} metadata={}",
        call.provider,
        call.model,
        call.operation,
        timestamp(Utc::now()),
        metadata
    );

    let started = Instant::now();
    let result = future.await;
    let (status, error) = match &result {
        Ok(_) => ("success", String::new()),
        Err(err) => ("error", err.to_string()),
    };
    info!(
        target: TIMING_TARGET,
        "event=llm_response provider={} model={} operation={} duration_ms={} status={} error={:?}",
        call.provider,
        call.model,
        call.operation,
        started.elapsed().as_millis(),
        status,
        error
    );

    result
}
