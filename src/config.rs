use std::env;

use once_cell::sync::Lazy;
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub struct TaskParams {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub log_dir: String,
    pub openrouter_api_key: String,
    pub openrouter_base_url: String,
    pub openrouter_timeout_seconds: u64,
    pub app_referer: String,
    pub app_title: String,
    pub story_language: String,
    pub vision_concurrency: usize,
    pub max_images: usize,
    pub max_image_bytes: usize,
    pub placement_json_mode: bool,
    pub story: TaskParams,
    pub split_scene: TaskParams,
    pub hook: TaskParams,
    pub cta: TaskParams,
    pub refine: TaskParams,
    pub viral: TaskParams,
    pub vision: TaskParams,
    pub placement: TaskParams,
}

pub static CONFIG: Lazy<Config> = Lazy::new(Config::load);

const CLAUDE_SONNET: &str = "anthropic/claude-sonnet-4.5";
const GPT_4O: &str = "openai/gpt-4o";
const GROK_FAST: &str = "x-ai/grok-4-fast";
const GEMINI_FLASH: &str = "google/gemini-2.5-flash";

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .map(|value| value.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn env_string(name: &str, default: &str) -> String {
    env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_f32(name: &str, default: f32) -> f32 {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<f32>().ok())
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn task_params(prefix: &str, model: &str, max_tokens: u32, temperature: f32) -> TaskParams {
    let temperature = env_f32(&format!("{prefix}_TEMPERATURE"), temperature);
    let temperature = if (0.0..=2.0).contains(&temperature) {
        temperature
    } else {
        warn!(
            "{}_TEMPERATURE={} is outside [0, 2]; clamping.",
            prefix, temperature
        );
        temperature.clamp(0.0, 2.0)
    };

    TaskParams {
        model: env_string(&format!("{prefix}_MODEL"), model),
        max_tokens: env_u32(&format!("{prefix}_MAX_TOKENS"), max_tokens).max(1),
        temperature,
    }
}

impl Config {
    pub fn load() -> Self {
        Config {
            log_level: env_string("LOG_LEVEL", "info").to_lowercase(),
            log_dir: env_string("LOG_DIR", "logs"),
            openrouter_api_key: env_string("OPENROUTER_API_KEY", ""),
            openrouter_base_url: env_string("OPENROUTER_BASE_URL", "https://openrouter.ai/api/v1"),
            openrouter_timeout_seconds: env_u64("OPENROUTER_TIMEOUT_SECONDS", 120),
            app_referer: env_string(
                "APP_REFERER",
                "https://github.com/shortform-storyboard/shortform_storyboard",
            ),
            app_title: env_string("APP_TITLE", "shortform_storyboard"),
            story_language: env_string("STORY_LANGUAGE", "Korean"),
            vision_concurrency: env_usize("VISION_CONCURRENCY", 8).max(1),
            max_images: env_usize("MAX_IMAGES", 50).max(1),
            max_image_bytes: env_usize("MAX_IMAGE_BYTES", 100 * 1024 * 1024),
            placement_json_mode: env_bool("PLACEMENT_JSON_MODE", true),
            story: task_params("STORY", CLAUDE_SONNET, 8192, 1.0),
            split_scene: task_params("SPLIT_SCENE", GROK_FAST, 8192, 0.3),
            hook: task_params("HOOK", CLAUDE_SONNET, 2048, 0.8),
            cta: task_params("CTA", CLAUDE_SONNET, 2048, 0.8),
            refine: task_params("REFINE", GPT_4O, 4096, 0.7),
            viral: task_params("VIRAL", GPT_4O, 1024, 0.7),
            vision: task_params("VISION", GEMINI_FLASH, 1024, 0.3),
            placement: task_params("PLACEMENT", GEMINI_FLASH, 16384, 0.3),
        }
    }
}
