use std::path::Path;

use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

fn is_yaml_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
        .unwrap_or(false)
}

pub fn parse_document<T: DeserializeOwned>(raw: &str, yaml: bool) -> Result<T> {
    if yaml {
        serde_yaml::from_str(raw).map_err(|err| anyhow!("Invalid YAML document: {}", err))
    } else {
        serde_json::from_str(raw).map_err(|err| anyhow!("Invalid JSON document: {}", err))
    }
}

/// Reads a YAML (`.yaml`/`.yml`) or JSON file into `T`.
pub async fn load_document<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|err| anyhow!("Failed to read '{}': {}", path.display(), err))?;
    parse_document(&raw, is_yaml_path(path))
        .map_err(|err| anyhow!("{} ({})", err, path.display()))
}

pub fn to_pretty_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(|err| anyhow!("Failed to serialize output: {}", err))
}
