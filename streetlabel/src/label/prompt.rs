use anyhow::{Context, Result};
use std::path::Path;

/// Read the labeling prompt verbatim
pub fn load_prompt(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read prompt file: {:?}", path))
}

/// Read one API key per line. Keys are trimmed and blank lines dropped;
/// the key format itself is not checked.
pub fn load_api_keys(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read API keys file: {:?}", path))?;
    Ok(parse_api_keys(&content))
}

pub fn parse_api_keys(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
