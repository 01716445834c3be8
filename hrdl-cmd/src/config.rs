use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// TOML configuration. Every field is optional; a field set here takes
/// precedence over its command-line flag.
///
/// ```toml
/// queue = 128
/// buffer = 67108864
/// instance = 255
/// keep = false
/// rate = 33554432
/// skip = 8
/// proxy = "tcp://debug:7000"
/// connections = 4
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub queue: Option<usize>,
    pub buffer: Option<usize>,
    pub instance: Option<i32>,
    pub keep: Option<bool>,
    pub rate: Option<u64>,
    pub skip: Option<usize>,
    pub proxy: Option<String>,
    pub connections: Option<usize>,
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let Some(path) = path else {
            return Ok(Config::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading configuration {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing configuration {}", path.display()))
    }
}
