use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};

pub const DEFAULT_PORT: u16 = 8888;
pub const DEFAULT_FILTER_PATH: &str = "config/blocked.txt";
pub const DEFAULT_LOG_PATH: &str = "proxy.log";
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;

/// Proxy settings from the `key=value` config file.
///
/// Unknown keys are ignored and values that fail to parse fall back to their
/// defaults, so a stale config file degrades rather than refusing to start.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub filter_path: PathBuf,
    pub log_path: PathBuf,
    pub max_connections: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            filter_path: PathBuf::from(DEFAULT_FILTER_PATH),
            log_path: PathBuf::from(DEFAULT_LOG_PATH),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl Settings {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        Ok(Self::from_lines(contents.lines()))
    }

    fn from_lines<'a>(lines: impl Iterator<Item = &'a str>) -> Self {
        let mut settings = Self::default();
        for line in lines {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "PORT" => settings.port = parse_or(value, DEFAULT_PORT),
                "FILTER_PATH" => settings.filter_path = PathBuf::from(value),
                "LOG_PATH" => settings.log_path = PathBuf::from(value),
                "MAX_CONNECTIONS" => {
                    settings.max_connections = parse_or(value, DEFAULT_MAX_CONNECTIONS)
                }
                _ => {}
            }
        }
        settings
    }
}

fn parse_or<T: FromStr + Copy>(value: &str, default: T) -> T {
    value.parse().unwrap_or(default)
}
