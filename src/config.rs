use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub import: ImportConfig,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ImportConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: PathBuf,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_line_bytes: default_max_line_bytes(),
            uploads_dir: default_uploads_dir(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_batch_size() -> usize {
    2000
}
fn default_max_line_bytes() -> usize {
    1024 * 1024
}
fn default_uploads_dir() -> PathBuf {
    PathBuf::from("./data/uploads")
}
fn default_channel_capacity() -> usize {
    256
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExportConfig {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            output_dir: default_output_dir(),
        }
    }
}

fn default_page_size() -> usize {
    1000
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("./data/exports")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Configuration rooted in a single data directory. Used by tests and
    /// as a fallback when no config file exists.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            db: DbConfig {
                path: dir.join("bulk.sqlite"),
            },
            import: ImportConfig {
                uploads_dir: dir.join("uploads"),
                ..ImportConfig::default()
            },
            export: ExportConfig {
                output_dir: dir.join("exports"),
                ..ExportConfig::default()
            },
            server: ServerConfig::default(),
            log: LogConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.import.batch_size == 0 {
            anyhow::bail!("import.batch_size must be > 0");
        }
        if self.import.max_line_bytes == 0 {
            anyhow::bail!("import.max_line_bytes must be > 0");
        }
        if self.import.channel_capacity == 0 {
            anyhow::bail!("import.channel_capacity must be > 0");
        }
        if self.export.page_size == 0 {
            anyhow::bail!("export.page_size must be > 0");
        }
        match self.log.format.as_str() {
            "text" | "json" => {}
            other => anyhow::bail!("Unknown log format: '{}'. Must be text or json.", other),
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg: Config = toml::from_str("[db]\npath = \"/tmp/x.sqlite\"\n").unwrap();
        assert_eq!(cfg.import.batch_size, 2000);
        assert_eq!(cfg.import.max_line_bytes, 1024 * 1024);
        assert_eq!(cfg.export.page_size, 1000);
        assert_eq!(cfg.log.format, "text");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_batch_size_rejected() {
        let cfg: Config =
            toml::from_str("[db]\npath = \"x.sqlite\"\n[import]\nbatch_size = 0\n").unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn unknown_log_format_rejected() {
        let cfg: Config =
            toml::from_str("[db]\npath = \"x.sqlite\"\n[log]\nformat = \"xml\"\n").unwrap();
        assert!(cfg.validate().is_err());
    }
}
