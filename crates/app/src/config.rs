use anyhow::{Context, Result};
use bargein_core::AecConfig;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Persisted settings of the `bargein` tool.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AppConfig {
    #[serde(default = "default_device")]
    pub input_device: String,
    #[serde(default = "default_device")]
    pub output_device: String,
    /// Where diagnostic WAV captures go. `None` = system temp dir.
    #[serde(default)]
    pub recording_dir: Option<PathBuf>,
    #[serde(default)]
    pub record_sessions: bool,
    #[serde(default)]
    pub aec: AecConfig,
}

fn default_device() -> String {
    "default".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            input_device: default_device(),
            output_device: default_device(),
            recording_dir: None,
            record_sessions: false,
            aec: AecConfig::default(),
        }
    }
}

impl AppConfig {
    /// Loads configuration from disk, or returns default if not found.
    pub fn load() -> Self {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    pub fn load_from(path: &Path) -> Self {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(_) => return Self::default(),
        };
        match serde_json::from_str(&content) {
            Ok(cfg) => cfg,
            Err(e) => {
                log::warn!("Ignoring unreadable config {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Saves configuration to disk in JSON format.
    pub fn save(&self) -> Result<PathBuf> {
        let path = config_path().context("No config directory available")?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
    }
}

pub fn config_path() -> Option<PathBuf> {
    ProjectDirs::from("com", "bargein", "bargein").map(|dirs| dirs.config_dir().join("config.json"))
}
