use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub watch_dir: String,
    #[serde(default)]
    pub output_dir: String,
    #[serde(default)]
    pub archive_dir: String,
    #[serde(default)]
    pub error_dir: String,
    #[serde(default)]
    pub dict_dir: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_stability_pause")]
    pub stability_pause_secs: u64,
    #[serde(default = "default_stability_retries")]
    pub stability_retries: u32,
    #[serde(default = "default_merge_cooldown")]
    pub merge_cooldown_secs: u64,
    #[serde(default = "default_merge_poll")]
    pub merge_poll_secs: u64,
    #[serde(default)]
    pub oracle_api_key_path: String,
    #[serde(default = "default_oracle_model")]
    pub oracle_model: String,
}

fn default_poll_interval() -> u64 {
    10
}

fn default_stability_pause() -> u64 {
    1
}

fn default_stability_retries() -> u32 {
    3
}

fn default_merge_cooldown() -> u64 {
    15
}

fn default_merge_poll() -> u64 {
    5
}

fn default_oracle_model() -> String {
    "gpt-4o-mini".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            watch_dir: default_watch_dir().to_string_lossy().to_string(),
            output_dir: String::new(),
            archive_dir: String::new(),
            error_dir: String::new(),
            dict_dir: String::new(),
            poll_interval_secs: default_poll_interval(),
            stability_pause_secs: default_stability_pause(),
            stability_retries: default_stability_retries(),
            merge_cooldown_secs: default_merge_cooldown(),
            merge_poll_secs: default_merge_poll(),
            oracle_api_key_path: String::new(),
            oracle_model: default_oracle_model(),
        }
    }
}

impl Settings {
    pub fn watch_dir(&self) -> PathBuf {
        PathBuf::from(&self.watch_dir)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.derived(&self.output_dir, "output")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.derived(&self.archive_dir, "processed")
    }

    pub fn error_dir(&self) -> PathBuf {
        if self.error_dir.is_empty() {
            self.archive_dir().join("errors")
        } else {
            PathBuf::from(&self.error_dir)
        }
    }

    pub fn dict_dir(&self) -> PathBuf {
        self.derived(&self.dict_dir, "dictionaries")
    }

    fn derived(&self, configured: &str, fallback: &str) -> PathBuf {
        if configured.is_empty() {
            self.watch_dir().join(fallback)
        } else {
            PathBuf::from(configured)
        }
    }

    /// Oracle credential: environment variable first, then the configured
    /// key file. Absence disables the oracle rather than failing.
    pub fn oracle_api_key(&self) -> Option<String> {
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            let key = key.trim().to_string();
            if !key.is_empty() {
                return Some(key);
            }
        }
        if self.oracle_api_key_path.is_empty() {
            return None;
        }
        let key = std::fs::read_to_string(&self.oracle_api_key_path).ok()?;
        let key = key.trim().to_string();
        if key.is_empty() {
            None
        } else {
            Some(key)
        }
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.watch_dir(),
            self.output_dir(),
            self.archive_dir(),
            self.error_dir(),
            self.dict_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("ledgerwatch")
}

fn settings_path() -> PathBuf {
    config_dir().join("settings.json")
}

fn default_watch_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Documents")
        .join("帳簿アップロード")
}

pub fn load_settings() -> Settings {
    load_settings_from(&settings_path())
}

pub fn load_settings_from(path: &Path) -> Settings {
    if path.exists() {
        let content = std::fs::read_to_string(path).unwrap_or_default();
        serde_json::from_str(&content).unwrap_or_default()
    } else {
        Settings::default()
    }
}

pub fn save_settings(settings: &Settings) -> Result<()> {
    let dir = config_dir();
    std::fs::create_dir_all(&dir)?;
    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| LedgerError::Settings(e.to_string()))?;
    std::fs::write(settings_path(), format!("{json}\n"))?;
    Ok(())
}
