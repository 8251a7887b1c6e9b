// Configuration management for the gattlink CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/gattlink/config.json
// - Linux: ~/.config/gattlink/config.json
// - Windows: %APPDATA%\gattlink\config.json

use anyhow::{Context, Result};
use gattlink_core::{LinkConfig, ScanFilter};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Which Bluetooth adapter to use (index into the OS adapter list)
    #[serde(default)]
    pub adapter_index: usize,

    /// Target peripheral, required service/characteristic and timeouts
    #[serde(default)]
    pub link: LinkConfig,
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("gattlink");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            config
                .link
                .validate()
                .context("Config file holds an invalid link configuration")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value. The change is validated but not saved.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut link = self.link.clone();
        match key {
            "adapter_index" => {
                self.adapter_index = value.parse().context("Invalid adapter index")?;
            }
            "target_name" => {
                link.target = ScanFilter::Name(value.to_string());
            }
            "target_service" => {
                link.target = ScanFilter::Service(parse_uuid(value)?);
            }
            "service_uuid" => {
                link.service_uuid = parse_uuid(value)?;
            }
            "characteristic_uuid" => {
                link.characteristic_uuid = parse_uuid(value)?;
            }
            "scan_timeout_ms" => {
                link.scan_timeout_ms = value.parse().context("Invalid number")?;
            }
            "operation_timeout_ms" => {
                link.operation_timeout_ms = value.parse().context("Invalid number")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        link.validate()?;
        self.link = link;
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "adapter_index" => Some(self.adapter_index.to_string()),
            "target_name" => match &self.link.target {
                ScanFilter::Name(name) => Some(name.clone()),
                ScanFilter::Service(_) => None,
            },
            "target_service" => match &self.link.target {
                ScanFilter::Service(uuid) => Some(uuid.to_string()),
                ScanFilter::Name(_) => None,
            },
            "service_uuid" => Some(self.link.service_uuid.to_string()),
            "characteristic_uuid" => Some(self.link.characteristic_uuid.to_string()),
            "scan_timeout_ms" => Some(self.link.scan_timeout_ms.to_string()),
            "operation_timeout_ms" => Some(self.link.operation_timeout_ms.to_string()),
            _ => None,
        }
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("adapter_index".to_string(), self.adapter_index.to_string()),
            ("target".to_string(), self.link.target.to_string()),
            ("service_uuid".to_string(), self.link.service_uuid.to_string()),
            ("characteristic_uuid".to_string(), self.link.characteristic_uuid.to_string()),
            ("scan_timeout_ms".to_string(), format!("{}ms", self.link.scan_timeout_ms)),
            ("operation_timeout_ms".to_string(), format!("{}ms", self.link.operation_timeout_ms)),
        ]
    }
}

/// Accepts full UUIDs and 16-bit SIG short forms ("180f", "0x2A19")
pub fn parse_uuid(value: &str) -> Result<Uuid> {
    let trimmed = value.trim_start_matches("0x").trim_start_matches("0X");
    if trimmed.len() <= 4 {
        let short = u16::from_str_radix(trimmed, 16).context("Invalid 16-bit UUID")?;
        return Ok(gattlink_core::profile::uuid_from_short(short));
    }
    Uuid::parse_str(value).context("Invalid UUID")
}
