//! Configuration for the deskcast harness.

use std::path::Path;

use serde::{Deserialize, Serialize};

use deskcast_core::discovery::DiscoveryConfig;
use deskcast_core::processors::ScalerConfig;
use deskcast_core::CaptureConfig;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Screen capture settings.
    pub capture: CaptureConfig,
    /// Scaler settings (used when a target resolution is requested).
    pub scaler: ScalerConfig,
    /// Peer discovery settings.
    pub discovery: DiscoveryConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let text = toml::to_string_pretty(&AppConfig::default()).unwrap();
        assert!(text.contains("frame_rate"));
        assert!(text.contains("target_width"));
        assert!(text.contains("advertised_port"));
    }

    #[test]
    fn roundtrip_config() {
        let config = AppConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.capture.frame_rate, 30);
        assert_eq!(parsed.logging.level, "info");
        assert_eq!(parsed.discovery.kind, "remote-desk");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = AppConfig::load(Path::new("/nonexistent/deskcast.toml"));
        assert_eq!(config.capture.frame_rate, 30);
    }
}
