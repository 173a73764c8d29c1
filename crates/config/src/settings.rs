// Session settings
// Loaded from ~/.config/tidygrid/settings.json

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // Validation
    #[serde(rename = "validation.chunkSize")]
    pub validation_chunk_size: usize,

    // Find & replace
    #[serde(rename = "findReplace.chunkSize")]
    pub find_replace_chunk_size: usize,

    /// Revalidate every column after a replace that changed cells
    #[serde(rename = "findReplace.revalidate")]
    pub find_replace_revalidate: bool,

    // Engine
    #[serde(rename = "engine.callTimeoutMs")]
    pub call_timeout_ms: u64,

    #[serde(rename = "engine.readyTimeoutMs")]
    pub ready_timeout_ms: u64,

    // Grid
    #[serde(rename = "grid.fetchWindow")]
    pub fetch_window: usize,

    // Events
    #[serde(rename = "events.queueDepth")]
    pub event_queue_depth: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            validation_chunk_size: 50_000,
            find_replace_chunk_size: 50_000,
            find_replace_revalidate: true,
            call_timeout_ms: 120_000,
            ready_timeout_ms: 10_000,
            fetch_window: 200,
            event_queue_depth: 256,
        }
    }
}

const DEFAULT_FILE: &str = r#"{
    // Rows per engine call during the full validation pass
    "validation.chunkSize": 50000,

    // Rows per engine call during find & replace
    "findReplace.chunkSize": 50000,
    // Revalidate all columns after a replace that changed cells
    "findReplace.revalidate": true,

    // Engine call timeouts (milliseconds)
    "engine.callTimeoutMs": 120000,
    "engine.readyTimeoutMs": 10000,

    // Rows paged in per viewport request
    "grid.fetchWindow": 200,

    // Per-subscriber event queue depth
    "events.queueDepth": 256
}
"#;

impl Settings {
    /// Get the settings file path
    pub fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tidygrid");
        config_dir.join("settings.json")
    }

    /// Load settings from the default location, writing a commented
    /// default file on first run
    pub fn load() -> Self {
        let path = Self::config_path();

        if !path.exists() {
            create_default_file(&path);
            return Self::default();
        }

        Self::load_from(&path)
    }

    /// Load settings from `path`, falling back to defaults
    pub fn load_from(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents).unwrap_or_else(|e| {
                log::warn!("error parsing {}: {}; using default settings", path.display(), e);
                Self::default()
            }),
            Err(e) => {
                log::warn!("error reading {}: {}; using default settings", path.display(), e);
                Self::default()
            }
        }
    }

    /// Parse settings text. Lines starting with `//` are comments.
    pub fn parse(contents: &str) -> Result<Self, String> {
        let cleaned: String = contents
            .lines()
            .filter(|line| !line.trim().starts_with("//"))
            .collect::<Vec<_>>()
            .join("\n");

        serde_json::from_str(&cleaned).map_err(|e| e.to_string())
    }

    /// Save current settings to the default location
    pub fn save(&self) -> Result<(), String> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), String> {
        // Ensure directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }

        let json = serde_json::to_string_pretty(self).map_err(|e| e.to_string())?;

        fs::write(path, json).map_err(|e| e.to_string())
    }

    /// Get the config file path for display
    pub fn config_path_display() -> String {
        Self::config_path().to_string_lossy().to_string()
    }
}

fn create_default_file(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            log::warn!("error creating config directory: {}", e);
            return;
        }
    }

    if let Err(e) = fs::write(path, DEFAULT_FILE) {
        log::warn!("error writing default settings.json: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_file_matches_defaults() {
        assert_eq!(Settings::parse(DEFAULT_FILE).unwrap(), Settings::default());
    }

    #[test]
    fn test_missing_keys_fall_back() {
        let settings = Settings::parse(r#"{ "validation.chunkSize": 10 }"#).unwrap();
        assert_eq!(settings.validation_chunk_size, 10);
        assert_eq!(settings.fetch_window, 200);
        assert!(settings.find_replace_revalidate);
    }

    #[test]
    fn test_comments_are_stripped() {
        let text = "{\n  // tuned for tests\n  \"grid.fetchWindow\": 50\n}";
        assert_eq!(Settings::parse(text).unwrap().fetch_window, 50);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let settings = Settings {
            call_timeout_ms: 500,
            find_replace_revalidate: false,
            ..Settings::default()
        };
        settings.save_to(&path).unwrap();
        assert_eq!(Settings::load_from(&path), settings);
    }

    #[test]
    fn test_malformed_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(Settings::load_from(&path), Settings::default());
    }

    #[test]
    fn test_unreadable_path_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(Settings::load_from(&dir.path().join("absent.json")), Settings::default());
    }
}
