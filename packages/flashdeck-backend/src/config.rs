/// Configuration for the Flashdeck backend.
/// Reads config.json from ~/.config/flashdeck/config.json (or platform equivalent).
/// `FLASHDECK_CONFIG` overrides the path.

use flashdeck_core::config::{SheetCatalog, SwitchPolicy, SyncSettings};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Sheet service URL; fetch is `GET <endpoint>?id=<sheet>`, save is a JSON POST.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub sheets: SheetCatalog,
    #[serde(default)]
    pub switch_policy: SwitchPolicy,
    #[serde(default = "default_success_statuses")]
    pub success_statuses: Vec<String>,
    /// Pause after turning a card back to its front before showing the next one.
    #[serde(default = "default_flip_delay_ms")]
    pub flip_delay_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Sheet opened at startup; first catalog entry if unset.
    #[serde(default)]
    pub start_sheet: Option<String>,
}

fn default_success_statuses() -> Vec<String> {
    SyncSettings::default().success_statuses
}

fn default_flip_delay_ms() -> u64 {
    200
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            sheets: SheetCatalog::default(),
            switch_policy: SwitchPolicy::default(),
            success_statuses: default_success_statuses(),
            flip_delay_ms: default_flip_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            start_sheet: None,
        }
    }
}

impl AppConfig {
    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            switch_policy: self.switch_policy,
            success_statuses: self.success_statuses.clone(),
        }
    }
}

/// Default config path: ~/.config/flashdeck/config.json
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("FLASHDECK_CONFIG") {
        return PathBuf::from(path);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("flashdeck")
        .join("config.json")
}

/// Load config from path. Returns default if the file doesn't exist or can't be parsed.
pub fn load_config(path: &Path) -> AppConfig {
    match fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
            log::warn!("Failed to parse config {}: {}", path.display(), e);
            AppConfig::default()
        }),
        Err(_) => {
            log::info!("No config at {}, using defaults", path.display());
            AppConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flashdeck_core::types::SheetKey;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = load_config(Path::new("/nonexistent/flashdeck/config.json"));
        assert_eq!(config.flip_delay_ms, 200);
        assert_eq!(config.sheets.entries().len(), 5);
        assert_eq!(config.switch_policy, SwitchPolicy::Autosave);
    }

    #[test]
    fn test_partial_config() {
        let mut tmp = NamedTempFile::new().unwrap();
        write!(
            tmp,
            r#"{{
                "endpoint": "https://example.com/exec",
                "switch_policy": "discard",
                "sheets": [
                    {{ "key": "a", "sheet": "verbs", "name": "Verbs" }},
                    {{ "key": "b", "sheet": "nouns" }}
                ]
            }}"#
        )
        .unwrap();

        let config = load_config(tmp.path());
        assert_eq!(config.endpoint, "https://example.com/exec");
        assert_eq!(config.switch_policy, SwitchPolicy::Discard);
        assert_eq!(config.sheets.entries().len(), 2);
        assert_eq!(config.sheets.get(&SheetKey::from("a")).unwrap().label(), "Verbs");
        assert_eq!(config.sheets.get(&SheetKey::from("b")).unwrap().label(), "nouns");
        assert_eq!(config.success_statuses, vec!["success", "ok", "done"]);
        assert_eq!(config.request_timeout_secs, 30);
    }

    #[test]
    fn test_invalid_json_falls_back() {
        let mut tmp = NamedTempFile::new().unwrap();
        write!(tmp, "{{ not json").unwrap();
        let config = load_config(tmp.path());
        assert!(config.endpoint.is_empty());
    }
}
