/// Configuration types shared by the core and the backend.
use serde::{Deserialize, Serialize};

use crate::types::SheetKey;

/// One sheet in the catalog: local key, remote sheet name, display label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetEntry {
    pub key: SheetKey,
    pub sheet: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl SheetEntry {
    pub fn new(key: &str, sheet: &str) -> Self {
        Self {
            key: SheetKey::from(key),
            sheet: sheet.to_string(),
            name: None,
        }
    }

    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.sheet)
    }
}

/// Known sheets, in display order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SheetCatalog {
    entries: Vec<SheetEntry>,
}

impl Default for SheetCatalog {
    fn default() -> Self {
        Self::new(vec![
            SheetEntry::new("0", "eng1"),
            SheetEntry::new("1", "eng2"),
            SheetEntry::new("2", "eng3"),
            SheetEntry::new("3", "old1"),
            SheetEntry::new("4", "old2"),
        ])
    }
}

impl SheetCatalog {
    pub fn new(entries: Vec<SheetEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[SheetEntry] {
        &self.entries
    }

    pub fn get(&self, key: &SheetKey) -> Option<&SheetEntry> {
        self.entries.iter().find(|e| &e.key == key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &SheetKey> {
        self.entries.iter().map(|e| &e.key)
    }

    pub fn first_key(&self) -> Option<&SheetKey> {
        self.entries.first().map(|e| &e.key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What happens to unsaved edits when the user switches to another sheet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchPolicy {
    /// Roll the sheet back to its last synced state and switch.
    Discard,
    /// Save first; if the save does not succeed, stay on the current sheet.
    #[default]
    Autosave,
}

fn default_success_statuses() -> Vec<String> {
    vec!["success".to_string(), "ok".to_string(), "done".to_string()]
}

/// Sync behaviour knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default)]
    pub switch_policy: SwitchPolicy,
    /// Save acknowledgements treated as success (case-insensitive).
    #[serde(default = "default_success_statuses")]
    pub success_statuses: Vec<String>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            switch_policy: SwitchPolicy::default(),
            success_statuses: default_success_statuses(),
        }
    }
}

impl SyncSettings {
    pub fn is_success_status(&self, status: &str) -> bool {
        let status = status.trim();
        self.success_statuses
            .iter()
            .any(|s| s.trim().eq_ignore_ascii_case(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_catalog() {
        let catalog = SheetCatalog::default();
        assert_eq!(catalog.entries().len(), 5);
        assert_eq!(catalog.get(&SheetKey::from("3")).unwrap().sheet, "old1");
        assert!(catalog.get(&SheetKey::from("9")).is_none());
        assert_eq!(catalog.first_key(), Some(&SheetKey::from("0")));
    }

    #[test]
    fn test_success_statuses() {
        let settings = SyncSettings::default();
        assert!(settings.is_success_status("success"));
        assert!(settings.is_success_status(" OK "));
        assert!(settings.is_success_status("Done"));
        assert!(!settings.is_success_status("error"));
        assert!(!settings.is_success_status(""));
    }

    #[test]
    fn test_settings_deserialize_defaults() {
        let settings: SyncSettings = serde_json::from_str(r#"{"switch_policy":"discard"}"#).unwrap();
        assert_eq!(settings.switch_policy, SwitchPolicy::Discard);
        assert_eq!(settings.success_statuses.len(), 3);
    }
}
