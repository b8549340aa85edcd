//! Script metadata catalog (`scripts.json`)

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::PopupError;

/// Longest description shown before truncation, in characters
pub const DESCRIPTION_LIMIT: usize = 120;

/// One available breaker script
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptMeta {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default)]
pub struct ScriptCatalog {
    scripts: Vec<ScriptMeta>,
}

impl ScriptCatalog {
    pub fn new(scripts: Vec<ScriptMeta>) -> Self {
        Self { scripts }
    }

    pub fn from_json(json: &str) -> Result<Self, PopupError> {
        let scripts =
            serde_json::from_str(json).map_err(|e| PopupError::catalog_load(e.to_string()))?;
        Ok(Self { scripts })
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, PopupError> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| PopupError::catalog_load(format!("{}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    pub fn scripts(&self) -> &[ScriptMeta] {
        &self.scripts
    }

    /// Scripts whose name or description contains `term`, ignoring case
    pub fn search(&self, term: &str) -> Vec<&ScriptMeta> {
        let term = term.to_lowercase();
        self.scripts
            .iter()
            .filter(|script| {
                script.name.to_lowercase().contains(&term)
                    || script.description.to_lowercase().contains(&term)
            })
            .collect()
    }
}

/// A row of the popup grid
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptEntry {
    pub id: String,
    pub name: String,
    pub description: String,
    pub enabled: bool,
}

pub fn truncate_description(description: &str) -> String {
    if description.chars().count() <= DESCRIPTION_LIMIT {
        return description.to_string();
    }
    let mut truncated: String = description.chars().take(DESCRIPTION_LIMIT).collect();
    truncated.push_str("...");
    truncated
}

/// Rows for the given scripts; entries with a blank id are skipped.
pub fn render_entries<'a>(
    scripts: impl IntoIterator<Item = &'a ScriptMeta>,
    enabled: &[String],
) -> Vec<ScriptEntry> {
    scripts
        .into_iter()
        .filter_map(|script| {
            if script.id.trim().is_empty() {
                error!(name = %script.name, "Invalid script ID in catalog");
                return None;
            }
            Some(ScriptEntry {
                id: script.id.clone(),
                name: script.name.clone(),
                description: truncate_description(&script.description),
                enabled: enabled.contains(&script.id),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"[
        {"id": "no_debugger", "name": "Bypass debugger", "description": "Neutralizes debugger statements"},
        {"id": "hook_console", "name": "Console guard", "description": "Keeps console.clear from wiping logs"},
        {"id": " ", "name": "Broken", "description": "blank id"}
    ]"#;

    #[test]
    fn test_search_matches_name_or_description() {
        let catalog = ScriptCatalog::from_json(CATALOG).unwrap();

        let ids = |found: Vec<&ScriptMeta>| found.into_iter().map(|s| s.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(catalog.search("DEBUGGER")), vec!["no_debugger"]);
        assert_eq!(ids(catalog.search("clear")), vec!["hook_console"]);
        assert_eq!(catalog.search("").len(), 3);
        assert!(catalog.search("zzz").is_empty());
    }

    #[test]
    fn test_render_skips_blank_ids_and_marks_enabled() {
        let catalog = ScriptCatalog::from_json(CATALOG).unwrap();

        let entries = render_entries(catalog.scripts(), &["hook_console".to_string()]);

        assert_eq!(entries.len(), 2);
        assert!(!entries[0].enabled);
        assert!(entries[1].enabled);
    }

    #[test]
    fn test_truncate_description() {
        let short = "a".repeat(DESCRIPTION_LIMIT);
        assert_eq!(truncate_description(&short), short);

        let long = "é".repeat(DESCRIPTION_LIMIT + 5);
        let truncated = truncate_description(&long);
        assert!(truncated.ends_with("..."));
        assert_eq!(truncated.chars().count(), DESCRIPTION_LIMIT + 3);
    }

    #[test]
    fn test_malformed_catalog() {
        let err = ScriptCatalog::from_json("{\"id\": 1}").unwrap_err();
        assert!(matches!(err, PopupError::CatalogLoad { .. }));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scripts.json");
        tokio::fs::write(&path, CATALOG).await.unwrap();

        let catalog = ScriptCatalog::load(&path).await.unwrap();
        assert_eq!(catalog.scripts().len(), 3);

        let missing = ScriptCatalog::load(dir.path().join("nope.json")).await;
        assert!(missing.is_err());
    }
}
