use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use regex::RegexBuilder;
use serde_json::{Value, json};

pub const TOOL_SEARCH_NAME: &str = "tool_search";
const CATALOG_CAPACITY: usize = 64;

/// Schema for the gateway-provided meta-tool that replaces the catalog under
/// the tool-search strategy.
pub fn tool_search_meta_tool() -> Value {
    json!({
        "name": TOOL_SEARCH_NAME,
        "description": "Search the full tool catalog by regular expression over tool names and descriptions. Returns the matching tool schemas. Use this before assuming a tool is unavailable.",
        "input_schema": {
            "type": "object",
            "properties": {
                "pattern": { "type": "string", "description": "Regular expression matched against tool names and descriptions." }
            },
            "required": ["pattern"]
        }
    })
}

/// Original catalogs for conversations running under the tool-search
/// strategy, keyed by conversation fingerprint. The regex resolution always
/// happens locally; there is no remote fallback to miss.
pub struct ToolSearchStore {
    catalogs: Mutex<LruCache<String, Vec<Value>>>,
}

impl Default for ToolSearchStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolSearchStore {
    pub fn new() -> Self {
        Self {
            catalogs: Mutex::new(LruCache::new(
                NonZeroUsize::new(CATALOG_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    pub fn remember(&self, key: &str, catalog: Vec<Value>) {
        if let Ok(mut catalogs) = self.catalogs.lock() {
            catalogs.put(key.to_string(), catalog);
        }
    }

    pub fn catalog(&self, key: &str) -> Option<Vec<Value>> {
        self.catalogs
            .lock()
            .ok()
            .and_then(|mut catalogs| catalogs.get(key).cloned())
    }

    /// Resolves a search pattern against the stored catalog. An invalid
    /// regex degrades to a case-insensitive substring match.
    pub fn search(&self, key: &str, pattern: &str) -> Vec<Value> {
        let Some(catalog) = self.catalog(key) else {
            return Vec::new();
        };
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .size_limit(1 << 20)
            .build()
            .ok();
        catalog
            .into_iter()
            .filter(|tool| {
                let name = tool.get("name").and_then(Value::as_str).unwrap_or("");
                let description = tool
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                match &regex {
                    Some(regex) => regex.is_match(name) || regex.is_match(description),
                    None => {
                        let needle = pattern.to_ascii_lowercase();
                        name.to_ascii_lowercase().contains(&needle)
                            || description.to_ascii_lowercase().contains(&needle)
                    }
                }
            })
            .collect()
    }

    /// Text body for the tool_result answering a search call.
    pub fn search_result_text(&self, key: &str, pattern: &str) -> String {
        let matches = self.search(key, pattern);
        if matches.is_empty() {
            return format!("No tools matched /{pattern}/.");
        }
        serde_json::to_string_pretty(&Value::Array(matches))
            .unwrap_or_else(|_| "[]".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Vec<Value> {
        vec![
            json!({ "name": "read_file", "description": "Read a file from disk" }),
            json!({ "name": "write_file", "description": "Write contents to disk" }),
            json!({ "name": "http_get", "description": "Fetch a URL" }),
        ]
    }

    #[test]
    fn regex_matches_names_and_descriptions() {
        let store = ToolSearchStore::new();
        store.remember("fp", catalog());
        let matches = store.search("fp", "^read|fetch");
        let names: Vec<_> = matches
            .iter()
            .map(|tool| tool["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["read_file", "http_get"]);
    }

    #[test]
    fn invalid_regex_degrades_to_substring() {
        let store = ToolSearchStore::new();
        store.remember("fp", catalog());
        let matches = store.search("fp", "write_fi(");
        assert!(matches.is_empty());
        let matches = store.search("fp", "write_fi");
        assert_eq!(matches.len(), 1);
    }

    #[test]
    fn unknown_key_finds_nothing() {
        let store = ToolSearchStore::new();
        assert!(store.search("missing", ".*").is_empty());
    }
}
