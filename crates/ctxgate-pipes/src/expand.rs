use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use serde_json::{Value, json};
use uuid::Uuid;

pub const EXPAND_TOOL_NAME: &str = "expand_context";
/// Leading text of the compression trailer; also the marker that stops a
/// block from being compressed twice.
pub const TRAILER_MARK: &str = "[Output compressed by gateway";
const STORE_CAPACITY: usize = 256;

/// Originals of compressed tool outputs, retrievable through the synthetic
/// `expand_context` tool. Bounded LRU; oldest entries drop first.
pub struct ExpandContextStore {
    entries: Mutex<LruCache<String, String>>,
}

impl Default for ExpandContextStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpandContextStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(STORE_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    pub fn insert(&self, original: String) -> String {
        let id = format!("ec_{}", Uuid::new_v4().simple());
        if let Ok(mut entries) = self.entries.lock() {
            entries.put(id.clone(), original);
        }
        id
    }

    pub fn get(&self, id: &str) -> Option<String> {
        self.entries
            .lock()
            .ok()
            .and_then(|mut entries| entries.get(id).cloned())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries
            .lock()
            .map(|entries| entries.contains(id))
            .unwrap_or(false)
    }

    /// Trailer advertising retrieval of the original output.
    pub fn trailer(&self, id: &str) -> String {
        format!(
            "\n\n{TRAILER_MARK}. Call the {EXPAND_TOOL_NAME} tool with \
             {{\"id\": \"{id}\"}} to retrieve the original.]"
        )
    }
}

/// Schema for the synthetic retrieval tool, appended to the catalog when
/// expand-context is enabled.
pub fn expand_tool_schema() -> Value {
    json!({
        "name": EXPAND_TOOL_NAME,
        "description": "Retrieve the original, uncompressed content of a tool result that the gateway previously compressed. Pass the id from the compression trailer.",
        "input_schema": {
            "type": "object",
            "properties": {
                "id": { "type": "string", "description": "Identifier from the compression trailer." }
            },
            "required": ["id"]
        }
    })
}
