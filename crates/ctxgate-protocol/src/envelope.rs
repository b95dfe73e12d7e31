use bytes::Bytes;
use serde_json::{Value, json};

/// Inference wire shapes the gateway fronts. Bedrock reuses the Claude
/// envelope, so it does not appear here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireShape {
    Claude,
    OpenAiChat,
    Gemini,
}

/// A partially-deserialized inference request.
///
/// The raw body is retained; only the fields the pipes and the compactor need
/// are read out of the parsed tree. Serialization round-trips the original
/// bytes unless a rewrite marked the envelope dirty.
#[derive(Debug, Clone)]
pub struct Envelope {
    shape: WireShape,
    raw: Bytes,
    value: Value,
    model_hint: Option<String>,
    dirty: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolEntry {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct ToolResultView {
    pub tool_use_id: Option<String>,
    pub tool_name: Option<String>,
    pub text: String,
    pub byte_len: usize,
}

impl Envelope {
    pub fn parse(shape: WireShape, raw: Bytes) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_slice(&raw)?;
        Ok(Self {
            shape,
            raw,
            value,
            model_hint: None,
            dirty: false,
        })
    }

    #[doc(hidden)]
    pub fn from_value(shape: WireShape, value: Value) -> Self {
        let raw = Bytes::from(serde_json::to_vec(&value).unwrap_or_default());
        Self {
            shape,
            raw,
            value,
            model_hint: None,
            dirty: false,
        }
    }

    pub fn shape(&self) -> WireShape {
        self.shape
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Gemini carries the model in the URL path rather than the body.
    pub fn set_model_hint(&mut self, model: impl Into<String>) {
        self.model_hint = Some(model.into());
    }

    pub fn model(&self) -> Option<&str> {
        if let Some(hint) = self.model_hint.as_deref() {
            return Some(hint);
        }
        self.value.get("model").and_then(Value::as_str)
    }

    pub fn stream(&self) -> bool {
        self.value
            .get("stream")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    fn messages_key(&self) -> &'static str {
        match self.shape {
            WireShape::Claude | WireShape::OpenAiChat => "messages",
            WireShape::Gemini => "contents",
        }
    }

    pub fn messages(&self) -> &[Value] {
        self.value
            .get(self.messages_key())
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn replace_messages(&mut self, messages: Vec<Value>) {
        let key = self.messages_key();
        if let Some(object) = self.value.as_object_mut() {
            object.insert(key.to_string(), Value::Array(messages));
            self.dirty = true;
        }
    }

    /// Estimated serialized size of one message, for token metering.
    pub fn message_bytes(message: &Value) -> usize {
        serde_json::to_string(message).map(|s| s.len()).unwrap_or(0)
    }

    pub fn role_of(&self, message: &Value) -> Option<String> {
        message
            .get("role")
            .and_then(Value::as_str)
            .map(|role| role.to_string())
    }

    /// Text of the most recent user message, used as the relevance query by
    /// both pipes.
    pub fn last_user_query(&self) -> Option<String> {
        self.messages().iter().rev().find_map(|message| {
            let role = message.get("role").and_then(Value::as_str)?;
            if role != "user" {
                return None;
            }
            let text = flatten_message_text(self.shape, message);
            if text.is_empty() { None } else { Some(text) }
        })
    }

    pub fn tools(&self) -> &[Value] {
        self.value
            .get("tools")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn tool_catalog(&self) -> Vec<ToolEntry> {
        match self.shape {
            WireShape::Claude => self
                .tools()
                .iter()
                .filter_map(|tool| {
                    Some(ToolEntry {
                        name: tool.get("name")?.as_str()?.to_string(),
                        description: tool
                            .get("description")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string(),
                    })
                })
                .collect(),
            WireShape::OpenAiChat => self
                .tools()
                .iter()
                .filter_map(|tool| {
                    let function = tool.get("function")?;
                    Some(ToolEntry {
                        name: function.get("name")?.as_str()?.to_string(),
                        description: function
                            .get("description")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string(),
                    })
                })
                .collect(),
            WireShape::Gemini => self
                .tools()
                .iter()
                .flat_map(|tool| {
                    tool.get("functionDeclarations")
                        .and_then(Value::as_array)
                        .map(Vec::as_slice)
                        .unwrap_or(&[])
                        .iter()
                })
                .filter_map(|decl| {
                    Some(ToolEntry {
                        name: decl.get("name")?.as_str()?.to_string(),
                        description: decl
                            .get("description")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string(),
                    })
                })
                .collect(),
        }
    }

    /// Filters the tools array down to `keep`, preserving input order.
    pub fn retain_tools(&mut self, keep: &[String]) {
        let shape = self.shape;
        let Some(tools) = self
            .value
            .get_mut("tools")
            .and_then(Value::as_array_mut)
        else {
            return;
        };
        match shape {
            WireShape::Claude => {
                tools.retain(|tool| {
                    tool.get("name")
                        .and_then(Value::as_str)
                        .map(|name| keep.iter().any(|k| k == name))
                        .unwrap_or(false)
                });
            }
            WireShape::OpenAiChat => {
                tools.retain(|tool| {
                    tool.get("function")
                        .and_then(|f| f.get("name"))
                        .and_then(Value::as_str)
                        .map(|name| keep.iter().any(|k| k == name))
                        .unwrap_or(false)
                });
            }
            WireShape::Gemini => {
                for tool in tools.iter_mut() {
                    if let Some(decls) = tool
                        .get_mut("functionDeclarations")
                        .and_then(Value::as_array_mut)
                    {
                        decls.retain(|decl| {
                            decl.get("name")
                                .and_then(Value::as_str)
                                .map(|name| keep.iter().any(|k| k == name))
                                .unwrap_or(false)
                        });
                    }
                }
                tools.retain(|tool| {
                    tool.get("functionDeclarations")
                        .and_then(Value::as_array)
                        .map(|decls| !decls.is_empty())
                        .unwrap_or(true)
                });
            }
        }
        self.dirty = true;
    }

    /// Swaps the entire tools array, e.g. for the tool-search meta-tool.
    pub fn replace_tools(&mut self, tools: Vec<Value>) {
        if let Some(object) = self.value.as_object_mut() {
            object.insert("tools".to_string(), Value::Array(tools));
            self.dirty = true;
        }
    }

    /// Maps tool_use ids to tool names from prior assistant turns, so a
    /// tool_result can be attributed even when the block itself only carries
    /// the id.
    pub fn tool_use_names(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        for message in self.messages() {
            match self.shape {
                WireShape::Claude => {
                    let Some(blocks) = message.get("content").and_then(Value::as_array) else {
                        continue;
                    };
                    for block in blocks {
                        if block.get("type").and_then(Value::as_str) == Some("tool_use")
                            && let (Some(id), Some(name)) = (
                                block.get("id").and_then(Value::as_str),
                                block.get("name").and_then(Value::as_str),
                            )
                        {
                            pairs.push((id.to_string(), name.to_string()));
                        }
                    }
                }
                WireShape::OpenAiChat => {
                    let Some(calls) = message.get("tool_calls").and_then(Value::as_array) else {
                        continue;
                    };
                    for call in calls {
                        if let (Some(id), Some(name)) = (
                            call.get("id").and_then(Value::as_str),
                            call.get("function")
                                .and_then(|f| f.get("name"))
                                .and_then(Value::as_str),
                        ) {
                            pairs.push((id.to_string(), name.to_string()));
                        }
                    }
                }
                WireShape::Gemini => {
                    let Some(parts) = message.get("parts").and_then(Value::as_array) else {
                        continue;
                    };
                    for part in parts {
                        if let Some(name) = part
                            .get("functionCall")
                            .and_then(|c| c.get("name"))
                            .and_then(Value::as_str)
                        {
                            pairs.push((name.to_string(), name.to_string()));
                        }
                    }
                }
            }
        }
        pairs
    }

    /// tool_use invocations with their parsed inputs, for answering the
    /// gateway's own synthetic tools locally.
    pub fn tool_use_inputs(&self) -> Vec<(String, String, Value)> {
        let mut calls = Vec::new();
        for message in self.messages() {
            match self.shape {
                WireShape::Claude => {
                    let Some(blocks) = message.get("content").and_then(Value::as_array) else {
                        continue;
                    };
                    for block in blocks {
                        if block.get("type").and_then(Value::as_str) == Some("tool_use")
                            && let (Some(id), Some(name)) = (
                                block.get("id").and_then(Value::as_str),
                                block.get("name").and_then(Value::as_str),
                            )
                        {
                            calls.push((
                                id.to_string(),
                                name.to_string(),
                                block.get("input").cloned().unwrap_or(Value::Null),
                            ));
                        }
                    }
                }
                WireShape::OpenAiChat => {
                    let Some(tool_calls) = message.get("tool_calls").and_then(Value::as_array)
                    else {
                        continue;
                    };
                    for call in tool_calls {
                        let Some(function) = call.get("function") else {
                            continue;
                        };
                        if let (Some(id), Some(name)) = (
                            call.get("id").and_then(Value::as_str),
                            function.get("name").and_then(Value::as_str),
                        ) {
                            let arguments = function
                                .get("arguments")
                                .and_then(Value::as_str)
                                .and_then(|raw| serde_json::from_str(raw).ok())
                                .unwrap_or(Value::Null);
                            calls.push((id.to_string(), name.to_string(), arguments));
                        }
                    }
                }
                WireShape::Gemini => {
                    let Some(parts) = message.get("parts").and_then(Value::as_array) else {
                        continue;
                    };
                    for part in parts {
                        if let Some(call) = part.get("functionCall")
                            && let Some(name) = call.get("name").and_then(Value::as_str)
                        {
                            calls.push((
                                name.to_string(),
                                name.to_string(),
                                call.get("args").cloned().unwrap_or(Value::Null),
                            ));
                        }
                    }
                }
            }
        }
        calls
    }

    /// Appends a tool given in Claude shape, converted for this envelope's
    /// wire format.
    pub fn append_tool(&mut self, claude_tool: Value) {
        let converted = tool_value_for_shape(self.shape, &claude_tool);
        match self.value.get_mut("tools").and_then(Value::as_array_mut) {
            Some(tools) => match self.shape {
                WireShape::Gemini => {
                    if let Some(decls) = tools
                        .iter_mut()
                        .find_map(|tool| {
                            tool.get_mut("functionDeclarations").and_then(Value::as_array_mut)
                        })
                    {
                        decls.push(converted);
                    } else {
                        tools.push(json!({ "functionDeclarations": [converted] }));
                    }
                }
                _ => tools.push(converted),
            },
            None => {
                let tools = match self.shape {
                    WireShape::Gemini => {
                        Value::Array(vec![json!({ "functionDeclarations": [converted] })])
                    }
                    _ => Value::Array(vec![converted]),
                };
                if let Some(object) = self.value.as_object_mut() {
                    object.insert("tools".to_string(), tools);
                }
            }
        }
        self.dirty = true;
    }

    /// Visits every tool_result block; when the callback returns replacement
    /// text the block content is rewritten in place.
    pub fn rewrite_tool_results(
        &mut self,
        mut rewrite: impl FnMut(&ToolResultView) -> Option<String>,
    ) -> usize {
        let shape = self.shape;
        let id_names = self.tool_use_names();
        let key = self.messages_key();
        let Some(messages) = self.value.get_mut(key).and_then(Value::as_array_mut) else {
            return 0;
        };
        let mut rewritten = 0;
        for message in messages.iter_mut() {
            match shape {
                WireShape::Claude => {
                    let Some(blocks) = message.get_mut("content").and_then(Value::as_array_mut)
                    else {
                        continue;
                    };
                    for block in blocks.iter_mut() {
                        if block.get("type").and_then(Value::as_str) != Some("tool_result") {
                            continue;
                        }
                        let tool_use_id = block
                            .get("tool_use_id")
                            .and_then(Value::as_str)
                            .map(|id| id.to_string());
                        let text = flatten_block_content(block.get("content"));
                        let view = ToolResultView {
                            tool_name: tool_use_id.as_deref().and_then(|id| {
                                id_names
                                    .iter()
                                    .find(|(known, _)| known == id)
                                    .map(|(_, name)| name.clone())
                            }),
                            tool_use_id,
                            byte_len: text.len(),
                            text,
                        };
                        if let Some(replacement) = rewrite(&view) {
                            block["content"] = Value::String(replacement);
                            rewritten += 1;
                        }
                    }
                }
                WireShape::OpenAiChat => {
                    if message.get("role").and_then(Value::as_str) != Some("tool") {
                        continue;
                    }
                    let tool_use_id = message
                        .get("tool_call_id")
                        .and_then(Value::as_str)
                        .map(|id| id.to_string());
                    let text = flatten_block_content(message.get("content"));
                    let view = ToolResultView {
                        tool_name: tool_use_id.as_deref().and_then(|id| {
                            id_names
                                .iter()
                                .find(|(known, _)| known == id)
                                .map(|(_, name)| name.clone())
                        }),
                        tool_use_id,
                        byte_len: text.len(),
                        text,
                    };
                    if let Some(replacement) = rewrite(&view) {
                        message["content"] = Value::String(replacement);
                        rewritten += 1;
                    }
                }
                WireShape::Gemini => {
                    let Some(parts) = message.get_mut("parts").and_then(Value::as_array_mut)
                    else {
                        continue;
                    };
                    for part in parts.iter_mut() {
                        let Some(response) = part.get("functionResponse") else {
                            continue;
                        };
                        let name = response
                            .get("name")
                            .and_then(Value::as_str)
                            .map(|name| name.to_string());
                        let text = response
                            .get("response")
                            .map(|value| {
                                serde_json::to_string(value).unwrap_or_default()
                            })
                            .unwrap_or_default();
                        let view = ToolResultView {
                            tool_use_id: name.clone(),
                            tool_name: name,
                            byte_len: text.len(),
                            text,
                        };
                        if let Some(replacement) = rewrite(&view) {
                            part["functionResponse"]["response"] =
                                json!({ "output": replacement });
                            rewritten += 1;
                        }
                    }
                }
            }
        }
        if rewritten > 0 {
            self.dirty = true;
        }
        rewritten
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// The outgoing body: original bytes when untouched, re-serialized only
    /// after a rewrite.
    pub fn to_bytes(&self) -> Bytes {
        if !self.dirty {
            return self.raw.clone();
        }
        serde_json::to_vec(&self.value)
            .map(Bytes::from)
            .unwrap_or_else(|_| self.raw.clone())
    }
}

/// Collapses a message to plain text for fingerprinting, relevance scoring
/// and summarizer input. tool_use blocks reduce to `[Tool: name]` markers.
pub fn flatten_message_text(shape: WireShape, message: &Value) -> String {
    match shape {
        WireShape::Claude => match message.get("content") {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Array(blocks)) => {
                let mut out = String::new();
                for block in blocks {
                    match block.get("type").and_then(Value::as_str) {
                        Some("text") => {
                            if let Some(text) = block.get("text").and_then(Value::as_str) {
                                push_joined(&mut out, text);
                            }
                        }
                        Some("tool_use") => {
                            let name = block
                                .get("name")
                                .and_then(Value::as_str)
                                .unwrap_or("unknown");
                            push_joined(&mut out, &format!("[Tool: {name}]"));
                        }
                        Some("tool_result") => {
                            push_joined(&mut out, &flatten_block_content(block.get("content")));
                        }
                        _ => {}
                    }
                }
                out
            }
            _ => String::new(),
        },
        WireShape::OpenAiChat => match message.get("content") {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Array(parts)) => {
                let mut out = String::new();
                for part in parts {
                    if let Some(text) = part.get("text").and_then(Value::as_str) {
                        push_joined(&mut out, text);
                    }
                }
                out
            }
            _ => {
                if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
                    let mut out = String::new();
                    for call in calls {
                        let name = call
                            .get("function")
                            .and_then(|f| f.get("name"))
                            .and_then(Value::as_str)
                            .unwrap_or("unknown");
                        push_joined(&mut out, &format!("[Tool: {name}]"));
                    }
                    out
                } else {
                    String::new()
                }
            }
        },
        WireShape::Gemini => {
            let mut out = String::new();
            if let Some(parts) = message.get("parts").and_then(Value::as_array) {
                for part in parts {
                    if let Some(text) = part.get("text").and_then(Value::as_str) {
                        push_joined(&mut out, text);
                    } else if let Some(name) = part
                        .get("functionCall")
                        .and_then(|c| c.get("name"))
                        .and_then(Value::as_str)
                    {
                        push_joined(&mut out, &format!("[Tool: {name}]"));
                    } else if let Some(response) = part.get("functionResponse") {
                        push_joined(
                            &mut out,
                            &serde_json::to_string(response).unwrap_or_default(),
                        );
                    }
                }
            }
            out
        }
    }
}

fn flatten_block_content(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(blocks)) => {
            let mut out = String::new();
            for block in blocks {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    push_joined(&mut out, text);
                } else if let Ok(text) = serde_json::to_string(block) {
                    push_joined(&mut out, &text);
                }
            }
            out
        }
        Some(other) => serde_json::to_string(other).unwrap_or_default(),
        None => String::new(),
    }
}

fn push_joined(out: &mut String, text: &str) {
    if !out.is_empty() {
        out.push('\n');
    }
    out.push_str(text);
}

/// Builds a provider-shaped message carrying a compaction summary.
pub fn summary_message(shape: WireShape, summary: &str) -> Value {
    let text = format!(
        "Summary of the conversation so far (earlier turns were compacted):\n\n{summary}"
    );
    match shape {
        WireShape::Claude => json!({
            "role": "user",
            "content": [{ "type": "text", "text": text }],
        }),
        WireShape::OpenAiChat => json!({
            "role": "system",
            "content": text,
        }),
        WireShape::Gemini => json!({
            "role": "user",
            "parts": [{ "text": text }],
        }),
    }
}

/// True when the message holds a tool_result (or equivalent) that must stay
/// adjacent to its tool_use across a splice boundary.
pub fn message_has_tool_result(shape: WireShape, message: &Value) -> bool {
    match shape {
        WireShape::Claude => message
            .get("content")
            .and_then(Value::as_array)
            .map(|blocks| {
                blocks
                    .iter()
                    .any(|block| block.get("type").and_then(Value::as_str) == Some("tool_result"))
            })
            .unwrap_or(false),
        WireShape::OpenAiChat => message.get("role").and_then(Value::as_str) == Some("tool"),
        WireShape::Gemini => message
            .get("parts")
            .and_then(Value::as_array)
            .map(|parts| parts.iter().any(|part| part.get("functionResponse").is_some()))
            .unwrap_or(false),
    }
}

/// Converts a Claude-shaped tool definition to the target wire format.
pub fn tool_value_for_shape(shape: WireShape, claude_tool: &Value) -> Value {
    match shape {
        WireShape::Claude => claude_tool.clone(),
        WireShape::OpenAiChat => json!({
            "type": "function",
            "function": {
                "name": claude_tool.get("name").cloned().unwrap_or(Value::Null),
                "description": claude_tool.get("description").cloned().unwrap_or(Value::Null),
                "parameters": claude_tool.get("input_schema").cloned().unwrap_or(Value::Null),
            },
        }),
        WireShape::Gemini => json!({
            "name": claude_tool.get("name").cloned().unwrap_or(Value::Null),
            "description": claude_tool.get("description").cloned().unwrap_or(Value::Null),
            "parameters": claude_tool.get("input_schema").cloned().unwrap_or(Value::Null),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claude_envelope() -> Envelope {
        Envelope::from_value(
            WireShape::Claude,
            json!({
                "model": "claude-sonnet-4-5",
                "stream": true,
                "messages": [
                    { "role": "user", "content": "read the main.go file" },
                    { "role": "assistant", "content": [
                        { "type": "tool_use", "id": "tu_1", "name": "read_file", "input": {} }
                    ]},
                    { "role": "user", "content": [
                        { "type": "tool_result", "tool_use_id": "tu_1", "content": "package main" }
                    ]}
                ],
                "tools": [
                    { "name": "read_file", "description": "Read a file", "input_schema": {} },
                    { "name": "write_file", "description": "Write a file", "input_schema": {} }
                ]
            }),
        )
    }

    #[test]
    fn model_and_stream() {
        let envelope = claude_envelope();
        assert_eq!(envelope.model(), Some("claude-sonnet-4-5"));
        assert!(envelope.stream());
    }

    #[test]
    fn passthrough_is_byte_identical_until_dirty() {
        let envelope = claude_envelope();
        let raw = envelope.to_bytes();
        assert_eq!(raw, envelope.raw);
    }

    #[test]
    fn retain_tools_preserves_order() {
        let mut envelope = claude_envelope();
        envelope.retain_tools(&["write_file".to_string(), "read_file".to_string()]);
        let names: Vec<_> = envelope
            .tool_catalog()
            .into_iter()
            .map(|entry| entry.name)
            .collect();
        assert_eq!(names, vec!["read_file", "write_file"]);
    }

    #[test]
    fn tool_result_rewrite_marks_dirty() {
        let mut envelope = claude_envelope();
        let count = envelope.rewrite_tool_results(|view| {
            assert_eq!(view.tool_name.as_deref(), Some("read_file"));
            Some("compressed".to_string())
        });
        assert_eq!(count, 1);
        assert!(envelope.is_dirty());
        let text = flatten_message_text(WireShape::Claude, &envelope.messages()[2]);
        assert_eq!(text, "compressed");
    }

    #[test]
    fn last_user_query_skips_assistant_turns() {
        let envelope = claude_envelope();
        let query = envelope.last_user_query().unwrap();
        assert!(query.contains("package main") || query.contains("read the main.go file"));
    }

    #[test]
    fn gemini_function_response_rewrite() {
        let mut envelope = Envelope::from_value(
            WireShape::Gemini,
            json!({
                "contents": [
                    { "role": "user", "parts": [{ "text": "hi" }] },
                    { "role": "model", "parts": [{ "functionCall": { "name": "search", "args": {} } }] },
                    { "role": "user", "parts": [{ "functionResponse": { "name": "search", "response": { "output": "lots of results" } } }] }
                ]
            }),
        );
        let count = envelope.rewrite_tool_results(|view| {
            assert_eq!(view.tool_name.as_deref(), Some("search"));
            Some("short".to_string())
        });
        assert_eq!(count, 1);
    }
}
