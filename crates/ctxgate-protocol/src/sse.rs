use bytes::Bytes;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental server-sent-events parser. Fed from a byte stream that is
/// forwarded to the client untouched; the parser only observes.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &Bytes) -> Vec<SseEvent> {
        match std::str::from_utf8(chunk) {
            Ok(text) => self.push_str(text),
            Err(_) => Vec::new(),
        }
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let mut line = self.buffer[..pos].to_string();
            self.buffer.drain(..=pos);
            if line.ends_with('\r') {
                line.pop();
            }
            if line.is_empty() {
                self.flush_event(&mut events);
                continue;
            }
            self.consume_line(&line);
        }
        events
    }

    pub fn finish(&mut self) -> Vec<SseEvent> {
        if !self.buffer.is_empty() {
            let mut line = std::mem::take(&mut self.buffer);
            if line.ends_with('\r') {
                line.pop();
            }
            self.consume_line(&line);
        }
        let mut events = Vec::new();
        self.flush_event(&mut events);
        events
    }

    fn consume_line(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }
        if let Some(value) = line.strip_prefix("event:") {
            let value = value.trim_start();
            self.event = (!value.is_empty()).then(|| value.to_string());
        } else if line == "event" {
            self.event = None;
        } else if let Some(value) = line.strip_prefix("data:") {
            self.data_lines.push(value.trim_start().to_string());
        } else if line == "data" {
            self.data_lines.push(String::new());
        }
    }

    fn flush_event(&mut self, events: &mut Vec<SseEvent>) {
        if self.event.is_none() && self.data_lines.is_empty() {
            return;
        }
        events.push(SseEvent {
            event: self.event.take(),
            data: self.data_lines.join("\n"),
        });
        self.data_lines.clear();
    }
}

#[derive(Debug)]
enum DecoderMode {
    Undetected,
    Sse(SseParser),
    JsonLines(String),
}

/// Framing-agnostic decoder for upstream streams: sniffs SSE vs JSON-lines
/// from the first chunk and yields the JSON payload of each frame.
#[derive(Debug)]
pub struct FrameDecoder {
    mode: DecoderMode,
    pending: String,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            mode: DecoderMode::Undetected,
            pending: String::new(),
        }
    }

    pub fn push(&mut self, chunk: &Bytes) -> Vec<String> {
        let Ok(text) = std::str::from_utf8(chunk) else {
            return Vec::new();
        };
        match &mut self.mode {
            DecoderMode::Undetected => {
                self.pending.push_str(text);
                let combined = std::mem::take(&mut self.pending);
                let Some(first) = combined.chars().find(|c| !c.is_whitespace()) else {
                    self.pending = combined;
                    return Vec::new();
                };
                if matches!(first, '{' | '[') {
                    let mut buffer = String::new();
                    buffer.push_str(&combined);
                    let payloads = drain_json_lines(&mut buffer);
                    self.mode = DecoderMode::JsonLines(buffer);
                    payloads
                } else {
                    let mut parser = SseParser::new();
                    let events = parser.push_str(&combined);
                    self.mode = DecoderMode::Sse(parser);
                    data_payloads(events)
                }
            }
            DecoderMode::Sse(parser) => data_payloads(parser.push_str(text)),
            DecoderMode::JsonLines(buffer) => {
                buffer.push_str(text);
                drain_json_lines(buffer)
            }
        }
    }

    pub fn finish(&mut self) -> Vec<String> {
        match &mut self.mode {
            DecoderMode::Undetected => {
                let pending = self.pending.trim();
                if pending.is_empty() {
                    Vec::new()
                } else {
                    vec![pending.to_string()]
                }
            }
            DecoderMode::Sse(parser) => data_payloads(parser.finish()),
            DecoderMode::JsonLines(buffer) => {
                let mut payloads = drain_json_lines(buffer);
                let rest = buffer.trim().trim_start_matches(['[', ',']).trim();
                let rest = rest.trim_end_matches(']').trim();
                if !rest.is_empty() {
                    payloads.push(rest.to_string());
                }
                buffer.clear();
                payloads
            }
        }
    }
}

fn data_payloads(events: Vec<SseEvent>) -> Vec<String> {
    events
        .into_iter()
        .filter(|event| !event.data.is_empty())
        .map(|event| event.data)
        .collect()
}

/// Gemini streams a JSON array of objects; each complete top-level object is
/// one frame. Newline-delimited JSON falls out of the same walk.
fn drain_json_lines(buffer: &mut String) -> Vec<String> {
    let mut payloads = Vec::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape = false;
    let mut start = None;
    let mut consumed = 0;
    for (index, ch) in buffer.char_indices() {
        if in_string {
            if escape {
                escape = false;
            } else if ch == '\\' {
                escape = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(index);
                }
                depth += 1;
            }
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0
                    && let Some(begin) = start.take()
                {
                    payloads.push(buffer[begin..=index].to_string());
                    consumed = index + ch.len_utf8();
                }
            }
            _ => {}
        }
    }
    buffer.drain(..consumed);
    payloads
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_named_events_across_chunks() {
        let mut parser = SseParser::new();
        let mut events = parser.push_str("event: message_start\ndata: {\"a\":");
        events.extend(parser.push_str("1}\n\n"));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
        assert_eq!(events[0].data, "{\"a\":1}");
    }

    #[test]
    fn joins_multi_line_data() {
        let mut parser = SseParser::new();
        let events = parser.push_str("data: one\ndata: two\n\n");
        assert_eq!(events[0].data, "one\ntwo");
    }

    #[test]
    fn comments_are_ignored() {
        let mut parser = SseParser::new();
        let events = parser.push_str(": keepalive\n\ndata: x\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn decoder_sniffs_sse() {
        let mut decoder = FrameDecoder::new();
        let payloads = decoder.push(&Bytes::from_static(b"data: {\"usage\":{}}\n\n"));
        assert_eq!(payloads, vec!["{\"usage\":{}}".to_string()]);
    }

    #[test]
    fn decoder_sniffs_json_array() {
        let mut decoder = FrameDecoder::new();
        let mut payloads = decoder.push(&Bytes::from_static(b"[{\"a\":1},"));
        payloads.extend(decoder.push(&Bytes::from_static(b"{\"b\":2}]")));
        payloads.extend(decoder.finish());
        assert_eq!(payloads, vec!["{\"a\":1}".to_string(), "{\"b\":2}".to_string()]);
    }

    #[test]
    fn trailing_data_without_newline_flushes_on_finish() {
        let mut parser = SseParser::new();
        assert!(parser.push_str("data: tail").is_empty());
        let events = parser.finish();
        assert_eq!(events[0].data, "tail");
    }
}
