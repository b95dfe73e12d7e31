use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::warn;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    RequestCompleted {
        trace_id: String,
        provider: String,
        model: String,
        status: u16,
        is_stream: bool,
        elapsed_ms: u64,
        cost_usd: f64,
        fallback_used: bool,
    },
    ToolOutputCompressed {
        trace_id: String,
        candidates: usize,
        compressed: usize,
        saved_bytes: u64,
    },
    ToolDiscoveryFiltered {
        trace_id: String,
        original_tools: usize,
        kept_tools: usize,
        saved_bytes: u64,
    },
    HistoryCompaction {
        fingerprint: String,
        usage_pct: u64,
        scheduled: bool,
        spliced_messages: usize,
        saved_bytes: u64,
    },
}

impl Event {
    /// Session-directory file the event lands in.
    fn file_name(&self) -> &'static str {
        match self {
            Event::RequestCompleted { .. } => "telemetry.jsonl",
            Event::ToolOutputCompressed { .. } => "tool_output_compression.jsonl",
            Event::ToolDiscoveryFiltered { .. } => "tool_discovery.jsonl",
            Event::HistoryCompaction { .. } => "history_compaction.jsonl",
        }
    }
}

pub trait EventSink: Send + Sync {
    fn write<'a>(&'a self, event: &'a Event) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

/// Fans events out to registered sinks without blocking the emitter.
#[derive(Clone, Default)]
pub struct EventHub {
    sinks: Arc<RwLock<Vec<Arc<dyn EventSink>>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.sinks.write().await.push(sink);
    }

    pub fn emit(&self, event: Event) {
        let sinks = self.sinks.clone();
        tokio::spawn(async move {
            let sinks = sinks.read().await.clone();
            for sink in sinks {
                sink.write(&event).await;
            }
        });
    }
}

/// Append-only JSON-lines sink under the session directory.
pub struct JsonlSink {
    session_dir: PathBuf,
}

impl JsonlSink {
    pub fn new(session_dir: impl Into<PathBuf>) -> Self {
        Self {
            session_dir: session_dir.into(),
        }
    }

    async fn append(&self, file_name: &str, line: String) {
        let path = self.session_dir.join(file_name);
        let result = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await;
        match result {
            Ok(mut file) => {
                if let Err(err) = file.write_all(line.as_bytes()).await {
                    warn!(event = "telemetry.write_failed", path = %path.display(), error = %err);
                }
            }
            Err(err) => {
                warn!(event = "telemetry.open_failed", path = %path.display(), error = %err);
            }
        }
    }
}

impl EventSink for JsonlSink {
    fn write<'a>(&'a self, event: &'a Event) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let mut record = match serde_json::to_value(event) {
                Ok(value) => value,
                Err(_) => return,
            };
            if let Some(object) = record.as_object_mut() {
                let stamp = OffsetDateTime::now_utc()
                    .format(&time::format_description::well_known::Rfc3339)
                    .unwrap_or_default();
                object.insert("at".to_string(), serde_json::Value::String(stamp));
            }
            self.append(event.file_name(), format!("{record}\n")).await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Capture(Mutex<Vec<String>>);

    impl EventSink for Capture {
        fn write<'a>(
            &'a self,
            event: &'a Event,
        ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
            Box::pin(async move {
                if let Ok(line) = serde_json::to_string(event)
                    && let Ok(mut lines) = self.0.lock()
                {
                    lines.push(line);
                }
            })
        }
    }

    #[tokio::test]
    async fn hub_fans_out_to_sinks() {
        let hub = EventHub::new();
        let sink = Arc::new(Capture(Mutex::new(Vec::new())));
        hub.add_sink(sink.clone()).await;
        hub.emit(Event::ToolOutputCompressed {
            trace_id: "t".to_string(),
            candidates: 1,
            compressed: 1,
            saved_bytes: 10,
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let lines = sink.0.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("tool_output_compressed"));
    }

    #[test]
    fn events_route_to_their_files() {
        let event = Event::HistoryCompaction {
            fingerprint: "fp".to_string(),
            usage_pct: 90,
            scheduled: true,
            spliced_messages: 0,
            saved_bytes: 0,
        };
        assert_eq!(event.file_name(), "history_compaction.jsonl");
    }
}
