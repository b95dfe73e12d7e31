use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use time::OffsetDateTime;
use tracing::debug;

/// One completed summary per conversation fingerprint.
#[derive(Debug, Clone)]
pub struct SummaryRecord {
    pub fingerprint: String,
    pub summary_text: String,
    pub summary_tokens: u64,
    /// Largest message index covered by the summary.
    pub last_summarized_index: usize,
    pub generated_at: OffsetDateTime,
    /// Message count at summarization time; a shorter conversation later
    /// means the client reset, which invalidates the record.
    pub pre_compaction_len: usize,
}

#[derive(Debug, Default)]
struct Slot {
    record: Option<SummaryRecord>,
    in_flight: bool,
}

/// fingerprint → summary record, with single-flight job admission.
/// Installing the in-flight marker and installing a finished summary are two
/// distinct critical sections; nothing awaits while holding the lock.
pub struct CompactionCache {
    slots: Mutex<HashMap<String, Slot>>,
    ttl: Duration,
}

impl CompactionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Current summary for the fingerprint, dropping expired and reset
    /// records on the way out.
    pub fn lookup(&self, fingerprint: &str, current_len: usize) -> Option<SummaryRecord> {
        let mut slots = self.slots.lock().ok()?;
        let slot = slots.get_mut(fingerprint)?;
        let record = slot.record.as_ref()?;
        let expired = (OffsetDateTime::now_utc() - record.generated_at).as_seconds_f64()
            > self.ttl.as_secs_f64();
        let reset = current_len < record.pre_compaction_len;
        if expired || reset {
            debug!(
                event = "compaction.record_dropped",
                fingerprint = %fingerprint,
                expired,
                reset,
            );
            slot.record = None;
            return None;
        }
        Some(record.clone())
    }

    /// True when a summary already covers at least `index` messages.
    pub fn covers(&self, fingerprint: &str, index: usize) -> bool {
        self.slots
            .lock()
            .ok()
            .and_then(|slots| {
                slots
                    .get(fingerprint)
                    .and_then(|slot| slot.record.as_ref().map(|r| r.last_summarized_index >= index))
            })
            .unwrap_or(false)
    }

    /// Atomically claims the fingerprint's in-flight slot. Exactly one
    /// caller wins until the job completes or aborts.
    pub fn try_begin(&self, fingerprint: &str) -> bool {
        let Ok(mut slots) = self.slots.lock() else {
            return false;
        };
        let slot = slots.entry(fingerprint.to_string()).or_default();
        if slot.in_flight {
            return false;
        }
        slot.in_flight = true;
        true
    }

    /// Installs a finished summary and releases the in-flight slot. The
    /// cache is monotonic: a record covering fewer messages than the one
    /// already installed is discarded.
    pub fn install(&self, record: SummaryRecord) {
        let Ok(mut slots) = self.slots.lock() else {
            return;
        };
        let slot = slots.entry(record.fingerprint.clone()).or_default();
        slot.in_flight = false;
        let replace = slot
            .record
            .as_ref()
            .map(|existing| record.last_summarized_index >= existing.last_summarized_index)
            .unwrap_or(true);
        if replace {
            slot.record = Some(record);
        }
    }

    /// Releases the in-flight slot without installing anything; the next
    /// request over the threshold retries.
    pub fn abort(&self, fingerprint: &str) {
        if let Ok(mut slots) = self.slots.lock()
            && let Some(slot) = slots.get_mut(fingerprint)
        {
            slot.in_flight = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(fingerprint: &str, index: usize) -> SummaryRecord {
        SummaryRecord {
            fingerprint: fingerprint.to_string(),
            summary_text: "summary".to_string(),
            summary_tokens: 100,
            last_summarized_index: index,
            generated_at: OffsetDateTime::now_utc(),
            pre_compaction_len: index + 3,
        }
    }

    #[test]
    fn single_flight_admits_exactly_one() {
        let cache = CompactionCache::new(Duration::from_secs(3600));
        assert!(cache.try_begin("fp"));
        assert!(!cache.try_begin("fp"));
        cache.abort("fp");
        assert!(cache.try_begin("fp"));
    }

    #[test]
    fn install_releases_and_serves() {
        let cache = CompactionCache::new(Duration::from_secs(3600));
        assert!(cache.try_begin("fp"));
        cache.install(record("fp", 5));
        let found = cache.lookup("fp", 10).unwrap();
        assert_eq!(found.last_summarized_index, 5);
        assert!(cache.try_begin("fp"));
    }

    #[test]
    fn cache_is_monotonic() {
        let cache = CompactionCache::new(Duration::from_secs(3600));
        cache.install(record("fp", 7));
        cache.install(record("fp", 4));
        assert_eq!(cache.lookup("fp", 20).unwrap().last_summarized_index, 7);
        cache.install(record("fp", 9));
        assert_eq!(cache.lookup("fp", 20).unwrap().last_summarized_index, 9);
    }

    #[test]
    fn conversation_reset_invalidates() {
        let cache = CompactionCache::new(Duration::from_secs(3600));
        cache.install(record("fp", 5));
        // 5 + 3 messages existed at compaction time; 4 now means a reset.
        assert!(cache.lookup("fp", 4).is_none());
        assert!(cache.lookup("fp", 4).is_none());
    }

    #[test]
    fn expired_records_are_dropped() {
        let cache = CompactionCache::new(Duration::ZERO);
        cache.install(record("fp", 5));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.lookup("fp", 10).is_none());
    }

    #[test]
    fn covers_checks_installed_index() {
        let cache = CompactionCache::new(Duration::from_secs(3600));
        assert!(!cache.covers("fp", 3));
        cache.install(record("fp", 5));
        assert!(cache.covers("fp", 3));
        assert!(!cache.covers("fp", 6));
    }
}
