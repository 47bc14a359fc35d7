use super::protocol::LogEntry;
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use tokio::sync::broadcast;

pub const DEFAULT_MAX_LINES: usize = 1000;
const LIVE_CHANNEL_CAPACITY: usize = 1024;

/// Per-service ring buffer for captured stdout/stderr lines.
///
/// Every pushed line is also fanned out on a broadcast channel for live
/// viewers. Viewers that fall behind skip lines instead of holding memory.
pub struct LogBuffer {
    max_lines: usize,
    logs: RwLock<HashMap<String, VecDeque<LogEntry>>>,
    live: broadcast::Sender<LogEntry>,
}

impl LogBuffer {
    pub fn new(max_lines: usize) -> Self {
        let (live, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        Self {
            max_lines: max_lines.max(1),
            logs: RwLock::new(HashMap::new()),
            live,
        }
    }

    /// Append a line for its service, trimming oldest if over capacity.
    pub fn push(&self, entry: LogEntry) {
        {
            let mut logs = self.logs.write().expect("LogBuffer lock poisoned");
            let entries = logs.entry(entry.service.clone()).or_default();
            entries.push_back(entry.clone());
            while entries.len() > self.max_lines {
                entries.pop_front();
            }
        }
        // No receivers is fine.
        let _ = self.live.send(entry);
    }

    /// Return the last `n` lines for a service (or all if `n` exceeds stored count).
    pub fn tail(&self, service: &str, n: usize) -> Vec<LogEntry> {
        let logs = self.logs.read().expect("LogBuffer lock poisoned");
        let Some(entries) = logs.get(service) else {
            return Vec::new();
        };
        let start = entries.len().saturating_sub(n);
        entries.iter().skip(start).cloned().collect()
    }

    /// Live feed of every line pushed from now on, across all services.
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.live.subscribe()
    }

    /// Remove all logs for a service.
    pub fn clear(&self, service: &str) {
        let mut logs = self.logs.write().expect("LogBuffer lock poisoned");
        logs.remove(service);
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::protocol::StreamKind;

    fn line(service: &str, text: String) -> LogEntry {
        LogEntry::new(service, StreamKind::Stdout, text)
    }

    fn texts(entries: Vec<LogEntry>) -> Vec<String> {
        entries.into_iter().map(|e| e.text).collect()
    }

    #[test]
    fn tail_returns_last_n_lines() {
        let buf = LogBuffer::new(100);
        for i in 0..10 {
            buf.push(line("svc", format!("line {i}")));
        }
        assert_eq!(texts(buf.tail("svc", 3)), vec!["line 7", "line 8", "line 9"]);
    }

    #[test]
    fn tail_unknown_service_returns_empty() {
        let buf = LogBuffer::default();
        assert!(buf.tail("unknown", 10).is_empty());
    }

    #[test]
    fn ring_buffer_evicts_oldest() {
        let buf = LogBuffer::new(5);
        for i in 0..10 {
            buf.push(line("svc", format!("line {i}")));
        }
        assert_eq!(
            texts(buf.tail("svc", 100)),
            vec!["line 5", "line 6", "line 7", "line 8", "line 9"]
        );
    }

    #[test]
    fn services_are_kept_apart() {
        let buf = LogBuffer::default();
        buf.push(line("a", "from a".into()));
        buf.push(line("b", "from b".into()));
        assert_eq!(texts(buf.tail("a", 10)), vec!["from a"]);
        assert_eq!(texts(buf.tail("b", 10)), vec!["from b"]);
    }

    #[test]
    fn clear_removes_service_logs() {
        let buf = LogBuffer::default();
        buf.push(line("svc", "hello".into()));
        buf.clear("svc");
        assert!(buf.tail("svc", 10).is_empty());
    }

    #[tokio::test]
    async fn subscribers_receive_new_lines() {
        let buf = LogBuffer::default();
        let mut rx = buf.subscribe();
        buf.push(line("svc", "live".into()));
        let entry = rx.recv().await.unwrap();
        assert_eq!(entry.text, "live");
        assert_eq!(entry.service, "svc");
    }
}
