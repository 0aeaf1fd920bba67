//! Error Sink
//!
//! Append-only collection point threaded by reference through an expansion
//! pass. A failure appended here never stops sibling claims, replicas or
//! device sets from being processed.

use parking_lot::Mutex;
use std::fmt::Display;

/// Append-only list of human-readable error messages
#[derive(Debug, Default)]
pub struct ErrorSink {
    messages: Mutex<Vec<String>>,
}

impl ErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a preformatted message
    pub fn append(&self, message: impl Into<String>) {
        self.messages.lock().push(message.into());
    }

    /// Append a failure of `operation` on a device set
    pub fn record(&self, device_set: &str, operation: &str, cause: &dyn Display) {
        self.append(format_message(device_set, operation, cause));
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    /// Copy of the messages recorded so far
    pub fn snapshot(&self) -> Vec<String> {
        self.messages.lock().clone()
    }

    /// Messages recorded against one device set
    pub fn messages_for(&self, device_set: &str) -> Vec<String> {
        let prefix = message_prefix(device_set);
        self.messages
            .lock()
            .iter()
            .filter(|m| m.starts_with(&prefix))
            .cloned()
            .collect()
    }

    pub fn into_messages(self) -> Vec<String> {
        self.messages.into_inner()
    }
}

fn message_prefix(device_set: &str) -> String {
    format!("device set \"{}\": ", device_set)
}

/// Format a per device set failure as `device set "<name>": <operation>: <cause>`
pub fn format_message(device_set: &str, operation: &str, cause: &dyn Display) -> String {
    format!("{}{}: {}", message_prefix(device_set), operation, cause)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_record_format() {
        let sink = ErrorSink::new();
        sink.record("set1", "create claim \"set1-data-0-\"", &"quota exceeded");
        assert_eq!(
            sink.snapshot(),
            vec!["device set \"set1\": create claim \"set1-data-0-\": quota exceeded"]
        );
    }

    #[test]
    fn test_messages_for_filters_by_device_set() {
        let sink = ErrorSink::new();
        sink.record("set1", "validate", &"count is negative");
        sink.record("set10", "validate", &"no claim templates");
        sink.append("unattributed");
        assert_eq!(sink.messages_for("set1").len(), 1);
        assert_eq!(sink.messages_for("set10").len(), 1);
        assert_eq!(sink.len(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_appends_are_all_kept() {
        let sink = Arc::new(ErrorSink::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let sink = sink.clone();
            handles.push(tokio::spawn(async move {
                sink.record(&format!("set{}", i), "create claim", &"boom");
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(sink.len(), 16);
    }
}
