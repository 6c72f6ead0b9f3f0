//! Sinks for actions the knowledge base doesn't know about.

use std::sync::Mutex;

use async_trait::async_trait;
use indexmap::IndexSet;

/// Receives the actions a run couldn't find in the knowledge base.
///
/// Recording is best-effort: sinks swallow their own failures.
#[async_trait]
pub trait MissingActionSink: Send + Sync {
    async fn record(&self, actions: &[String]);
}

/// The key an action is recorded under: its `uses:` clause without `@<ref>`.
pub fn missing_key(action: &str) -> &str {
    action.split_once('@').map_or(action, |(path, _)| path)
}

/// Logs missing actions.
pub struct LoggingSink;

#[async_trait]
impl MissingActionSink for LoggingSink {
    async fn record(&self, actions: &[String]) {
        for action in actions {
            tracing::info!("no knowledge base entry for {}", missing_key(action));
        }
    }
}

/// Keeps missing actions in memory, deduplicated and in arrival order.
#[derive(Default)]
pub struct CollectingSink {
    recorded: Mutex<IndexSet<String>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded(&self) -> Vec<String> {
        match self.recorded.lock() {
            Ok(recorded) => recorded.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }
}

#[async_trait]
impl MissingActionSink for CollectingSink {
    async fn record(&self, actions: &[String]) {
        let mut recorded = match self.recorded.lock() {
            Ok(recorded) => recorded,
            Err(poisoned) => poisoned.into_inner(),
        };

        recorded.extend(actions.iter().map(|a| missing_key(a).to_string()));
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{CollectingSink, MissingActionSink};

    #[tokio::test]
    async fn test_collecting_sink_dedupes() {
        let sink = CollectingSink::new();
        sink.record(&["a/b@v1".into(), "c/d@main".into()]).await;
        sink.record(&["a/b@v2".into(), "e/f".into()]).await;

        assert_eq!(sink.recorded(), ["a/b", "c/d", "e/f"]);
    }
}
