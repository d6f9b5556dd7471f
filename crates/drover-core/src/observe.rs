//! Read-only notifications for persistence/analytics collaborators.
//!
//! Observers are synchronous, infallible, and never awaited on: a slow
//! or broken collaborator cannot abort an in-progress turn. Anything
//! that needs real I/O should queue internally and do the work
//! elsewhere.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use drover_protocol::TokenUsage;

/// A completed-turn record handed to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub continuation: Option<String>,
    pub final_text: String,
    pub usage: TokenUsage,
    pub completed_at: DateTime<Utc>,
}

/// Receives read-only session notifications. All methods default to
/// no-ops so observers implement only what they care about.
pub trait SessionObserver: Send + Sync {
    /// A human-readable status line was appended.
    fn on_activity(&self, _line: &str) {}

    /// A token-usage snapshot arrived.
    fn on_usage(&self, _usage: &TokenUsage) {}

    /// A turn reached its end.
    fn on_turn_record(&self, _record: &TurnRecord) {}
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recording {
        lines: Mutex<Vec<String>>,
    }

    impl SessionObserver for Recording {
        fn on_activity(&self, line: &str) {
            self.lines.lock().unwrap().push(line.to_string());
        }
    }

    #[test]
    fn default_methods_are_no_ops() {
        struct Quiet;
        impl SessionObserver for Quiet {}
        let quiet = Quiet;
        quiet.on_activity("line");
        quiet.on_usage(&TokenUsage::default());
    }

    #[test]
    fn observers_see_activity_lines() {
        let observer = Recording::default();
        observer.on_activity("Calling computer…");
        assert_eq!(observer.lines.lock().unwrap().len(), 1);
    }

    #[test]
    fn turn_records_serialize_with_their_timestamp() {
        let record = TurnRecord {
            continuation: Some("cont_1".to_string()),
            final_text: "done".to_string(),
            usage: TokenUsage::new(10, 2),
            completed_at: Utc::now(),
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: TurnRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
