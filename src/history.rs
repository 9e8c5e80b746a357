//! On-disk message history.
//!
//! Messages are kept as a JSON array in a single file, loaded at startup and
//! rewritten on every save. A corrupt or missing file means starting with an
//! empty history, never a crash.

use messenger_types::{Message, MessengerError};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

pub struct MessageHistory {
    path: PathBuf,
    messages: Mutex<Vec<Message>>,
}

impl MessageHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let messages = match Self::load(&path) {
            Ok(messages) => messages,
            Err(e) => {
                warn!("could not load history from {}: {}", path.display(), e);
                Vec::new()
            }
        };
        Self {
            path,
            messages: Mutex::new(messages),
        }
    }

    fn load(path: &Path) -> Result<Vec<Message>, MessengerError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| MessengerError::HistoryError(e.to_string()))?;
        serde_json::from_str(&contents).map_err(|e| MessengerError::HistoryError(e.to_string()))
    }

    /// Append a message and persist the file.
    pub fn save(&self, message: &Message) -> Result<(), MessengerError> {
        let snapshot = {
            let mut messages = self.messages.lock().expect("history lock poisoned");
            messages.push(message.clone());
            messages.clone()
        };

        let json = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| MessengerError::HistoryError(e.to_string()))?;
        std::fs::write(&self.path, json).map_err(|e| MessengerError::HistoryError(e.to_string()))
    }

    /// The most recent `limit` messages, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<Message> {
        let messages = self.messages.lock().expect("history lock poisoned");
        let start = messages.len().saturating_sub(limit);
        messages[start..].to_vec()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().expect("history lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use messenger_types::Message;

    #[test]
    fn test_history_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");

        let history = MessageHistory::new(&path);
        assert!(history.is_empty());
        history.save(&Message::plain("alice", "one")).unwrap();
        history.save(&Message::plain("bob", "two")).unwrap();

        let reloaded = MessageHistory::new(&path);
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.recent(10)[0].content(), Some("one"));
        assert_eq!(reloaded.recent(10)[1].content(), Some("two"));
    }

    #[test]
    fn test_recent_honours_the_limit() {
        let dir = tempfile::tempdir().unwrap();
        let history = MessageHistory::new(dir.path().join("history.json"));
        for i in 0..5 {
            history.save(&Message::plain("alice", format!("m{}", i))).unwrap();
        }

        let recent = history.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content(), Some("m3"));
        assert_eq!(recent[1].content(), Some("m4"));
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(&path, "this is not json").unwrap();

        let history = MessageHistory::new(&path);
        assert!(history.is_empty());
    }
}
