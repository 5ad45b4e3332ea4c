//! Append-only record of what happened during a session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

const LIVE_ENTRY_CAPACITY: usize = 64;

/// Who a transcript entry is attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    System,
    Agent,
    /// A remote participant, by identity.
    Participant(String),
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sender::System => f.write_str("System"),
            Sender::Agent => f.write_str("Agent"),
            Sender::Participant(identity) => f.write_str(identity),
        }
    }
}

/// A single, immutable transcript line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub sender: Sender,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// What live subscribers receive.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptUpdate {
    Appended(TranscriptEntry),
    /// The log was emptied; views built from earlier updates are stale.
    Cleared,
}

/// Ordered, oldest-first transcript shared between the session manager,
/// the media controller and the data relay.
///
/// Cloning yields another handle onto the same log.
#[derive(Clone)]
pub struct TranscriptLog {
    entries: Arc<Mutex<Vec<TranscriptEntry>>>,
    live: broadcast::Sender<TranscriptUpdate>,
}

impl Default for TranscriptLog {
    fn default() -> Self {
        Self::new()
    }
}

impl TranscriptLog {
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(LIVE_ENTRY_CAPACITY);
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            live,
        }
    }

    /// Appends an entry stamped with the current time and returns it.
    pub fn append(&self, sender: Sender, text: impl Into<String>) -> TranscriptEntry {
        let entry = TranscriptEntry {
            sender,
            text: text.into(),
            timestamp: Utc::now(),
        };
        self.lock().push(entry.clone());
        // Nobody listening is fine; the log itself is the source of truth.
        let _ = self.live.send(TranscriptUpdate::Appended(entry.clone()));
        entry
    }

    /// A copy of every entry, oldest first.
    pub fn snapshot(&self) -> Vec<TranscriptEntry> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Receives every append and clear after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<TranscriptUpdate> {
        self.live.subscribe()
    }

    /// Drops the whole log. Only the session manager does this, between sessions.
    pub(crate) fn clear(&self) {
        let mut entries = self.lock();
        if entries.is_empty() {
            return;
        }
        entries.clear();
        let _ = self.live.send(TranscriptUpdate::Cleared);
    }

    fn lock(&self) -> MutexGuard<'_, Vec<TranscriptEntry>> {
        // A panic while holding the lock cannot leave a Vec half-pushed.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
