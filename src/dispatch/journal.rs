//! The structured command journal: a bounded ring buffer recording every dispatched command with
//! its correlation context, input, output, and error string.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::Serialize;

use crate::bson::Document;

/// The default number of journal entries retained before the oldest are dropped.
pub(crate) const DEFAULT_JOURNAL_CAPACITY: usize = 1024;

/// Correlation context for one dispatched command.
#[derive(Clone, Debug, Serialize)]
pub struct Correlation {
    /// The wire-level request id the command arrived under.
    #[serde(rename = "requestId")]
    pub request_id: i32,
    /// The canonical command name.
    pub command: String,
    /// The session id document, when the command carried one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lsid: Option<Document>,
    /// The transaction number, when the command carried one.
    #[serde(rename = "txnNumber", skip_serializing_if = "Option::is_none")]
    pub txn_number: Option<i64>,
}

/// One journal entry. `sequence` increases monotonically across the life of the engine, even as
/// old entries are dropped.
#[derive(Clone, Debug, Serialize)]
pub struct JournalEntry {
    /// Monotonically increasing sequence number.
    pub sequence: u64,
    /// Correlation context.
    pub correlation: Correlation,
    /// The command document as dispatched.
    pub input: Document,
    /// The response document as returned.
    pub output: Document,
    /// The error string for failed commands.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// An exported view of the journal: the retained entries in order, plus how many older entries
/// the ring has dropped.
#[derive(Clone, Debug, Serialize)]
pub struct JournalExport {
    /// The retained entries, oldest first.
    pub entries: Vec<JournalEntry>,
    /// How many entries have been dropped due to capacity.
    #[serde(rename = "droppedCount")]
    pub dropped_count: u64,
}

#[derive(Debug)]
struct JournalInner {
    entries: VecDeque<JournalEntry>,
    next_sequence: u64,
    dropped: u64,
}

/// The ring-buffered command journal.
#[derive(Debug)]
pub struct CommandJournal {
    inner: Mutex<JournalInner>,
    capacity: usize,
}

impl Default for CommandJournal {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_JOURNAL_CAPACITY)
    }
}

impl CommandJournal {
    /// Creates a journal retaining at most `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(JournalInner {
                entries: VecDeque::with_capacity(capacity.min(1024)),
                next_sequence: 0,
                dropped: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    /// Appends one entry, dropping the oldest when the ring is full.
    pub(crate) fn append(
        &self,
        correlation: Correlation,
        input: Document,
        output: Document,
        error: Option<String>,
    ) {
        let mut inner = self.inner.lock();
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;

        if inner.entries.len() == self.capacity {
            inner.entries.pop_front();
            inner.dropped += 1;
        }
        inner.entries.push_back(JournalEntry {
            sequence,
            correlation,
            input,
            output,
            error,
        });
    }

    /// Exports the retained entries in recorded order.
    pub fn export(&self) -> JournalExport {
        let inner = self.inner.lock();
        JournalExport {
            entries: inner.entries.iter().cloned().collect(),
            dropped_count: inner.dropped,
        }
    }
}
