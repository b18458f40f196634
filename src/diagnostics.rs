//! Diagnostics over the command journal: deterministic repro dumps, invariant scans, and a
//! best-effort root-cause triage.

use std::collections::HashMap;

use crate::{
    bson::{doc, Bson, Document},
    dispatch::journal::{JournalEntry, JournalExport},
};

/// Serializes the journal as one relaxed-extended-JSON command document per line, in recorded
/// order. The dump can be re-dispatched line by line into a fresh engine to reproduce the
/// journaled state.
pub fn repro_dump(export: &JournalExport) -> String {
    let mut out = String::new();
    for entry in &export.entries {
        let line = Bson::Document(entry.input.clone()).into_relaxed_extjson();
        out.push_str(&line.to_string());
        out.push('\n');
    }
    out
}

/// One detected invariant violation, referencing the journal sequence it was observed at.
#[derive(Clone, Debug, PartialEq)]
pub struct Violation {
    /// The journal sequence of the offending entry.
    pub sequence: u64,
    /// A stable violation kind.
    pub kind: &'static str,
    /// Human-readable detail.
    pub detail: String,
}

impl Violation {
    fn to_document(&self) -> Document {
        doc! {
            "sequence": self.sequence as i64,
            "kind": self.kind,
            "detail": self.detail.clone(),
        }
    }
}

/// Scans journal entries for violations of the engine's session, cursor, and index invariants:
/// transactional fields without an `lsid`, per-session `txnNumber` regressions, cursor envelopes
/// whose `ns` is not a string, and `createIndexes` responses reporting an index-count
/// regression.
pub fn scan_invariants(export: &JournalExport) -> Vec<Violation> {
    let mut violations = Vec::new();
    let mut highest_txn: HashMap<String, i64> = HashMap::new();

    for entry in &export.entries {
        scan_entry(entry, &mut highest_txn, &mut violations);
    }
    violations
}

fn scan_entry(
    entry: &JournalEntry,
    highest_txn: &mut HashMap<String, i64>,
    violations: &mut Vec<Violation>,
) {
    let input = &entry.input;

    if entry.correlation.lsid.is_none()
        && (input.contains_key("txnNumber")
            || input.contains_key("autocommit")
            || input.contains_key("startTransaction"))
    {
        violations.push(Violation {
            sequence: entry.sequence,
            kind: "missing-lsid",
            detail: format!(
                "command '{}' carries transaction fields without an lsid",
                entry.correlation.command
            ),
        });
    }

    if let (Some(lsid), Some(txn_number)) = (&entry.correlation.lsid, entry.correlation.txn_number)
    {
        let key = Bson::Document(lsid.clone()).into_relaxed_extjson().to_string();
        let highest = highest_txn.entry(key).or_insert(i64::MIN);
        if txn_number < *highest {
            violations.push(Violation {
                sequence: entry.sequence,
                kind: "txn-number-regression",
                detail: format!(
                    "txnNumber {} is below the session's highest seen {}",
                    txn_number, highest
                ),
            });
        } else {
            *highest = txn_number;
        }
    }

    if let Some(Bson::Document(cursor)) = entry.output.get("cursor") {
        match cursor.get("ns") {
            Some(Bson::String(_)) => {}
            Some(other) => violations.push(Violation {
                sequence: entry.sequence,
                kind: "cursor-ns-not-string",
                detail: format!("cursor ns has type {}", crate::bson_util::type_name(other)),
            }),
            None => violations.push(Violation {
                sequence: entry.sequence,
                kind: "cursor-ns-not-string",
                detail: "cursor envelope has no ns".to_string(),
            }),
        }
    }

    if entry.correlation.command == "createIndexes" {
        let before = entry.output.get("numIndexesBefore").and_then(crate::bson_util::get_int);
        let after = entry.output.get("numIndexesAfter").and_then(crate::bson_util::get_int);
        if let (Some(before), Some(after)) = (before, after) {
            if after < before {
                violations.push(Violation {
                    sequence: entry.sequence,
                    kind: "index-count-regression",
                    detail: format!("numIndexesAfter {} < numIndexesBefore {}", after, before),
                });
            }
        }
    }
}

/// Renders the invariant scan as a structured report document.
pub fn invariant_report(export: &JournalExport) -> Document {
    let violations = scan_invariants(export);
    doc! {
        "entriesScanned": export.entries.len() as i64,
        "droppedCount": export.dropped_count as i64,
        "violations": violations
            .iter()
            .map(|v| Bson::Document(v.to_document()))
            .collect::<Vec<_>>(),
    }
}

/// Best-effort root-cause triage: points at the first failed entry (or the first invariant
/// violation when every command succeeded) and echoes its journal context.
pub fn triage(export: &JournalExport) -> Document {
    let first_failure = export
        .entries
        .iter()
        .find(|entry| entry.error.is_some());

    if let Some(entry) = first_failure {
        return doc! {
            "verdict": "command-failure",
            "sequence": entry.sequence as i64,
            "command": entry.correlation.command.clone(),
            "error": entry.error.clone().unwrap_or_default(),
            "input": entry.input.clone(),
        };
    }

    let violations = scan_invariants(export);
    match violations.first() {
        Some(violation) => doc! {
            "verdict": "invariant-violation",
            "sequence": violation.sequence as i64,
            "kind": violation.kind,
            "detail": violation.detail.clone(),
        },
        None => doc! { "verdict": "clean" },
    }
}
