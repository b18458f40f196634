//! Server-side cursors: pagination state for `find`/`aggregate` result sequences, advanced by
//! `getMore` and terminated by exhaustion, `killCursors`, or owner-session teardown.

#[cfg(test)]
mod test;

use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use rand::{rngs::SmallRng, Rng, SeedableRng};

use crate::{
    bson::Document,
    error::{Error, Result},
    session::SessionKey,
    Namespace,
};

/// The default number of documents in a first batch when the request does not specify
/// `cursor.batchSize`.
pub(crate) const DEFAULT_BATCH_SIZE: usize = 101;

/// The default cap on live cursors per engine. Past it, the oldest idle cursor is reaped.
const DEFAULT_MAX_CURSORS: usize = 4096;

/// How long a cursor may sit idle before it is eligible for reaping.
const IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// One registered cursor: the remaining (not yet returned) documents plus bookkeeping.
#[derive(Debug)]
struct ServerCursor {
    ns: Namespace,
    remaining: VecDeque<Document>,
    session: Option<SessionKey>,
    last_used: Instant,
}

/// The outcome of a `killCursors` command, mirroring its four response arrays.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct KillOutcome {
    pub(crate) killed: Vec<i64>,
    pub(crate) not_found: Vec<i64>,
    pub(crate) alive: Vec<i64>,
}

/// One advanced batch: the documents plus the id to report (`0` when exhausted).
#[derive(Debug)]
pub(crate) struct CursorBatch {
    pub(crate) id: i64,
    pub(crate) ns: Namespace,
    pub(crate) batch: Vec<Document>,
}

#[derive(Debug)]
struct RegistryInner {
    cursors: HashMap<i64, ServerCursor>,
    rng: SmallRng,
}

/// The registry of live cursors. Ids are nonzero, unique among live cursors, and drawn from a
/// process-local RNG.
#[derive(Debug)]
pub(crate) struct CursorRegistry {
    inner: Mutex<RegistryInner>,
    max_cursors: usize,
}

impl Default for CursorRegistry {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAX_CURSORS)
    }
}

impl CursorRegistry {
    pub(crate) fn with_capacity(max_cursors: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                cursors: HashMap::new(),
                rng: SmallRng::from_rng(&mut rand::rng()),
            }),
            max_cursors,
        }
    }

    /// Splits `results` into a first batch and, when documents remain, a registered cursor.
    /// Returns the batch and the cursor id (`0` when the result set fit in one batch).
    pub(crate) fn create(
        &self,
        ns: Namespace,
        mut results: Vec<Document>,
        batch_size: Option<usize>,
        session: Option<SessionKey>,
    ) -> (Vec<Document>, i64) {
        let batch_size = batch_size.unwrap_or(DEFAULT_BATCH_SIZE);
        let remaining = if batch_size >= results.len() {
            Vec::new()
        } else {
            results.split_off(batch_size)
        };

        if remaining.is_empty() {
            return (results, 0);
        }

        let mut inner = self.inner.lock();
        if inner.cursors.len() >= self.max_cursors {
            reap_oldest(&mut inner.cursors);
        }

        let id = loop {
            let candidate: i64 = inner.rng.random();
            if candidate != 0 && !inner.cursors.contains_key(&candidate) {
                break candidate;
            }
        };
        inner.cursors.insert(
            id,
            ServerCursor {
                ns,
                remaining: remaining.into(),
                session,
                last_used: Instant::now(),
            },
        );
        (results, id)
    }

    /// Advances a cursor. Exhaustion removes the entry and reports id `0`. Unknown ids, and
    /// session-bound cursors accessed from a different session, fail with `CursorNotFound`.
    pub(crate) fn get_more(
        &self,
        id: i64,
        batch_size: Option<usize>,
        session: Option<&SessionKey>,
    ) -> Result<CursorBatch> {
        let mut inner = self.inner.lock();
        let cursor = inner
            .cursors
            .get_mut(&id)
            .ok_or_else(|| Error::cursor_not_found(id))?;
        if cursor.session.is_some() && cursor.session.as_ref() != session {
            return Err(Error::cursor_not_found(id));
        }

        cursor.last_used = Instant::now();
        let take = batch_size.unwrap_or(usize::MAX).max(1);
        let mut batch = Vec::new();
        while batch.len() < take {
            match cursor.remaining.pop_front() {
                Some(doc) => batch.push(doc),
                None => break,
            }
        }

        let ns = cursor.ns.clone();
        if cursor.remaining.is_empty() {
            inner.cursors.remove(&id);
            Ok(CursorBatch { id: 0, ns, batch })
        } else {
            Ok(CursorBatch { id, ns, batch })
        }
    }

    /// Kills the given cursors, reporting which were killed and which were unknown.
    pub(crate) fn kill(&self, ids: &[i64]) -> KillOutcome {
        let mut inner = self.inner.lock();
        let mut outcome = KillOutcome::default();
        for &id in ids {
            if inner.cursors.remove(&id).is_some() {
                outcome.killed.push(id);
            } else {
                outcome.not_found.push(id);
            }
        }
        outcome
    }

    /// Kills every cursor bound to `session`. Used on transaction and session teardown.
    pub(crate) fn kill_for_session(&self, session: &SessionKey) {
        let mut inner = self.inner.lock();
        inner
            .cursors
            .retain(|_, cursor| cursor.session.as_ref() != Some(session));
    }

    /// Removes cursors idle past their budget. Returns how many were reaped.
    pub(crate) fn reap_idle(&self) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.cursors.len();
        let now = Instant::now();
        inner
            .cursors
            .retain(|_, cursor| now.duration_since(cursor.last_used) < IDLE_TIMEOUT);
        before - inner.cursors.len()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().cursors.len()
    }
}

fn reap_oldest(cursors: &mut HashMap<i64, ServerCursor>) {
    if let Some((&oldest, _)) = cursors
        .iter()
        .min_by_key(|(_, cursor)| cursor.last_used)
    {
        cursors.remove(&oldest);
    }
}
