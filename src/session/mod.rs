//! Logical sessions and the per-session transaction state machine.

mod snapshot;

#[cfg(test)]
mod test;

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::{
    bson::Document,
    engine::Engine,
    error::{Error, Result},
};

pub use snapshot::TransactionSnapshot;

/// How long an already-committed transaction keeps answering `commitTransaction` retries with an
/// idempotent `ok`. Replays after the window fail with `NoSuchTransaction`.
pub(crate) const COMMIT_REPLAY_GRACE: Duration = Duration::from_secs(10);

/// The advertised logical session timeout.
pub(crate) const LOGICAL_SESSION_TIMEOUT_MINUTES: i32 = 30;

/// A session identity: the `lsid` document in its canonical serialized form. Used as a lookup
/// key; the registry does not own back-references to cursors (the cursor registry stores these
/// keys instead).
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub(crate) struct SessionKey(Vec<u8>);

impl SessionKey {
    pub(crate) fn from_lsid(lsid: &Document) -> Result<Self> {
        let bytes = crate::bson::to_vec(lsid)
            .map_err(|e| Error::type_mismatch(format!("invalid lsid document: {}", e)))?;
        Ok(Self(bytes))
    }
}

/// The transaction state of one session. At most one transaction is non-terminal at a time.
#[derive(Debug)]
enum TransactionSlot {
    None,
    Active {
        number: i64,
        snapshot: TransactionSnapshot,
    },
    Finished {
        number: i64,
        committed: bool,
        at: Instant,
    },
}

#[derive(Debug)]
pub(crate) struct Session {
    lsid: Document,
    highest_txn_number: i64,
    slot: TransactionSlot,
    last_use: Instant,
}

impl Session {
    fn new(lsid: Document) -> Self {
        Self {
            lsid,
            highest_txn_number: -1,
            slot: TransactionSlot::None,
            last_use: Instant::now(),
        }
    }

    #[allow(dead_code)]
    pub(crate) fn lsid(&self) -> &Document {
        &self.lsid
    }
}

/// Owns every session and drives the per-session transaction state machine over the shared
/// engine.
#[derive(Debug)]
pub(crate) struct SessionManager {
    engine: Engine,
    sessions: Mutex<HashMap<SessionKey, Arc<Mutex<Session>>>>,
}

/// How a command should be executed with respect to transactions, as resolved by the session
/// manager.
#[derive(Debug)]
pub(crate) enum StoreBinding {
    /// Run against the shared global store.
    Global,
    /// Run against the session's active transaction snapshot.
    Transaction(Arc<Mutex<Session>>),
}

impl SessionManager {
    pub(crate) fn new(engine: Engine) -> Self {
        Self {
            engine,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn session(&self, key: &SessionKey, lsid: &Document) -> Arc<Mutex<Session>> {
        let mut sessions = self.sessions.lock();
        sessions
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Session::new(lsid.clone()))))
            .clone()
    }

    /// Resolves the store for a non-terminal command carrying `txnNumber`, starting a new
    /// transaction when `start_transaction` is set.
    pub(crate) fn bind_transaction(
        &self,
        key: &SessionKey,
        lsid: &Document,
        txn_number: i64,
        start_transaction: bool,
    ) -> Result<StoreBinding> {
        let session = self.session(key, lsid);
        {
            let mut session = session.lock();
            session.last_use = Instant::now();

            if start_transaction {
                if let TransactionSlot::Active { number, .. } = session.slot {
                    return Err(Error::bad_value(format!(
                        "transaction {} is already in progress on this session",
                        number
                    )));
                }
                if txn_number <= session.highest_txn_number {
                    return Err(Error::bad_value(format!(
                        "transaction number {} is not greater than the last seen transaction \
                         number {} in this session",
                        txn_number, session.highest_txn_number
                    )));
                }
                session.highest_txn_number = txn_number;
                session.slot = TransactionSlot::Active {
                    number: txn_number,
                    snapshot: self.engine.snapshot_for_transaction(),
                };
            } else {
                match &session.slot {
                    TransactionSlot::Active { number, .. } if *number == txn_number => {}
                    _ => {
                        return Err(Error::no_such_transaction(
                            format!(
                                "given transaction number {} does not match any in-progress \
                                 transactions",
                                txn_number
                            ),
                            true,
                        ))
                    }
                }
            }
        }
        Ok(StoreBinding::Transaction(session))
    }

    /// Tracks a non-transactional command that carries an `lsid`.
    pub(crate) fn touch(&self, key: &SessionKey, lsid: &Document) {
        let session = self.session(key, lsid);
        session.lock().last_use = Instant::now();
    }

    /// Commits the transaction `txn_number` of the session. Replays inside the grace window are
    /// idempotent; commit-time conflicts abort the transaction.
    pub(crate) fn commit(&self, key: &SessionKey, lsid: &Document, txn_number: i64) -> Result<()> {
        let session = self.session(key, lsid);
        let mut session = session.lock();
        session.last_use = Instant::now();

        match std::mem::replace(&mut session.slot, TransactionSlot::None) {
            TransactionSlot::Active { number, snapshot } if number == txn_number => {
                match self.engine.publish_transaction_snapshot(snapshot) {
                    Ok(()) => {
                        session.slot = TransactionSlot::Finished {
                            number,
                            committed: true,
                            at: Instant::now(),
                        };
                        Ok(())
                    }
                    Err(conflict) => {
                        session.slot = TransactionSlot::Finished {
                            number,
                            committed: false,
                            at: Instant::now(),
                        };
                        Err(conflict)
                    }
                }
            }
            active @ TransactionSlot::Active { .. } => {
                session.slot = active;
                Err(Error::no_such_transaction(
                    format!(
                        "given transaction number {} does not match any in-progress transactions",
                        txn_number
                    ),
                    false,
                ))
            }
            finished @ TransactionSlot::Finished { .. } => {
                let (number, committed, at) = match &finished {
                    TransactionSlot::Finished {
                        number,
                        committed,
                        at,
                    } => (*number, *committed, *at),
                    _ => unreachable!(),
                };
                session.slot = finished;
                if number == txn_number && committed && at.elapsed() < COMMIT_REPLAY_GRACE {
                    // Idempotent replay inside the grace window.
                    Ok(())
                } else if number == txn_number && committed {
                    Err(Error::no_such_transaction(
                        format!("transaction {} is no longer in progress", txn_number),
                        false,
                    ))
                } else {
                    Err(Error::no_such_transaction(
                        format!("transaction {} has been aborted", txn_number),
                        false,
                    ))
                }
            }
            TransactionSlot::None => Err(Error::no_such_transaction(
                "no transaction in progress on this session",
                false,
            )),
        }
    }

    /// Aborts the transaction `txn_number` of the session, discarding its snapshot.
    pub(crate) fn abort(&self, key: &SessionKey, lsid: &Document, txn_number: i64) -> Result<()> {
        let session = self.session(key, lsid);
        let mut session = session.lock();
        session.last_use = Instant::now();

        match std::mem::replace(&mut session.slot, TransactionSlot::None) {
            TransactionSlot::Active { number, .. } if number == txn_number => {
                session.slot = TransactionSlot::Finished {
                    number,
                    committed: false,
                    at: Instant::now(),
                };
                Ok(())
            }
            other => {
                session.slot = other;
                Err(Error::no_such_transaction(
                    format!(
                        "given transaction number {} does not match any in-progress transactions",
                        txn_number
                    ),
                    false,
                ))
            }
        }
    }

    /// Drops sessions idle past `timeout`, returning their keys so the caller can kill any
    /// cursors bound to them.
    pub(crate) fn reap_idle(&self, timeout: Duration) -> Vec<SessionKey> {
        let mut sessions = self.sessions.lock();
        let now = Instant::now();
        let mut reaped = Vec::new();
        sessions.retain(|key, session| {
            let keep = match session.try_lock() {
                Some(session) => now.duration_since(session.last_use) < timeout,
                // A locked session is in use right now.
                None => true,
            };
            if !keep {
                reaped.push(key.clone());
            }
            keep
        });
        reaped
    }
}

/// Gives handler code access to a session's active transaction snapshot.
pub(crate) fn with_active_snapshot<T>(
    session: &Arc<Mutex<Session>>,
    f: impl FnOnce(&mut TransactionSnapshot) -> T,
) -> Result<T> {
    let mut session = session.lock();
    match &mut session.slot {
        TransactionSlot::Active { snapshot, .. } => Ok(f(snapshot)),
        _ => Err(Error::no_such_transaction(
            "no transaction in progress on this session",
            true,
        )),
    }
}
