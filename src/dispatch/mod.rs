//! The command dispatcher: canonicalization, envelope validation, routing to per-command
//! handlers, uniform error shaping, and journaling.

pub(crate) mod command;
pub mod journal;


use std::sync::{atomic::AtomicI64, Arc};

use parking_lot::Mutex;
use tracing::debug;

use crate::{
    bson::{Bson, Document},
    engine::{Engine, StoreRead, StoreWrite},
    error::Result,
    operation,
    session::{self, Session, SessionKey, SessionManager, StoreBinding},
    wire,
};

pub(crate) use command::Command;
pub use journal::{CommandJournal, JournalExport};

/// Limits advertised by the handshake and enforced by the wire layer.
pub(crate) const MAX_BSON_OBJECT_SIZE: i32 = 16 * 1024 * 1024;
pub(crate) const MAX_WRITE_BATCH_SIZE: i32 = 100_000;
pub(crate) const MAX_WIRE_VERSION: i32 = 17;
pub(crate) const MIN_WIRE_VERSION: i32 = 0;

/// Deployment facts the dispatcher advertises through `hello`: the listen address once bound,
/// and the replica set name in the replica-set operating profile.
#[derive(Clone, Debug, Default)]
pub struct DispatcherConfig {
    /// The `host:port` this engine is reachable at, when served over TCP.
    pub address: Option<String>,
    /// The replica set name, when operating in the replica-set profile.
    pub replica_set: Option<String>,
}

/// Routes command documents to handlers over a shared engine, session manager, and cursor
/// registry. Dispatch is synchronous and pure with respect to the store the command binds to
/// (global, or the session's transactional snapshot).
#[derive(Debug)]
pub struct Dispatcher {
    pub(crate) engine: Engine,
    pub(crate) sessions: SessionManager,
    pub(crate) cursors: crate::cursor::CursorRegistry,
    pub(crate) journal: CommandJournal,
    pub(crate) config: DispatcherConfig,
    pub(crate) connection_counter: AtomicI64,
}

impl Dispatcher {
    /// Creates a dispatcher over `engine` with default (standalone, in-process) configuration.
    pub fn new(engine: Engine) -> Self {
        Self::with_config(engine, DispatcherConfig::default())
    }

    /// Creates a dispatcher with explicit deployment facts.
    pub fn with_config(engine: Engine, config: DispatcherConfig) -> Self {
        Self {
            sessions: SessionManager::new(engine.clone()),
            engine,
            cursors: crate::cursor::CursorRegistry::default(),
            journal: CommandJournal::default(),
            config,
            connection_counter: AtomicI64::new(0),
        }
    }

    /// The journal of every dispatched command.
    pub fn journal(&self) -> &CommandJournal {
        &self.journal
    }

    /// The engine this dispatcher serves.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Dispatches one command document against database `db` and returns the response document.
    /// Failures are rendered into the uniform `{ok: 0.0, code, codeName, errmsg}` shape; this
    /// method never fails.
    pub fn dispatch(&self, db: &str, body: Document) -> Document {
        self.dispatch_with_request_id(wire::util::next_request_id(), db, body)
    }

    /// Dispatches with an explicit wire-level request id for journal correlation.
    pub(crate) fn dispatch_with_request_id(
        &self,
        request_id: i32,
        db: &str,
        body: Document,
    ) -> Document {
        let input = body.clone();
        let (correlation, result) = self.dispatch_inner(request_id, db, body);

        let (response, error) = match result {
            Ok(mut response) => {
                if !response.contains_key("ok") {
                    response.insert("ok", 1.0);
                }
                (response, None)
            }
            Err(error) => (error.to_response_document(), Some(error.message())),
        };

        debug!(
            command = correlation.command.as_str(),
            request_id,
            ok = error.is_none(),
            "dispatched command"
        );
        self.journal
            .append(correlation, input, response.clone(), error);
        response
    }

    fn dispatch_inner(
        &self,
        request_id: i32,
        db: &str,
        body: Document,
    ) -> (journal::Correlation, Result<Document>) {
        let command_name = body.keys().next().cloned().unwrap_or_default();
        let mut correlation = journal::Correlation {
            request_id,
            command: command_name,
            lsid: None,
            txn_number: None,
        };

        let cmd = match Command::parse(db.to_string(), body) {
            Ok(cmd) => cmd,
            Err(e) => return (correlation, Err(e)),
        };
        correlation.command = cmd.name.to_string();
        correlation.lsid = cmd.envelope.lsid.clone();
        correlation.txn_number = cmd.envelope.txn_number;

        (correlation, self.execute(&cmd))
    }

    fn execute(&self, cmd: &Command) -> Result<Document> {
        match cmd.name {
            "commitTransaction" | "abortTransaction" => return self.finish_transaction(cmd),
            _ => {}
        }

        let session_key = match &cmd.envelope.lsid {
            Some(lsid) => Some(SessionKey::from_lsid(lsid)?),
            None => None,
        };

        let binding = match (&cmd.envelope.lsid, cmd.envelope.txn_number) {
            (Some(lsid), Some(txn_number)) if cmd.envelope.autocommit == Some(false) => {
                let key = session_key.as_ref().expect("lsid implies session key");
                self.sessions.bind_transaction(
                    key,
                    lsid,
                    txn_number,
                    cmd.envelope.start_transaction,
                )?
            }
            (Some(lsid), Some(txn_number)) => {
                // A txnNumber without autocommit=false never matches an in-progress transaction.
                let key = session_key.as_ref().expect("lsid implies session key");
                self.sessions.bind_transaction(key, lsid, txn_number, false)?
            }
            (Some(lsid), None) => {
                let key = session_key.as_ref().expect("lsid implies session key");
                self.sessions.touch(key, lsid);
                StoreBinding::Global
            }
            _ => StoreBinding::Global,
        };

        let handler = operation::handler(cmd.name).ok_or_else(|| {
            crate::error::Error::internal(format!("no handler registered for '{}'", cmd.name))
        })?;

        match binding {
            StoreBinding::Global => {
                let mut ctx = ExecCtx {
                    store: ActiveStore::Global(&self.engine),
                    session: session_key,
                    in_txn: false,
                };
                handler(self, &mut ctx, cmd)
            }
            StoreBinding::Transaction(session) => {
                let mut ctx = ExecCtx {
                    store: ActiveStore::Transaction(&session),
                    session: session_key,
                    in_txn: true,
                };
                handler(self, &mut ctx, cmd)
            }
        }
    }

    fn finish_transaction(&self, cmd: &Command) -> Result<Document> {
        let envelope = &cmd.envelope;
        if envelope.start_transaction {
            return Err(crate::error::Error::no_such_transaction(
                format!("{} cannot carry startTransaction", cmd.name),
                false,
            ));
        }
        if envelope.autocommit != Some(false) {
            return Err(crate::error::Error::no_such_transaction(
                format!("{} requires 'autocommit' to be false", cmd.name),
                false,
            ));
        }
        let lsid = envelope.lsid.as_ref().ok_or_else(|| {
            crate::error::Error::no_such_transaction(
                format!("{} requires an 'lsid'", cmd.name),
                false,
            )
        })?;
        let txn_number = envelope.txn_number.ok_or_else(|| {
            crate::error::Error::no_such_transaction(
                format!("{} requires a 'txnNumber'", cmd.name),
                false,
            )
        })?;

        let key = SessionKey::from_lsid(lsid)?;
        let result = match cmd.name {
            "commitTransaction" => self.sessions.commit(&key, lsid, txn_number),
            _ => self.sessions.abort(&key, lsid, txn_number),
        };
        // Transaction teardown, successful or not, kills the cursors bound to the session.
        self.cursors.kill_for_session(&key);
        result.map(|()| Document::new())
    }

    /// Reaps idle cursors and sessions. Called periodically by the serving layer.
    pub fn reap_idle(&self) {
        self.cursors.reap_idle();
        let timeout =
            std::time::Duration::from_secs(60 * session::LOGICAL_SESSION_TIMEOUT_MINUTES as u64);
        for key in self.sessions.reap_idle(timeout) {
            self.cursors.kill_for_session(&key);
        }
    }
}

/// The store a command executes against: the shared global engine, or a session's transactional
/// snapshot.
pub(crate) enum ActiveStore<'a> {
    Global(&'a Engine),
    Transaction(&'a Arc<Mutex<Session>>),
}

impl ActiveStore<'_> {
    pub(crate) fn read<T>(&self, f: impl FnOnce(&dyn StoreRead) -> Result<T>) -> Result<T> {
        match self {
            ActiveStore::Global(engine) => engine.read(f),
            ActiveStore::Transaction(session) => {
                session::with_active_snapshot(session, |snapshot| snapshot.read(f))?
            }
        }
    }

    pub(crate) fn write<T>(&mut self, f: impl FnOnce(&mut dyn StoreWrite) -> Result<T>) -> Result<T> {
        match self {
            ActiveStore::Global(engine) => engine.write(f),
            ActiveStore::Transaction(session) => {
                session::with_active_snapshot(session, |snapshot| snapshot.write(f))?
            }
        }
    }
}

/// Per-command execution context handed to handlers: the bound store, the session key (for
/// cursor binding), and whether the command runs inside a transaction.
pub(crate) struct ExecCtx<'a> {
    pub(crate) store: ActiveStore<'a>,
    pub(crate) session: Option<SessionKey>,
    pub(crate) in_txn: bool,
}

impl ExecCtx<'_> {
    /// The session key cursors created by this command should be bound to: only cursors opened
    /// inside a transaction are session-bound.
    pub(crate) fn cursor_binding(&self) -> Option<SessionKey> {
        if self.in_txn {
            self.session.clone()
        } else {
            None
        }
    }
}

/// Builds the `{id, ns, firstBatch|nextBatch}` cursor envelope shared by `find`, `aggregate`,
/// `listIndexes`, `listCollections`, and `getMore`.
pub(crate) fn cursor_response(
    id: i64,
    ns: &crate::Namespace,
    batch_field: &str,
    batch: Vec<Document>,
) -> Document {
    let mut cursor = Document::new();
    cursor.insert("id", id);
    cursor.insert("ns", ns.to_string());
    cursor.insert(
        batch_field,
        Bson::Array(batch.into_iter().map(Bson::Document).collect()),
    );
    let mut response = Document::new();
    response.insert("cursor", cursor);
    response
}
