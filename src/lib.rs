//! An in-process, wire-compatible MongoDB command engine for use as a test backend.
//!
//! Client drivers connect as if to a real server, issue binary wire commands, and receive
//! responses whose code names, error labels, and document shapes match the reference server for
//! a documented subset of commands: document CRUD, cursor-based iteration, a subset of the
//! aggregation pipeline, unique-indexed constraints, and single-node session/transaction
//! semantics. Engine state lives entirely in memory; nothing persists across shutdown.
//!
//! # In-process embedding
//!
//! ```rust
//! use jongodb::{bson::doc, Dispatcher, Engine};
//!
//! let dispatcher = Dispatcher::new(Engine::new());
//! let response = dispatcher.dispatch(
//!     "app",
//!     doc! { "insert": "users", "documents": [ { "_id": 1, "name": "alpha" } ] },
//! );
//! assert_eq!(response.get_f64("ok"), Ok(1.0));
//! assert_eq!(response.get_i64("n"), Ok(1));
//! ```
//!
//! # TCP serving
//!
//! [`Server::serve`] hosts the engine as a standalone process: it binds, prints
//! `JONGODB_URI=mongodb://host:port/<db>` on stdout once ready, and serves connections until
//! shutdown.

#![warn(missing_docs)]
#![warn(clippy::cast_possible_truncation)]

pub use ::bson;

mod bson_util;
mod collation;
mod cursor;
pub mod diagnostics;
mod dispatch;
mod engine;
pub mod error;
mod namespace;
mod operation;
mod server;
mod session;
mod wire;

pub use collation::Collation;
pub use dispatch::{journal, CommandJournal, Dispatcher, DispatcherConfig, JournalExport};
pub use engine::Engine;
pub use namespace::Namespace;
pub use server::{Server, ServerOptions};
pub use session::TransactionSnapshot;
