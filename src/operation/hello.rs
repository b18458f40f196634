use std::sync::atomic::Ordering;

use crate::{
    bson::{doc, DateTime, Document},
    dispatch::{
        Command, Dispatcher, ExecCtx, MAX_BSON_OBJECT_SIZE, MAX_WIRE_VERSION, MAX_WRITE_BATCH_SIZE,
        MIN_WIRE_VERSION,
    },
    error::Result,
    session::LOGICAL_SESSION_TIMEOUT_MINUTES,
    wire::MAX_MESSAGE_SIZE_BYTES,
};

/// The legacy name for the `hello` command, deprecated in 5.0 but still sent by older drivers
/// during the handshake.
pub(crate) const LEGACY_HELLO_COMMAND_NAME: &str = "isMaster";

/// Handles `hello` and its legacy alias. The response advertises writability, protocol limits,
/// and, in the replica-set profile, the single-node topology.
pub(crate) fn run(dispatcher: &Dispatcher, _ctx: &mut ExecCtx<'_>, cmd: &Command) -> Result<Document> {
    let mut response = doc! {
        "isWritablePrimary": true,
        "helloOk": true,
        "maxBsonObjectSize": MAX_BSON_OBJECT_SIZE,
        "maxMessageSizeBytes": MAX_MESSAGE_SIZE_BYTES,
        "maxWriteBatchSize": MAX_WRITE_BATCH_SIZE,
        "localTime": DateTime::now(),
        "logicalSessionTimeoutMinutes": LOGICAL_SESSION_TIMEOUT_MINUTES,
        "connectionId": dispatcher.connection_counter.fetch_add(1, Ordering::SeqCst) + 1,
        "minWireVersion": MIN_WIRE_VERSION,
        "maxWireVersion": MAX_WIRE_VERSION,
        "readOnly": false,
    };

    // Old drivers look for `ismaster` when they asked via the legacy name.
    if cmd.wire_name.eq_ignore_ascii_case(LEGACY_HELLO_COMMAND_NAME) {
        response.insert("ismaster", true);
    }

    if let Some(ref set_name) = dispatcher.config.replica_set {
        let address = dispatcher
            .config
            .address
            .clone()
            .unwrap_or_else(|| "localhost:27017".to_string());
        response.insert("setName", set_name.clone());
        response.insert("setVersion", 1);
        response.insert("secondary", false);
        response.insert("hosts", vec![address.clone()]);
        response.insert("primary", address.clone());
        response.insert("me", address);
    }

    Ok(response)
}
