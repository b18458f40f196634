use std::sync::Arc;

use tokio::{io::BufStream, net::TcpStream};
use tracing::{debug, trace};

use crate::{
    wire::{Message, OpReply, Request},
    Dispatcher,
};

/// Serves one connection: requests are decoded, dispatched, and answered strictly in arrival
/// order. A malformed header or truncated body closes the connection; a semantically invalid
/// command produces a normal failure response and the connection stays open.
pub(super) async fn serve(dispatcher: Arc<Dispatcher>, stream: TcpStream, connection_id: u64) {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "<unknown>".to_string());
    let mut stream = BufStream::new(stream);

    loop {
        let request = match Request::read_from(&mut stream).await {
            Ok(Some(request)) => request,
            Ok(None) => {
                trace!(connection_id, peer = peer.as_str(), "connection closed by peer");
                return;
            }
            Err(e) => {
                debug!(
                    connection_id,
                    peer = peer.as_str(),
                    error = %e,
                    "closing connection on malformed message"
                );
                return;
            }
        };

        let request_id = request.request_id();
        match request {
            Request::Message(message) => {
                let body = match message.command_body() {
                    Ok(body) => body,
                    Err(e) => {
                        debug!(
                            connection_id,
                            error = %e,
                            "closing connection on invalid message sections"
                        );
                        return;
                    }
                };
                // The body's $db wins; OP_MSG has no namespace fallback.
                let db = body
                    .get_str("$db")
                    .map(str::to_string)
                    .unwrap_or_else(|_| "admin".to_string());

                let response = dispatcher.dispatch_with_request_id(request_id, &db, body);
                let reply = Message::with_response(response, request_id);
                if let Err(e) = reply.write_to(&mut stream).await {
                    debug!(connection_id, error = %e, "failed to write response");
                    return;
                }
            }
            Request::Query(query) => {
                // Legacy envelope: the namespace prefix names the database unless the body
                // carries $db.
                let db = query
                    .body
                    .get_str("$db")
                    .map(str::to_string)
                    .ok()
                    .or_else(|| query.namespace_db().map(str::to_string))
                    .unwrap_or_else(|| "admin".to_string());

                let response = dispatcher.dispatch_with_request_id(request_id, &db, query.body);
                let reply = OpReply::with_response(response, request_id);
                if let Err(e) = reply.write_to(&mut stream).await {
                    debug!(connection_id, error = %e, "failed to write reply");
                    return;
                }
            }
        }
    }
}
