//! End-to-end tests: a real TCP server driven through a hand-rolled OP_MSG/OP_QUERY client.

use std::sync::Arc;

use bson::{doc, Bson, Document};
use jongodb::{Server, ServerOptions};
use pretty_assertions::assert_eq;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::Notify,
    task::JoinHandle,
};

const OP_MSG: i32 = 2013;
const OP_QUERY: i32 = 2004;
const OP_REPLY: i32 = 1;

struct TestServer {
    address: std::net::SocketAddr,
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl TestServer {
    async fn start(options: ServerOptions) -> Self {
        let server = Server::bind(options).await.expect("bind");
        let address = server.local_addr();
        let shutdown = server.shutdown_handle();
        let handle = tokio::spawn(async move {
            let _ = server.run().await;
        });
        Self {
            address,
            shutdown,
            handle,
        }
    }

    async fn connect(&self) -> Client {
        Client {
            stream: TcpStream::connect(self.address).await.expect("connect"),
            next_request_id: 1,
        }
    }

    async fn stop(self) {
        self.shutdown.notify_one();
        let _ = self.handle.await;
    }
}

struct Client {
    stream: TcpStream,
    next_request_id: i32,
}

impl Client {
    /// Sends a command in an OP_MSG envelope and reads the single-document response.
    async fn command(&mut self, db: &str, mut body: Document) -> Document {
        body.insert("$db", db);

        let mut doc_bytes = Vec::new();
        body.to_writer(&mut doc_bytes).unwrap();

        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let mut frame = Vec::new();
        let total = 16 + 4 + 1 + doc_bytes.len();
        frame.extend_from_slice(&(total as i32).to_le_bytes());
        frame.extend_from_slice(&request_id.to_le_bytes());
        frame.extend_from_slice(&0i32.to_le_bytes());
        frame.extend_from_slice(&OP_MSG.to_le_bytes());
        frame.extend_from_slice(&0u32.to_le_bytes()); // flagBits
        frame.push(0); // section kind 0
        frame.extend_from_slice(&doc_bytes);
        self.stream.write_all(&frame).await.unwrap();

        let (op_code, response_to, payload) = self.read_frame().await;
        assert_eq!(op_code, OP_MSG);
        assert_eq!(response_to, request_id);

        // flagBits, then a single kind-0 section.
        assert_eq!(payload[4], 0);
        Document::from_reader(&payload[5..]).unwrap()
    }

    /// Sends a command through the legacy OP_QUERY envelope against `<db>.$cmd`.
    async fn legacy_command(&mut self, namespace: &str, body: Document) -> Document {
        let mut doc_bytes = Vec::new();
        body.to_writer(&mut doc_bytes).unwrap();

        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let mut payload = Vec::new();
        payload.extend_from_slice(&0i32.to_le_bytes()); // flags
        payload.extend_from_slice(namespace.as_bytes());
        payload.push(0);
        payload.extend_from_slice(&0i32.to_le_bytes()); // numberToSkip
        payload.extend_from_slice(&(-1i32).to_le_bytes()); // numberToReturn
        payload.extend_from_slice(&doc_bytes);

        let mut frame = Vec::new();
        frame.extend_from_slice(&((16 + payload.len()) as i32).to_le_bytes());
        frame.extend_from_slice(&request_id.to_le_bytes());
        frame.extend_from_slice(&0i32.to_le_bytes());
        frame.extend_from_slice(&OP_QUERY.to_le_bytes());
        frame.extend_from_slice(&payload);
        self.stream.write_all(&frame).await.unwrap();

        let (op_code, response_to, payload) = self.read_frame().await;
        assert_eq!(op_code, OP_REPLY);
        assert_eq!(response_to, request_id);

        // flags i32, cursorId i64, startingFrom i32, numberReturned i32, then the document.
        let number_returned = i32::from_le_bytes(payload[16..20].try_into().unwrap());
        assert_eq!(number_returned, 1);
        Document::from_reader(&payload[20..]).unwrap()
    }

    async fn read_frame(&mut self) -> (i32, i32, Vec<u8>) {
        let mut header = [0u8; 16];
        self.stream.read_exact(&mut header).await.unwrap();
        let length = i32::from_le_bytes(header[0..4].try_into().unwrap());
        let response_to = i32::from_le_bytes(header[8..12].try_into().unwrap());
        let op_code = i32::from_le_bytes(header[12..16].try_into().unwrap());

        let mut payload = vec![0u8; (length - 16) as usize];
        self.stream.read_exact(&mut payload).await.unwrap();
        (op_code, response_to, payload)
    }
}

fn first_batch(response: &Document) -> Vec<Document> {
    response
        .get_document("cursor")
        .unwrap()
        .get_array("firstBatch")
        .unwrap()
        .iter()
        .map(|d| match d {
            Bson::Document(d) => d.clone(),
            other => panic!("expected document, got {:?}", other),
        })
        .collect()
}

#[tokio::test]
async fn handshake_over_both_envelopes() {
    let server = TestServer::start(ServerOptions::default()).await;
    let mut client = server.connect().await;

    let hello = client.command("admin", doc! { "hello": 1 }).await;
    assert_eq!(hello.get_f64("ok"), Ok(1.0));
    assert_eq!(hello.get_bool("isWritablePrimary"), Ok(true));
    assert_eq!(hello.get_bool("helloOk"), Ok(true));
    assert!(hello.get_i32("maxWireVersion").unwrap() >= 17);

    // Legacy handshake: OP_QUERY against admin.$cmd, answered with OP_REPLY.
    let is_master = client
        .legacy_command("admin.$cmd", doc! { "isMaster": 1 })
        .await;
    assert_eq!(is_master.get_f64("ok"), Ok(1.0));
    assert_eq!(is_master.get_bool("ismaster"), Ok(true));

    server.stop().await;
}

#[tokio::test]
async fn legacy_envelope_db_resolution() {
    let server = TestServer::start(ServerOptions::default()).await;
    let mut client = server.connect().await;

    // Without $db the namespace prefix names the database.
    client
        .legacy_command(
            "nsdb.$cmd",
            doc! { "insert": "users", "documents": [ { "_id": 1 } ] },
        )
        .await;
    let count = client.command("nsdb", doc! { "count": "users" }).await;
    assert_eq!(count.get_i64("n"), Ok(1));

    // With $db, the body wins over the namespace.
    client
        .legacy_command(
            "ignored.$cmd",
            doc! { "insert": "users", "documents": [ { "_id": 2 } ], "$db": "nsdb" },
        )
        .await;
    let count = client.command("nsdb", doc! { "count": "users" }).await;
    assert_eq!(count.get_i64("n"), Ok(2));

    server.stop().await;
}

// Scenario S1: basic CRUD.
#[tokio::test]
async fn basic_crud() {
    let server = TestServer::start(ServerOptions::default()).await;
    let mut client = server.connect().await;

    let inserted = client
        .command(
            "app",
            doc! {
                "insert": "users",
                "documents": [ { "_id": 1, "name": "alpha" }, { "_id": 2, "name": "beta" } ],
            },
        )
        .await;
    assert_eq!(inserted.get_i64("n"), Ok(2));

    let found = client
        .command("app", doc! { "find": "users", "filter": { "status": "active" } })
        .await;
    assert_eq!(first_batch(&found).len(), 0);

    let updated = client
        .command(
            "app",
            doc! {
                "update": "users",
                "updates": [ { "q": { "status": "new" }, "u": { "$set": { "status": "active" } }, "multi": true } ],
            },
        )
        .await;
    assert_eq!(updated.get_i64("n"), Ok(0));
    assert_eq!(updated.get_i64("nModified"), Ok(0));

    let one = client
        .command("app", doc! { "find": "users", "filter": { "_id": 1 } })
        .await;
    let batch = first_batch(&one);
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].get_str("name"), Ok("alpha"));

    server.stop().await;
}

// Scenario S2: unique index enforcement.
#[tokio::test]
async fn unique_index_rejects_duplicates() {
    let server = TestServer::start(ServerOptions::default()).await;
    let mut client = server.connect().await;

    client
        .command(
            "app",
            doc! {
                "createIndexes": "users",
                "indexes": [ { "name": "email_1", "key": { "email": 1 }, "unique": true } ],
            },
        )
        .await;

    let ok = client
        .command(
            "app",
            doc! { "insert": "users", "documents": [ { "_id": 1, "email": "a@x" } ] },
        )
        .await;
    assert_eq!(ok.get_i64("n"), Ok(1));

    let dup = client
        .command(
            "app",
            doc! { "insert": "users", "documents": [ { "_id": 2, "email": "a@x" } ] },
        )
        .await;
    assert_eq!(dup.get_i64("n"), Ok(0));
    let errors = dup.get_array("writeErrors").unwrap();
    let entry = match &errors[0] {
        Bson::Document(entry) => entry,
        other => panic!("expected document, got {:?}", other),
    };
    assert_eq!(entry.get_i32("index"), Ok(0));
    assert_eq!(entry.get_i32("code"), Ok(11000));
    assert_eq!(entry.get_str("codeName"), Ok("DuplicateKey"));

    let all = client.command("app", doc! { "find": "users", "filter": {} }).await;
    assert_eq!(first_batch(&all).len(), 1);

    server.stop().await;
}

// Scenarios S3/S4: transaction isolation over the wire, across connections.
#[tokio::test]
async fn transaction_commit_and_abort_isolation() {
    let server = TestServer::start(ServerOptions::default()).await;
    let mut session_conn = server.connect().await;
    let mut other_conn = server.connect().await;

    let lsid = doc! { "id": "wire-s1" };
    let insert = doc! {
        "insert": "users",
        "documents": [ { "_id": 1, "name": "txn" } ],
        "lsid": lsid.clone(),
        "txnNumber": 1_i64,
        "autocommit": false,
        "startTransaction": true,
    };
    let response = session_conn.command("app", insert).await;
    assert_eq!(response.get_f64("ok"), Ok(1.0));

    // Outside the session: invisible.
    let outside = other_conn
        .command("app", doc! { "find": "users", "filter": {} })
        .await;
    assert_eq!(first_batch(&outside).len(), 0);

    // Inside the session: visible.
    let inside = session_conn
        .command(
            "app",
            doc! {
                "find": "users",
                "filter": {},
                "lsid": lsid.clone(),
                "txnNumber": 1_i64,
                "autocommit": false,
            },
        )
        .await;
    assert_eq!(first_batch(&inside).len(), 1);

    let committed = session_conn
        .command(
            "admin",
            doc! {
                "commitTransaction": 1,
                "lsid": lsid.clone(),
                "txnNumber": 1_i64,
                "autocommit": false,
            },
        )
        .await;
    assert_eq!(committed.get_f64("ok"), Ok(1.0));

    let outside = other_conn
        .command("app", doc! { "find": "users", "filter": {} })
        .await;
    assert_eq!(first_batch(&outside).len(), 1);

    // S4: a second transaction that aborts.
    let response = session_conn
        .command(
            "app",
            doc! {
                "insert": "users",
                "documents": [ { "_id": 2 } ],
                "lsid": lsid.clone(),
                "txnNumber": 2_i64,
                "autocommit": false,
                "startTransaction": true,
            },
        )
        .await;
    assert_eq!(response.get_f64("ok"), Ok(1.0));
    session_conn
        .command(
            "admin",
            doc! {
                "abortTransaction": 1,
                "lsid": lsid.clone(),
                "txnNumber": 2_i64,
                "autocommit": false,
            },
        )
        .await;

    let outside = other_conn
        .command("app", doc! { "find": "users", "filter": {} })
        .await;
    assert_eq!(first_batch(&outside).len(), 1);

    // Referencing the aborted transaction is transiently retryable.
    let stale = session_conn
        .command(
            "app",
            doc! {
                "insert": "users",
                "documents": [ { "_id": 3 } ],
                "lsid": lsid,
                "txnNumber": 2_i64,
                "autocommit": false,
            },
        )
        .await;
    assert_eq!(stale.get_f64("ok"), Ok(0.0));
    assert_eq!(stale.get_i32("code"), Ok(251));
    assert_eq!(stale.get_str("codeName"), Ok("NoSuchTransaction"));
    assert_eq!(
        stale.get_array("errorLabels").unwrap(),
        &vec![Bson::String("TransientTransactionError".to_string())]
    );

    server.stop().await;
}

// Scenario S5: cursor batching across getMore.
#[tokio::test]
async fn cursor_multi_batch() {
    let server = TestServer::start(ServerOptions::default()).await;
    let mut client = server.connect().await;

    client
        .command(
            "app",
            doc! { "insert": "users", "documents": [ { "_id": 1 }, { "_id": 2 }, { "_id": 3 } ] },
        )
        .await;

    let response = client
        .command(
            "app",
            doc! {
                "aggregate": "users",
                "pipeline": [ { "$sort": { "_id": 1 } } ],
                "cursor": { "batchSize": 2 },
            },
        )
        .await;
    let cursor = response.get_document("cursor").unwrap();
    let id = cursor.get_i64("id").unwrap();
    assert_ne!(id, 0);
    assert_eq!(cursor.get_str("ns"), Ok("app.users"));
    assert_eq!(
        first_batch(&response),
        vec![doc! { "_id": 1 }, doc! { "_id": 2 }]
    );

    let more = client
        .command(
            "app",
            doc! { "getMore": id, "collection": "users", "batchSize": 2 },
        )
        .await;
    let next = more.get_document("cursor").unwrap();
    assert_eq!(next.get_i64("id"), Ok(0));
    assert_eq!(
        next.get_array("nextBatch").unwrap(),
        &vec![Bson::Document(doc! { "_id": 3 })]
    );

    // The exhausted cursor is gone.
    let gone = client
        .command("app", doc! { "getMore": id, "collection": "users" })
        .await;
    assert_eq!(gone.get_i32("code"), Ok(43));

    server.stop().await;
}

// Scenario S6: ordered bulkWrite halts at the first failure.
#[tokio::test]
async fn ordered_bulk_write_halts() {
    let server = TestServer::start(ServerOptions::default()).await;
    let mut client = server.connect().await;

    client
        .command(
            "app",
            doc! {
                "createIndexes": "users",
                "indexes": [ { "name": "email_1", "key": { "email": 1 }, "unique": true } ],
            },
        )
        .await;

    let response = client
        .command(
            "app",
            doc! {
                "bulkWrite": "users",
                "ops": [
                    { "insertOne": { "document": { "_id": 1, "email": "a" } } },
                    { "insertOne": { "document": { "_id": 2, "email": "a" } } },
                    { "insertOne": { "document": { "_id": 3, "email": "b" } } },
                ],
            },
        )
        .await;
    assert_eq!(response.get_i64("nInserted"), Ok(1));
    let errors = response.get_array("writeErrors").unwrap();
    let entry = match &errors[0] {
        Bson::Document(entry) => entry,
        other => panic!("expected document, got {:?}", other),
    };
    assert_eq!(entry.get_i32("index"), Ok(1));
    assert_eq!(entry.get_i32("code"), Ok(11000));

    let all = client.command("app", doc! { "find": "users", "filter": {} }).await;
    assert_eq!(first_batch(&all).len(), 1);

    server.stop().await;
}

#[tokio::test]
async fn per_connection_ordering_is_preserved() {
    let server = TestServer::start(ServerOptions::default()).await;
    let mut client = server.connect().await;

    // Fire a burst of sequential commands; responses must come back in order, correlated by
    // responseTo (asserted inside `command`).
    for i in 0..32 {
        let response = client
            .command(
                "app",
                doc! { "insert": "seq", "documents": [ { "_id": i } ] },
            )
            .await;
        assert_eq!(response.get_i64("n"), Ok(1), "insert {} failed", i);
    }
    let count = client.command("app", doc! { "count": "seq" }).await;
    assert_eq!(count.get_i64("n"), Ok(32));

    server.stop().await;
}

#[tokio::test]
async fn malformed_frame_closes_connection_but_not_server() {
    let server = TestServer::start(ServerOptions::default()).await;
    let mut raw = server.connect().await;

    // A header promising a body that never arrives, with a bogus opcode.
    let mut frame = Vec::new();
    frame.extend_from_slice(&24i32.to_le_bytes());
    frame.extend_from_slice(&1i32.to_le_bytes());
    frame.extend_from_slice(&0i32.to_le_bytes());
    frame.extend_from_slice(&9999i32.to_le_bytes());
    frame.extend_from_slice(&[0u8; 8]);
    raw.stream.write_all(&frame).await.unwrap();

    // The server closes this connection.
    let mut buf = [0u8; 1];
    let read = raw.stream.read(&mut buf).await.unwrap();
    assert_eq!(read, 0);

    // A fresh connection still works.
    let mut client = server.connect().await;
    let pong = client.command("admin", doc! { "ping": 1 }).await;
    assert_eq!(pong.get_f64("ok"), Ok(1.0));

    server.stop().await;
}

#[tokio::test]
async fn semantically_invalid_commands_keep_the_connection_open() {
    let server = TestServer::start(ServerOptions::default()).await;
    let mut client = server.connect().await;

    let bad = client.command("app", doc! { "mapReduce": "x" }).await;
    assert_eq!(bad.get_f64("ok"), Ok(0.0));
    assert_eq!(bad.get_i32("code"), Ok(59));

    // Same connection, next command succeeds.
    let pong = client.command("admin", doc! { "ping": 1 }).await;
    assert_eq!(pong.get_f64("ok"), Ok(1.0));

    server.stop().await;
}

#[tokio::test]
async fn replica_set_profile_connection_string_and_hello() {
    let options = ServerOptions::builder().replica_set("rs0").build();
    let server = Server::bind(options).await.expect("bind");
    assert!(server
        .connection_string()
        .ends_with("/test?replicaSet=rs0"));

    let address = server.local_addr();
    let shutdown = server.shutdown_handle();
    let handle = tokio::spawn(async move {
        let _ = server.run().await;
    });

    let mut client = Client {
        stream: TcpStream::connect(address).await.expect("connect"),
        next_request_id: 1,
    };
    let hello = client.command("admin", doc! { "hello": 1 }).await;
    assert_eq!(hello.get_str("setName"), Ok("rs0"));
    assert!(hello.get_str("primary").is_ok());
    assert_eq!(hello.get_array("hosts").unwrap().len(), 1);

    shutdown.notify_one();
    let _ = handle.await;
}
