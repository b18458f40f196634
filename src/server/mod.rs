//! TCP ingress: the accept loop, per-connection tasks, and the startup advertisement contract.

mod connection;
mod options;

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{net::TcpListener, sync::Notify};
use tracing::{error, info, warn};

use crate::{
    dispatch::{Dispatcher, DispatcherConfig},
    error::Result,
    Engine,
};

pub use options::ServerOptions;

/// Delay between retries when `accept` fails transiently.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Consecutive accept failures tolerated before the listener gives up and the server stops.
const MAX_ACCEPT_FAILURES: u32 = 10;

/// How often idle cursors and sessions are swept.
const REAP_INTERVAL: Duration = Duration::from_secs(60);

/// A TCP server hosting one engine. Connections are independent tasks; within a connection,
/// requests are served strictly in arrival order.
#[derive(Debug)]
pub struct Server {
    options: ServerOptions,
    dispatcher: Arc<Dispatcher>,
    listener: TcpListener,
    local_addr: std::net::SocketAddr,
    shutdown: Arc<Notify>,
    connection_counter: AtomicU64,
}

impl Server {
    /// Binds a listener for `options` over a fresh engine. With port 0 the kernel assigns the
    /// port; [`Server::connection_string`] reports the resolved address.
    pub async fn bind(options: ServerOptions) -> Result<Self> {
        Self::bind_with_engine(options, Engine::new()).await
    }

    /// Binds a listener serving an existing engine.
    pub async fn bind_with_engine(options: ServerOptions, engine: Engine) -> Result<Self> {
        let listener = TcpListener::bind((options.host.as_str(), options.port)).await?;
        let local_addr = listener.local_addr()?;

        let dispatcher = Dispatcher::with_config(
            engine,
            DispatcherConfig {
                address: Some(format!("{}:{}", options.host, local_addr.port())),
                replica_set: options.replica_set.clone(),
            },
        );

        Ok(Self {
            options,
            dispatcher: Arc::new(dispatcher),
            listener,
            local_addr,
            shutdown: Arc::new(Notify::new()),
            connection_counter: AtomicU64::new(0),
        })
    }

    /// The resolved listen address.
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// The dispatcher backing this server, for in-process inspection (journal, diagnostics).
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// A handle that stops [`Server::run`] when notified (via `notify_one`, so a shutdown
    /// requested while a connection is being accepted is not lost).
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    /// The advertised connection string:
    /// `mongodb://host:port/<db>` (`?replicaSet=<set>` in the replica-set profile).
    pub fn connection_string(&self) -> String {
        let base = format!(
            "mongodb://{}:{}/{}",
            self.options.host,
            self.local_addr.port(),
            self.options.default_db
        );
        match self.options.replica_set {
            Some(ref set_name) => format!("{}?replicaSet={}", base, set_name),
            None => base,
        }
    }

    /// Runs the accept loop until shutdown. Transient accept errors are retried with a short
    /// backoff; after too many consecutive failures the listener closes and the server stops.
    pub async fn run(&self) -> Result<()> {
        info!(address = %self.local_addr, "server ready");
        let mut consecutive_failures: u32 = 0;

        // The reaper has no shutdown signal of its own; it is aborted when the accept loop
        // exits, keeping the shutdown Notify single-consumer.
        let reaper = {
            let dispatcher = Arc::clone(&self.dispatcher);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(REAP_INTERVAL).await;
                    dispatcher.reap_idle();
                }
            })
        };

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        consecutive_failures = 0;
                        let _ = stream.set_nodelay(true);
                        let connection_id =
                            self.connection_counter.fetch_add(1, Ordering::SeqCst);
                        let dispatcher = Arc::clone(&self.dispatcher);
                        tokio::spawn(async move {
                            connection::serve(dispatcher, stream, connection_id).await;
                        });
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        if consecutive_failures >= MAX_ACCEPT_FAILURES {
                            error!(error = %e, "giving up after repeated accept failures");
                            reaper.abort();
                            return Err(e.into());
                        }
                        warn!(error = %e, consecutive_failures, "accept failed, retrying");
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
                _ = self.shutdown.notified() => {
                    info!("server shutting down");
                    reaper.abort();
                    return Ok(());
                }
            }
        }
    }

    /// Binds, prints the startup advertisement on stdout, and serves until shutdown. This is the
    /// standalone-process contract: `JONGODB_URI=<uri>` on success, `JONGODB_START_FAILURE=` on
    /// a fatal startup error.
    pub async fn serve(options: ServerOptions) -> Result<()> {
        let server = match Self::bind(options).await {
            Ok(server) => server,
            Err(e) => {
                println!("JONGODB_START_FAILURE={}", e.message());
                return Err(e);
            }
        };
        println!("JONGODB_URI={}", server.connection_string());
        server.run().await
    }
}
