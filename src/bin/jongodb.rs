//! Standalone server binary: binds per `JONGODB_*` environment configuration, advertises
//! `JONGODB_URI=` on stdout once ready, and serves until interrupted. Exit code 0 on graceful
//! shutdown, non-zero on startup failure.

use jongodb::{Server, ServerOptions};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("JONGODB_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let options = match ServerOptions::from_env() {
        Ok(options) => options,
        Err(e) => {
            println!("JONGODB_START_FAILURE={}", e.message());
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            println!("JONGODB_START_FAILURE={}", e);
            std::process::exit(1);
        }
    };

    match runtime.block_on(Server::serve(options)) {
        Ok(()) => {}
        Err(_) => std::process::exit(1),
    }
}
