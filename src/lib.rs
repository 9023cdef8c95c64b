//! Analysis Bridge - session layer for an external language analysis server
//!
//! Launches the server as a child process, speaks Content-Length framed
//! JSON-RPC over its stdio, restarts it when it crashes, and keeps track
//! of which documents it has been told about.

pub mod config;
pub mod registry;
pub mod retry;
pub mod supervisor;
pub mod transport;

mod error;
mod state;
mod utils;

pub use error::{Error, Result, INTERNAL_ERROR, METHOD_NOT_FOUND, PARSE_ERROR};
pub use registry::{ResourceId, ResourceRegistry};
pub use state::BridgeContext;
pub use supervisor::{ProcessState, Supervisor};
pub use transport::Session;

/// Install the global `tracing` subscriber (stderr, `RUST_LOG` filter)
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("analysis_bridge=info"));

    // stdout may carry protocol traffic; keep logs on stderr
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
