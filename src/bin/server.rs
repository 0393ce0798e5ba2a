//! SFTP subsystem server binary.
//!
//! Takes no arguments and reads no configuration: an SSH daemon (or a
//! test harness) is expected to invoke this as a subsystem with stdin and
//! stdout already connected to the client. Logging goes to stderr only,
//! so it never collides with the SFTP wire protocol on stdout.
//!
//! Run with: cargo run --bin sftp3d

use sftp3d::Engine;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    info!(
        event = "server_starting",
        version = env!("CARGO_PKG_VERSION"),
        "starting SFTP subsystem server"
    );

    let mut engine = Engine::new();
    match engine.run() {
        Ok(()) => {
            info!(event = "session_closed", "client closed the connection");
            std::process::exit(0);
        }
        Err(e) => {
            error!(event = "session_failed", error = %e, "session ended with a fatal error");
            std::process::exit(1);
        }
    }
}
