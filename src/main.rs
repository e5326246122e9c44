//! coecho: a single-threaded coroutine-driven TCP echo server
//!
//! Every accepted connection is handled by a suspendable routine (an
//! `async fn` compiled to a state machine) driven by one reactor thread.
//! The reactor multiplexes all connections over a single readiness
//! notifier (epoll on Linux, kqueue on macOS, via mio). There is no
//! thread per connection and no locking on connection state.

mod config;
mod runtime;

use clap::Parser;
use config::Config;
use runtime::Reactor;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();

    // Initialize logging (RUST_LOG takes precedence over --log-level)
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        "Starting coecho server"
    );

    // Setup failures (bind, listen, poll creation, registration) are
    // fatal; they propagate here and the process exits non-zero.
    let reactor = Reactor::new(config.bind_addr())?;
    info!(addr = %reactor.local_addr(), "Listening");

    reactor.run()?;
    Ok(())
}
