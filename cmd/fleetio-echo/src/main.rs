//! fleetio Echo Server
//!
//! Multi-threaded TCP echo server on the fleetio engine: every receive is
//! written straight back to the sender with `send_to`.
//!
//! Usage:
//!     cargo build --release -p fleetio-echo
//!     ./target/release/fleetio-echo [port] [poll|uring]
//!
//! Environment:
//!     RUST_LOG=fleetio_engine=debug   log filter (default: info)
//!     FLEETIO_WORKERS=8 ...           see EngineConfig::from_env
//!
//! Test with:
//!     echo "hello" | nc -q1 localhost 9999
//!     for i in $(seq 1 100); do echo "ping $i" | nc -q1 localhost 9999 & done

use fleetio_engine::{Callbacks, Engine, EngineConfig, QueueBackend};

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

static RUNNING: AtomicBool = AtomicBool::new(true);

const STATS_INTERVAL: Duration = Duration::from_secs(5);

fn init_logging() {
    // RUST_LOG wins when set.
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_names(true))
        .init();
}

fn main() {
    init_logging();

    let args: Vec<String> = std::env::args().collect();
    let port: u16 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(9999);

    let mut config = EngineConfig::from_env();
    if let Some(raw) = args.get(2) {
        match raw.parse::<QueueBackend>() {
            Ok(backend) => config = config.backend(backend),
            Err(e) => {
                tracing::error!(error = %e, "bad backend argument");
                std::process::exit(2);
            }
        }
    }

    // SIGINT/SIGTERM only flip the flag; the main loop does the shutdown.
    unsafe {
        libc::signal(libc::SIGINT, handle_signal as usize);
        libc::signal(libc::SIGTERM, handle_signal as usize);
    }

    let callbacks = Callbacks::new()
        .on_receive(|h, msg| {
            h.send_to(msg.conn, msg.data);
        })
        .on_disconnect(|_, conn, peer| {
            tracing::info!(%conn, %peer, "client gone");
        });

    let mut engine = Engine::new(config);
    if let Err(e) = engine.start(port, callbacks) {
        tracing::error!(error = %e, port, "failed to start");
        std::process::exit(1);
    }

    let start = Instant::now();
    let mut last_stats = start;
    while RUNNING.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
        let now = Instant::now();
        if now.duration_since(last_stats) >= STATS_INTERVAL {
            tracing::info!(
                elapsed_secs = now.duration_since(start).as_secs(),
                "{}",
                engine.stats()
            );
            last_stats = now;
        }
    }

    tracing::info!("shutting down");
    let final_stats = engine.stats();
    engine.stop();
    tracing::info!("{}", final_stats);
}

extern "C" fn handle_signal(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}
