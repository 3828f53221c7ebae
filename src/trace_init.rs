//! Optional tracing setup for hosts of the engine.
//!
//! Compiled to a no-op unless the `trace` feature is on. With a log
//! directory the subscriber writes rolling JSON lines through a
//! non-blocking appender; without one it prints compact events to
//! stderr. The filter honors `RUST_LOG` and defaults to this crate at
//! debug, which covers the load, prefill and stop-condition events the
//! engine emits.

#[cfg(feature = "trace")]
use std::path::Path;
#[cfg(feature = "trace")]
use std::sync::OnceLock;

#[cfg(feature = "trace")]
static WORKER: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();
#[cfg(feature = "trace")]
static STARTED: OnceLock<()> = OnceLock::new();

#[cfg(feature = "trace")]
pub fn init_tracing(log_dir: Option<&Path>) {
    STARTED.get_or_init(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("lm_engine=debug"));
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true);
        match log_dir {
            Some(dir) => {
                let appender = tracing_appender::rolling::daily(dir, "lm-engine.jsonl");
                let (writer, guard) = tracing_appender::non_blocking(appender);
                // The guard flushes the writer thread on drop; parking it
                // here keeps it alive for the process lifetime.
                let _ = WORKER.set(guard);
                builder.json().with_writer(writer).init();
            }
            None => builder.with_writer(std::io::stderr).init(),
        }
    });
}

#[cfg(not(feature = "trace"))]
pub fn init_tracing(_log_dir: Option<&std::path::Path>) {}
