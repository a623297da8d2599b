//! Logging setup, scaled down from the teacher's `io_engine::logger`: the
//! `tracing`/`tracing-subscriber` stack and the `RUST_LOG`-driven
//! `EnvFilter` idiom are carried over verbatim; the custom ANSI event
//! formatter and the SPDK `log`-crate bridge are not, since there is no SPDK
//! log source in this crate to bridge from.

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

static INIT: OnceCell<()> = OnceCell::new();

/// Installs the global `tracing` subscriber. `level` is the default filter
/// directive used when `RUST_LOG` is unset (e.g. `"tcmu_core=info"`).
/// Idempotent: later calls are no-ops, which keeps this safe to call from
/// both `src/bin/tcmu-core.rs` and any test harness that wants output.
pub fn init(level: &str) {
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
        tracing_subscriber::fmt().with_env_filter(filter).init();
    });
}
