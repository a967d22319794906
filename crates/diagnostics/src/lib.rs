//! Logging facade shared by the namesys crates.
//!
//! Every crate logs through the macros exported here, which forward to
//! `emit` with named properties. Output goes to stderr through
//! `emit_term` and is selected with the `NAMESYS_LOG` environment variable:
//!
//! - `NAMESYS_LOG=off` (default) - nothing is emitted
//! - `NAMESYS_LOG=error` / `warn` - failures and fallbacks only
//! - `NAMESYS_LOG=info` - transaction outcomes, membership changes
//! - `NAMESYS_LOG=debug` - lock acquisition, retries, selection probes

use std::sync::Once;

// Re-export emit so macros can use it
pub use emit;

/// Environment variable consulted by [`init_diagnostics`].
pub const LOG_ENV: &str = "NAMESYS_LOG";

static INIT: Once = Once::new();

/// Map a `NAMESYS_LOG` value onto a minimum emit level.
///
/// `Ok(None)` means logging is switched off. Unrecognised values are
/// returned as `Err` so the caller can fall back and report it.
pub fn parse_level(value: &str) -> Result<Option<emit::Level>, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "off" => Ok(None),
        "error" => Ok(Some(emit::Level::Error)),
        "warn" => Ok(Some(emit::Level::Warn)),
        "info" => Ok(Some(emit::Level::Info)),
        "debug" => Ok(Some(emit::Level::Debug)),
        other => Err(other.to_string()),
    }
}

/// Initialize diagnostics based on the `NAMESYS_LOG` environment variable.
///
/// Safe to call any number of times; only the first call installs the
/// emitter.
pub fn init_diagnostics() {
    INIT.call_once(|| {
        let requested = std::env::var(LOG_ENV).unwrap_or_else(|_| "off".to_string());

        let (level, unknown) = match parse_level(&requested) {
            Ok(None) => return,
            Ok(Some(level)) => (level, None),
            Err(other) => (emit::Level::Info, Some(other)),
        };

        let rt = emit::setup()
            .emit_to(emit_term::stderr())
            .emit_when(emit::level::min_filter(level))
            .init();

        if let Some(value) = unknown {
            emit::warn!("unknown {env} value '{value}', using 'info'", env: LOG_ENV);
        }

        // The runtime lives for the rest of the process.
        std::mem::forget(rt);
    });
}

// The logging macros are re-exports of emit's own macros rather than
// `macro_rules!` forwarders: emit captures template holes like `{tx}` from
// the caller's scope, which a forwarding macro would hide behind hygiene.

/// Log basic operations (committed transactions, membership changes).
pub use emit::info as log_info;

/// Log detailed diagnostics (lock kinds, probe counts, retry bookkeeping).
pub use emit::debug as log_debug;

/// Log warning conditions (retries, fallbacks, best-effort failures).
pub use emit::warn as log_warn;

/// Log critical error conditions.
pub use emit::error as log_error;

/// Short form of [`log_info!`].
pub use emit::info;

/// Short form of [`log_debug!`].
pub use emit::debug;

/// Short form of [`log_warn!`].
pub use emit::warn;

/// Short form of [`log_error!`].
pub use emit::error;

pub use init_diagnostics as init;
