//! Log output setup.
//!
//! The subscriber is installed before the configuration is read, so its filter
//! sits behind a reload layer and is swapped once `logging.level` is known.
//! An explicit `RUST_LOG` pins the filter for the life of the process.

use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

/// Dependencies that are chatty at `debug` and below.
const QUIET_TARGETS: &[&str] = &["hyper", "h2", "reqwest", "sqlx", "redis"];

/// Filter for a configured level.
///
/// Gatekeeper crates log at `level`; [`QUIET_TARGETS`] are held at `warn`
/// unless `level` is stricter than that.
pub fn filter_directives(level: &str) -> String {
    let level = level.trim().to_ascii_lowercase();
    let quiet = match level.as_str() {
        "error" | "off" => level.as_str(),
        _ => "warn",
    };
    let mut directives = level.clone();
    for target in QUIET_TARGETS {
        directives.push_str(&format!(",{target}={quiet}"));
    }
    directives
}

/// Handle to the installed log filter.
pub struct LogControl {
    handle: reload::Handle<EnvFilter, Registry>,
    pinned_by_env: bool,
}

impl LogControl {
    /// Switches to the configured `level`. Ignored while `RUST_LOG` is set.
    pub fn set_level(&self, level: &str) {
        if self.pinned_by_env {
            tracing::debug!(level, "RUST_LOG set, keeping environment filter");
            return;
        }
        let filter = match EnvFilter::try_new(filter_directives(level)) {
            Ok(filter) => filter,
            Err(e) => {
                tracing::warn!(level, error = %e, "invalid logging level, keeping current filter");
                return;
            }
        };
        if let Err(e) = self.handle.reload(filter) {
            tracing::warn!(error = %e, "log filter reload failed");
        }
    }
}

/// Installs the global subscriber at `info`, or at `RUST_LOG` when set.
///
/// Returns `None` when a subscriber was already installed, as happens when
/// several tests share a process.
pub fn init_tracing() -> Option<LogControl> {
    let from_env = std::env::var_os("RUST_LOG")
        .and_then(|_| EnvFilter::try_from_default_env().ok());
    let pinned_by_env = from_env.is_some();
    let filter = from_env.unwrap_or_else(|| EnvFilter::new(filter_directives("info")));

    let (layer, handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(layer)
        .with(fmt::layer().with_target(true))
        .try_init()
        .ok()?;

    Some(LogControl {
        handle,
        pinned_by_env,
    })
}
