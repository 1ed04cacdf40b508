//! Tracing initialisation for fleetrun binaries.
//!
//! Logs always go to stderr; stdout belongs to progress output and reports.
//! Without `RUST_LOG`, the requested level applies to fleetrun's own targets
//! and dependencies stay at `warn`.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Log targets owned by fleetrun: the library and the `fleetrun` binary.
const FLEETRUN_TARGETS: [&str; 2] = ["fleetrun_core", "fleetrun"];

/// Filter directives used when `RUST_LOG` is unset.
pub fn default_directives(level: Level) -> String {
    let level = level.as_str().to_ascii_lowercase();
    let mut directives = String::from("warn");
    for target in FLEETRUN_TARGETS {
        directives.push_str(&format!(",{target}={level}"));
    }
    directives
}

/// Initialise the global tracing subscriber.
///
/// `json` switches to newline-delimited JSON. Only the first call takes
/// effect.
pub fn init_tracing(json: bool, level: Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));

    let plain = (!json).then(|| fmt::layer().with_writer(std::io::stderr).with_target(false));
    let structured = json.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .json()
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(plain)
        .with(structured)
        .try_init()
        .ok();
}
