//! Structured logging facade. Subsystems take a parent `Logger` at
//! construction and derive children via `branch`; binaries build the root
//! logger from a sloggers TOML configuration.

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::{Config, LoggerConfig};

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#;

/// Builds a logger from a sloggers TOML configuration string.
///
/// Called once at process startup, before any subsystem is constructed.
pub fn init(config: &str) -> Logger {
    let config: LoggerConfig =
        serdeconv::from_toml_str(config).expect("Invalid logging configuration");

    config.build_logger().expect("Error building logger")
}

/// Default terminal logger writing to stderr.
#[inline]
pub fn terminal() -> Logger {
    init(DEFAULT_CONFIG)
}

/// Logger that swallows all records.
#[inline]
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

/// Derives a child logger from an optional parent, falling back to the
/// discarding logger when no parent is supplied.
#[inline]
pub fn branch<'a, L: Into<Option<&'a Logger>>>(parent: L) -> Logger {
    match parent.into() {
        Some(log) => log.new(o!()),
        None => discard(),
    }
}
