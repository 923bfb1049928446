use once_cell::sync::OnceCell;

mod fields;
mod logger;
mod writers;

use crate::log::fields::FieldConfig;
pub use logger::{Fields, Logger};
pub use writers::{BlockingWriter, Writer};

use crate::trace::Tracer;

/// The global root logger, shared by the `log` facade and the runtime.
static ROOT: OnceCell<&Logger> = OnceCell::new();

/// Initialize the global logger with the `root()` instance.
///
/// Idempotent; a second call is a no-op.
pub fn init() {
    _ = root();

    // Panics must surface as JSON error records so log aggregators
    // pick up the right severity. Written directly to stderr since the
    // logger itself may be mid-panic.
    std::panic::set_hook(Box::new(|info| {
        use std::io::Write;

        let msg = info.to_string();
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()));

        let json = serde_json::json!({
            "level": "error",
            "severity": "ERROR",
            "message": msg,
            "caller": location,
            "time": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        });
        let _ = writeln!(std::io::stderr(), "{}", json);
    }));
}

/// Set the tracer on the global logger.
pub fn set_tracer(tracer: Tracer) {
    root().set_tracer(tracer);
}

/// Returns a reference to the global root logger instance.
pub fn root() -> &'static Logger {
    ROOT.get_or_init(|| {
        let logger = {
            let fields = FieldConfig::default();

            // The runtime-internal filter. RUST_LOG wins if set;
            // ENCORE_RUNTIME_LOG adjusts just the runtime's own records.
            let filter = {
                let level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
                    let level = std::env::var("ENCORE_RUNTIME_LOG").unwrap_or("debug".to_string());
                    format!("encore_api_core={level}")
                });
                env_logger::filter::Builder::new().parse(&level).build()
            };

            let app_level: log::LevelFilter = std::env::var("ENCORE_LOG")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(log::LevelFilter::Trace);

            Logger::new(app_level, filter, fields)
        };

        // Leak the logger to give it a static lifetime. Happens once.
        let logger = Box::leak(Box::new(logger));

        let disable_logging = std::env::var("ENCORE_NOLOG").is_ok_and(|v| !v.is_empty());
        let filter = if disable_logging {
            log::LevelFilter::Off
        } else {
            log::LevelFilter::Trace
        };

        log::set_max_level(filter);
        // Tests may race to install a logger; the first one wins.
        _ = log::set_logger(logger);
        logger
    })
}
