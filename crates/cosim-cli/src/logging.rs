use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber. Output goes to stderr so stdout carries
/// only command results.
///
/// `RUST_LOG` takes precedence; otherwise `COSIM_LOG` picks the level for
/// this workspace's targets. `LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("COSIM_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("cosim={level},cosim_cli={level}"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        let _ = registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}
