//! Log subscriber setup for the binary and for manual debugging of tests.

#[cfg(feature = "trace")]
pub mod tracer {
    use tracing::level_filters::LevelFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::{Layer, Registry};

    /// Install the global subscriber.
    ///
    /// `TUNNELGATE_LOG_FORMAT=json` switches to JSON lines, `TUNNELGATE_LOG_TO_STDERR`
    /// writes to stderr instead of stdout and `TUNNELGATE_DISABLE_LOGS` skips setup
    /// entirely. `RUST_LOG` directives override `level`.
    pub fn init_tracer(level: Option<LevelFilter>) -> anyhow::Result<()> {
        if std::env::var("TUNNELGATE_DISABLE_LOGS").is_ok() {
            return Ok(());
        }

        let default_filter = if cfg!(any(test, debug_assertions)) {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        };
        let filter_layer = tracing_subscriber::EnvFilter::builder()
            .with_default_directive(level.unwrap_or(default_filter).into())
            .from_env_lossy();

        let to_stderr = std::env::var("TUNNELGATE_LOG_TO_STDERR").is_ok();
        let use_json = std::env::var("TUNNELGATE_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let with_location = cfg!(any(test, debug_assertions));

        let fmt_layer = match (use_json, to_stderr) {
            (true, true) => tracing_subscriber::fmt::layer()
                .with_level(true)
                .json()
                .with_file(with_location)
                .with_line_number(with_location)
                .with_writer(std::io::stderr)
                .boxed(),
            (true, false) => tracing_subscriber::fmt::layer()
                .with_level(true)
                .json()
                .with_file(with_location)
                .with_line_number(with_location)
                .boxed(),
            (false, true) => tracing_subscriber::fmt::layer()
                .with_level(true)
                .pretty()
                .with_file(with_location)
                .with_line_number(with_location)
                .with_writer(std::io::stderr)
                .boxed(),
            (false, false) => tracing_subscriber::fmt::layer()
                .with_level(true)
                .pretty()
                .with_file(with_location)
                .with_line_number(with_location)
                .boxed(),
        };

        let subscriber = Registry::default().with(fmt_layer.with_filter(filter_layer));
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|e| anyhow::anyhow!("failed to set tracing subscriber: {e}"))?;
        Ok(())
    }
}

#[cfg(not(feature = "trace"))]
pub mod tracer {
    use tracing::level_filters::LevelFilter;

    /// Logging is compiled out without the `trace` feature.
    pub fn init_tracer(_level: Option<LevelFilter>) -> anyhow::Result<()> {
        Ok(())
    }
}
