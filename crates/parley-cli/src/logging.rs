//! Subscriber setup from the `logging` config section.

use parley_core::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Filter directives: base level plus per-crate overrides.
fn directives(config: Option<&LoggingConfig>, verbose: bool) -> String {
    let level = if verbose {
        "debug"
    } else {
        config.and_then(|c| c.level.as_deref()).unwrap_or("info")
    };

    let mut directives = level.to_string();
    for filter in config.map(|c| c.filters.as_slice()).unwrap_or_default() {
        directives.push(',');
        directives.push_str(filter);
    }
    directives
}

/// Install the global subscriber. `RUST_LOG` takes precedence over config.
pub fn init(config: Option<&LoggingConfig>, verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directives(config, verbose)));
    let json = config.is_some_and(|c| c.format == "json");
    let stdout = config.is_some_and(|c| c.output == "stdout");

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match (json, stdout) {
        (true, true) => builder.json().with_writer(std::io::stdout).init(),
        (true, false) => builder.json().with_writer(std::io::stderr).init(),
        (false, true) => builder.with_writer(std::io::stdout).init(),
        (false, false) => builder.with_writer(std::io::stderr).init(),
    }
}
