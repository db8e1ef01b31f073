//! Tracing subscriber setup for the `kfac` binary and downstream trainers

use std::io::{self, IsTerminal};

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::error::{Error, Result};

/// Default filter directive for a verbosity level (`-v` count)
pub fn filter_directive(verbosity: u8, quiet: bool) -> &'static str {
    if quiet {
        return "error";
    }
    match verbosity {
        0 => "kfac=info,warn",
        1 => "kfac=debug,info",
        2 => "kfac=trace,debug",
        _ => "trace",
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the verbosity unless `quiet` is set. JSON output
/// includes the current span list; terminal output reports span timings on
/// close; anything else gets plain, untimed lines.
pub fn init_logging(verbosity: u8, quiet: bool, json_output: bool) -> Result<()> {
    let directive = filter_directive(verbosity, quiet);
    let env_filter = if quiet {
        EnvFilter::new(directive)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive))
    };

    let result = if json_output {
        let json_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(env_filter);
        tracing_subscriber::registry().with(json_layer).try_init()
    } else if io::stdout().is_terminal() && !quiet {
        let fmt_layer = fmt::layer()
            .with_target(false)
            .with_thread_names(true)
            .with_ansi(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_filter(env_filter);
        tracing_subscriber::registry().with(fmt_layer).try_init()
    } else {
        let fmt_layer = fmt::layer()
            .with_target(false)
            .with_ansi(false)
            .without_time()
            .with_filter(env_filter);
        tracing_subscriber::registry().with(fmt_layer).try_init()
    };

    result.map_err(|e| Error::internal(format!("failed to install tracing subscriber: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0, false, "kfac=info,warn" ; "default")]
    #[test_case(1, false, "kfac=debug,info" ; "verbose")]
    #[test_case(2, false, "kfac=trace,debug" ; "very verbose")]
    #[test_case(7, false, "trace" ; "everything")]
    #[test_case(5, true, "error" ; "quiet wins")]
    fn test_filter_directive(verbosity: u8, quiet: bool, expected: &str) {
        assert_eq!(filter_directive(verbosity, quiet), expected);
    }
}
