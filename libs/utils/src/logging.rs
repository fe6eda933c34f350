use anyhow::Context;
use tracing_subscriber::prelude::*;

/// Selects the wire format `tracing-subscriber` renders events in.
///
/// Plain is for interactive use (`pg_basebackup`/`wal_receive` run from a
/// terminal); Json is for the server-side binaries, whose output is meant
/// to be consumed by a log pipeline rather than read directly.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogFormat {
    Plain,
    Json,
}

impl LogFormat {
    pub fn from_config(s: &str) -> anyhow::Result<Self> {
        match s {
            "plain" => Ok(LogFormat::Plain),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("unrecognized log format {s:?}, expected 'plain' or 'json'"),
        }
    }
}

/// Where log lines are written. Tests and one-shot CLI invocations both
/// want Stdout; a long-running receiver could eventually want a file, so
/// the enum leaves room for it without the caller needing to know.
pub enum Output {
    Stdout,
}

/// Initializes the global `tracing` subscriber. Idempotent-ish: meant to be
/// called exactly once, from `main()`, before any other module logs.
pub fn init(log_format: LogFormat, output: Output) -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let Output::Stdout = output;

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);

    match log_format {
        LogFormat::Plain => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .try_init()
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer.json())
                .try_init()
        }
    }
    .context("failed to install tracing subscriber")
}
