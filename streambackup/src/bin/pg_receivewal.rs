//! CLI driver for the WAL receiver (§6.1 `IDENTIFY_SYSTEM`/`START_REPLICATION`,
//! §6.4 flags). Discovers the server's current timeline and LSN, resolves
//! the actual resume position against `--dir` (§4.7 "Resumption"), then
//! drives [`streambackup::wal_receive::receive_wal_stream`] to completion.

use anyhow::{bail, Context};
use camino::Utf8PathBuf;
use clap::{Arg, ArgAction, Command};
use postgres_backend::{BeMessageParsed, PostgresClient};
use tokio::net::TcpStream;
use tracing::info;
use utils::lsn::Lsn;

use streambackup::wal_receive::{receive_wal_stream, OnSegmentFinish, WalReceiver};

#[derive(Clone, Debug)]
struct ReceiveArgs {
    dir: Utf8PathBuf,
    verbose: bool,
    conninfo: String,
}

impl ReceiveArgs {
    fn from_matches(matches: &clap::ArgMatches) -> anyhow::Result<Self> {
        let dir = matches
            .get_one::<String>("dir")
            .ok_or_else(|| anyhow::anyhow!("--dir is required"))?;
        Ok(ReceiveArgs {
            dir: Utf8PathBuf::from(dir),
            verbose: matches.get_flag("verbose"),
            conninfo: matches
                .get_one::<String>("conninfo")
                .cloned()
                .unwrap_or_else(|| "host=localhost port=5432".to_string()),
        })
    }
}

fn cli() -> Command {
    Command::new("pg_receivewal")
        .about("Stream write-ahead log segments from a running database cluster")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("dir")
                .short('D')
                .long("dir")
                .help("Directory to write received WAL segments into"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("conninfo")
                .long("conninfo")
                .help("host=... port=... style connection string, or host:port"),
        )
}

fn resolve_conninfo_addr(conninfo: &str) -> anyhow::Result<String> {
    if conninfo.contains('=') {
        let mut host = "localhost".to_string();
        let mut port = "5432".to_string();
        for kv in conninfo.split_whitespace() {
            match kv.split_once('=') {
                Some(("host", v)) => host = v.to_string(),
                Some(("port", v)) => port = v.to_string(),
                Some(_) | None => {}
            }
        }
        Ok(format!("{host}:{port}"))
    } else if conninfo.contains(':') {
        Ok(conninfo.to_string())
    } else {
        bail!("could not parse conninfo {conninfo:?}")
    }
}

/// Never asks the receive loop to stop early; the loop instead ends when
/// the server closes the stream (§4.7's only termination signal this
/// driver understands — there's no `--endpos`-style cutoff in §6.4).
struct RunToStreamEnd {
    verbose: bool,
}

#[async_trait::async_trait]
impl OnSegmentFinish for RunToStreamEnd {
    async fn on_segment_finish(&mut self, end: Lsn, timeline: u32) -> bool {
        if self.verbose {
            info!(%end, timeline, "closed WAL segment");
        }
        false
    }
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let args = match ReceiveArgs::from_matches(&cli().get_matches()) {
        Ok(a) => a,
        Err(e) => {
            eprintln!("pg_receivewal: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };

    let _ = utils::logging::init(utils::logging::LogFormat::Plain, utils::logging::Output::Stdout);

    match run(args).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("pg_receivewal: error: {e:#}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run(args: ReceiveArgs) -> anyhow::Result<()> {
    let addr = resolve_conninfo_addr(&args.conninfo)?;
    let stream = TcpStream::connect(&addr)
        .await
        .with_context(|| format!("connecting to {addr}"))?;
    let mut client = PostgresClient::new(stream);

    let (timeline, server_lsn) = identify_system(&mut client).await?;

    tokio::fs::create_dir_all(&args.dir)
        .await
        .with_context(|| format!("creating {}", args.dir))?;

    let on_finish = RunToStreamEnd {
        verbose: args.verbose,
    };
    let mut receiver = WalReceiver::new(&args.dir, timeline, on_finish);
    let start = receiver.resolve_start(server_lsn).await?;

    client
        .send_query(&format!("START_REPLICATION {start}"))
        .await
        .context("sending START_REPLICATION command")?;
    match client.read_be_message().await {
        Ok(BeMessageParsed::CopyBothResponse) => {}
        Ok(other) => bail!("expected copy-both response, got {other:?}"),
        Err(e) => bail!("connection error before streaming began: {e}"),
    }

    if args.verbose {
        info!(%start, timeline, "streaming WAL");
    }

    let clean = receive_wal_stream(&mut client, &mut receiver).await?;
    if !clean {
        bail!("connection closed before the WAL stream ended cleanly");
    }
    Ok(())
}

/// Issues `IDENTIFY_SYSTEM` and parses its 3-column result (§6.1): column 2
/// is the timeline as ASCII decimal, column 3 the current LSN as `%X/%X`.
async fn identify_system<IO>(client: &mut PostgresClient<IO>) -> anyhow::Result<(u32, Lsn)>
where
    IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    client
        .send_query("IDENTIFY_SYSTEM")
        .await
        .context("sending IDENTIFY_SYSTEM command")?;

    match client.read_be_message().await? {
        BeMessageParsed::RowDescription(_) => {}
        other => bail!("expected row description, got {other:?}"),
    }
    let row = match client.read_be_message().await? {
        BeMessageParsed::DataRow(cols) => cols,
        other => bail!("expected data row, got {other:?}"),
    };
    match client.read_be_message().await? {
        BeMessageParsed::CommandComplete(_) => {}
        other => bail!("expected command-complete, got {other:?}"),
    }

    if row.len() < 3 {
        bail!("IDENTIFY_SYSTEM returned {} columns, expected 3", row.len());
    }
    let timeline: u32 = column_text(&row, 1)
        .context("missing timeline column")?
        .parse()
        .context("timeline column is not a decimal integer")?;
    let lsn: Lsn = column_text(&row, 2)
        .context("missing LSN column")?
        .parse()
        .map_err(|_| anyhow::anyhow!("LSN column is not in %X/%X form"))?;
    Ok((timeline, lsn))
}

fn column_text(row: &[Option<bytes::Bytes>], idx: usize) -> Option<String> {
    row.get(idx)
        .and_then(|v| v.as_ref())
        .map(|b| String::from_utf8_lossy(b).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_dir() {
        let m = cli().try_get_matches_from(["pg_receivewal"]).unwrap();
        assert!(ReceiveArgs::from_matches(&m).is_err());
    }

    #[test]
    fn accepts_dir() {
        let m = cli()
            .try_get_matches_from(["pg_receivewal", "--dir", "/tmp/wal"])
            .unwrap();
        let args = ReceiveArgs::from_matches(&m).unwrap();
        assert_eq!(args.dir, Utf8PathBuf::from("/tmp/wal"));
    }

    #[test]
    fn conninfo_parses_key_value_form() {
        let addr = resolve_conninfo_addr("host=db1 port=5433").unwrap();
        assert_eq!(addr, "db1:5433");
    }
}
