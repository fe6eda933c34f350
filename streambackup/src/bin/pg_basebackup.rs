//! CLI driver for the base-backup receiver (§6.1 `BASE_BACKUP`, §6.4 flags).
//! A thin `clap` front end over [`streambackup::session`]'s wire contract
//! and the C5/C6 receive paths; all protocol and filesystem work lives in
//! the library, the way `pageserver/src/bin/pageserver.rs` is a driver over
//! the `pageserver` library crate.

use anyhow::{bail, Context};
use camino::Utf8PathBuf;
use clap::{Arg, ArgAction, Command};
use postgres_backend::{BeMessageParsed, CopyStreamHandlerEnd, PostgresClient};
use tokio::net::TcpStream;
use tracing::info;

use streambackup::archive_sink::{ArchiveDestination, ArchiveSink, Compression};
use streambackup::error::{BackupError, Result};
use streambackup::progress::ProgressTracker;
use streambackup::unpack::{Unpacker, UnpackOptions};

#[derive(Clone, Debug)]
enum Destination {
    Unpack(Utf8PathBuf),
    Archive(ArchiveDestination, Compression),
}

#[derive(Clone, Debug)]
struct BackupArgs {
    destination: Destination,
    label: String,
    want_progress: bool,
    verbose: bool,
    conninfo: String,
}

impl BackupArgs {
    /// Applies §7(e)'s semantic checks before any connection is opened:
    /// exactly one of `--basedir`/`--tardir`, `--compress` only with
    /// `--tardir`, and `-` (stdout) only with no compression.
    fn from_matches(matches: &clap::ArgMatches) -> anyhow::Result<Self> {
        let basedir = matches.get_one::<String>("basedir");
        let tardir = matches.get_one::<String>("tardir");
        let compress = matches.get_one::<u32>("compress").copied();

        let destination = match (basedir, tardir) {
            (Some(_), Some(_)) => {
                bail!("--basedir and --tardir are mutually exclusive")
            }
            (None, None) => bail!("specify exactly one of --basedir or --tardir"),
            (Some(dir), None) => {
                if compress.is_some() {
                    bail!("--compress is only valid with --tardir");
                }
                Destination::Unpack(Utf8PathBuf::from(dir))
            }
            (None, Some(dir)) => {
                let compression = match compress {
                    Some(level) if level == 0 => Compression::None,
                    Some(level) if (1..=9).contains(&level) => Compression::Gzip(level),
                    Some(level) => bail!("--compress must be in 0..=9, got {level}"),
                    None => Compression::None,
                };
                if dir == "-" {
                    if matches!(compression, Compression::Gzip(_)) {
                        bail!("stdout output (`--tardir -`) does not support compression");
                    }
                    Destination::Archive(ArchiveDestination::Stdout, compression)
                } else {
                    Destination::Archive(
                        ArchiveDestination::Directory(Utf8PathBuf::from(dir)),
                        compression,
                    )
                }
            }
        };

        Ok(BackupArgs {
            destination,
            label: matches
                .get_one::<String>("label")
                .cloned()
                .unwrap_or_else(|| "pg_basebackup base backup".to_string()),
            want_progress: matches.get_flag("progress"),
            verbose: matches.get_flag("verbose"),
            conninfo: matches
                .get_one::<String>("conninfo")
                .cloned()
                .unwrap_or_else(|| "host=localhost port=5432".to_string()),
        })
    }
}

fn cli() -> Command {
    Command::new("pg_basebackup")
        .about("Take a base backup of a running database cluster")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("basedir")
                .short('D')
                .long("basedir")
                .help("Unpack the backup directly into this directory"),
        )
        .arg(
            Arg::new("tardir")
                .long("tardir")
                .help("Write tar-format archive files under this directory, or \"-\" for stdout"),
        )
        .arg(
            Arg::new("label")
                .short('l')
                .long("label")
                .help("Label to attach to the backup"),
        )
        .arg(
            Arg::new("progress")
                .short('P')
                .long("progress")
                .action(ArgAction::SetTrue)
                .help("Ask the server to report per-location size totals"),
        )
        .arg(
            Arg::new("compress")
                .long("compress")
                .value_parser(clap::value_parser!(u32))
                .help("Gzip compression level 0..9 (tardir mode only)"),
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

/// Parses a minimal conninfo string (`host=H port=P` or `host:port`) into a
/// `host:port` pair `TcpStream::connect` accepts. Full libpq conninfo
/// parsing (SSL modes, unix sockets, service files) is out of scope (§1).
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

fn escape_label(label: &str) -> String {
    label.replace('\'', "''")
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let args = match BackupArgs::from_matches(&cli().get_matches()) {
        Ok(a) => a,
        Err(e) => {
            eprintln!("pg_basebackup: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };

    let _ = utils::logging::init(utils::logging::LogFormat::Plain, utils::logging::Output::Stdout);

    match run(args).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("pg_basebackup: error: {e:#}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run(args: BackupArgs) -> anyhow::Result<()> {
    let addr = resolve_conninfo_addr(&args.conninfo)?;
    let stream = TcpStream::connect(&addr)
        .await
        .with_context(|| format!("connecting to {addr}"))?;
    let mut client = PostgresClient::new(stream);

    let mut query = format!("BASE_BACKUP LABEL '{}'", escape_label(&args.label));
    if args.want_progress {
        query.push_str(" PROGRESS");
    }
    client
        .send_query(&query)
        .await
        .context("sending BASE_BACKUP command")?;

    let progress = ProgressTracker::new();
    let mut batches = 0usize;

    loop {
        let msg = match client.read_be_message().await {
            Ok(m) => m,
            Err(CopyStreamHandlerEnd::Disconnected) => break,
            Err(e) => return Err(BackupError::Transport(e.to_string()).into()),
        };

        match msg {
            BeMessageParsed::RowDescription(_) => {
                let row = expect_data_row(&mut client).await?;
                let location_id = text_column(&row, 0);
                let location_path = text_column(&row, 1);
                let size_kb: u64 = text_column(&row, 2)
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
                progress.set_total_kb(size_kb);
                if location_id.is_some() {
                    progress.note_tablespace();
                }

                expect_command_complete(&mut client).await?;
                expect_copy_out(&mut client).await?;

                match &args.destination {
                    Destination::Unpack(basedir) => {
                        let target = match &location_path {
                            Some(p) => Utf8PathBuf::from(p),
                            None => basedir.clone(),
                        };
                        stream_to_unpacker(&mut client, &target).await?;
                    }
                    Destination::Archive(dest, compression) => {
                        stream_to_archive(&mut client, dest, location_id.as_deref(), *compression)
                            .await?;
                    }
                }

                progress.add_done_kb(size_kb);
                batches += 1;
                if args.verbose {
                    info!(
                        batch = batches,
                        location = location_id.as_deref().unwrap_or("primary"),
                        percent_done = progress.percent_done(),
                        "received batch"
                    );
                }
            }
            BeMessageParsed::CommandComplete(_) => break,
            other => bail!("unexpected message {other:?} while awaiting next batch"),
        }
    }

    if args.verbose {
        info!(
            batches,
            tablespaces = progress.tablespace_count(),
            "base backup complete"
        );
    }
    Ok(())
}

fn text_column(row: &[Option<bytes::Bytes>], idx: usize) -> Option<String> {
    row.get(idx)
        .and_then(|v| v.as_ref())
        .map(|b| String::from_utf8_lossy(b).into_owned())
}

async fn expect_data_row<IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin>(
    client: &mut PostgresClient<IO>,
) -> anyhow::Result<Vec<Option<bytes::Bytes>>> {
    match client.read_be_message().await? {
        BeMessageParsed::DataRow(cols) => Ok(cols),
        other => bail!("expected a data row, got {other:?}"),
    }
}

async fn expect_command_complete<IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin>(
    client: &mut PostgresClient<IO>,
) -> anyhow::Result<()> {
    match client.read_be_message().await? {
        BeMessageParsed::CommandComplete(_) => Ok(()),
        other => bail!("expected command-complete, got {other:?}"),
    }
}

async fn expect_copy_out<IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin>(
    client: &mut PostgresClient<IO>,
) -> anyhow::Result<()> {
    match client.read_be_message().await? {
        BeMessageParsed::CopyOutResponse => Ok(()),
        other => bail!("expected copy-out response, got {other:?}"),
    }
}

async fn stream_to_unpacker<IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin>(
    client: &mut PostgresClient<IO>,
    target_dir: &camino::Utf8Path,
) -> Result<()> {
    tokio::fs::create_dir_all(target_dir)
        .await
        .map_err(|e| BackupError::filesystem(target_dir.as_str(), e))?;
    let mut unpacker = Unpacker::new(target_dir, UnpackOptions::default());
    loop {
        match client
            .read_be_message()
            .await
            .map_err(|e| BackupError::Transport(e.to_string()))?
        {
            BeMessageParsed::CopyData(bytes) => unpacker.feed(&bytes).await?,
            BeMessageParsed::CopyDone => break,
            other => {
                return Err(BackupError::Protocol(format!(
                    "unexpected message {other:?} mid-archive"
                )))
            }
        }
    }
    unpacker.finish()
}

async fn stream_to_archive<IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin>(
    client: &mut PostgresClient<IO>,
    destination: &ArchiveDestination,
    location_id: Option<&str>,
    compression: Compression,
) -> Result<()> {
    let mut sink = ArchiveSink::create(destination, location_id, compression).await?;
    loop {
        match client
            .read_be_message()
            .await
            .map_err(|e| BackupError::Transport(e.to_string()))?
        {
            BeMessageParsed::CopyData(bytes) => sink.write_chunk(&bytes).await?,
            BeMessageParsed::CopyDone => break,
            other => {
                return Err(BackupError::Protocol(format!(
                    "unexpected message {other:?} mid-archive"
                )))
            }
        }
    }
    sink.finish().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches_for(args: &[&str]) -> clap::ArgMatches {
        cli().try_get_matches_from(args.iter().copied()).unwrap()
    }

    #[test]
    fn rejects_basedir_and_tardir_together() {
        let m = matches_for(&["pg_basebackup", "--basedir", "x", "--tardir", "y"]);
        assert!(BackupArgs::from_matches(&m).is_err());
    }

    #[test]
    fn rejects_neither_basedir_nor_tardir() {
        let m = matches_for(&["pg_basebackup"]);
        assert!(BackupArgs::from_matches(&m).is_err());
    }

    #[test]
    fn rejects_compress_with_basedir() {
        let m = matches_for(&["pg_basebackup", "--basedir", "x", "--compress", "3"]);
        assert!(BackupArgs::from_matches(&m).is_err());
    }

    #[test]
    fn rejects_compression_to_stdout() {
        let m = matches_for(&["pg_basebackup", "--tardir", "-", "--compress", "5"]);
        assert!(BackupArgs::from_matches(&m).is_err());
    }

    #[test]
    fn accepts_tardir_with_compression() {
        let m = matches_for(&["pg_basebackup", "--tardir", "out", "--compress", "6"]);
        let args = BackupArgs::from_matches(&m).unwrap();
        assert!(matches!(
            args.destination,
            Destination::Archive(ArchiveDestination::Directory(_), Compression::Gzip(6))
        ));
    }

    #[test]
    fn accepts_plain_basedir() {
        let m = matches_for(&["pg_basebackup", "--basedir", "/var/lib/pg"]);
        let args = BackupArgs::from_matches(&m).unwrap();
        assert!(matches!(args.destination, Destination::Unpack(_)));
    }

    #[test]
    fn conninfo_parses_key_value_form() {
        let addr = resolve_conninfo_addr("host=db1 port=5433").unwrap();
        assert_eq!(addr, "db1:5433");
    }

    #[test]
    fn conninfo_parses_host_port_form() {
        let addr = resolve_conninfo_addr("db1:5433").unwrap();
        assert_eq!(addr, "db1:5433");
    }
}
