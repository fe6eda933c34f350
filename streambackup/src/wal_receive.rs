//! WAL Receiver (C7): the mirror of C4 on the receiving side, grounded on
//! `receivelog.c`'s `ReceiveXlogStream`/`open_walfile`. Opens one segment
//! file per 16 MiB boundary, enforces strictly increasing write offsets,
//! `fsync`+closes on completion, and resumes past any `.partial` segment
//! left over from a previous run.

use async_trait::async_trait;
use camino::Utf8Path;
use postgres_backend::{BeMessageParsed, CopyStreamHandlerEnd, PostgresClient};
use postgres_ffi::{
    lsn_to_segno, parse_xlog_file_name, segno_to_lsn, xlog_segment_file_name, WAL_SEGMENT_SIZE,
};
use regex::Regex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};
use utils::lsn::Lsn;

use crate::error::{BackupError, Result};

/// 1-byte 'w' tag + 8-byte dataStart + 8-byte walEnd + 8-byte timestamp
/// (§4.7, matching C4's `STREAMING_HEADER_SIZE`).
pub const STREAMING_HEADER_SIZE: usize = 1 + 8 + 8 + 8;

/// Invoked once a segment has been `fsync`'d and closed. Returning `true`
/// asks the receive loop to stop cleanly (§4.7 step 6, "callback / control
/// inversion").
#[async_trait]
pub trait OnSegmentFinish: Send {
    async fn on_segment_finish(&mut self, end: Lsn, timeline: u32) -> bool;
}

/// A raw `XLogData` payload, already stripped of the outer `CopyData`
/// framing, as it would arrive from `pq_proto::framed`. Declared here
/// rather than imported from `pq_proto` so this module stays agnostic of
/// which transport delivered it (the streaming header is part of the
/// replication protocol body, not the `CopyData` envelope).
pub struct XLogDataChunk<'a> {
    pub wal_start: Lsn,
    pub data: &'a [u8],
}

/// Parses the `w` + dataStart + walEnd + timestamp header a `CopyData`
/// payload carries when it wraps `XLogData` (§4.7 step, mirrors C4's
/// `frame()`).
pub fn parse_xlog_data(payload: &[u8]) -> Result<XLogDataChunk<'_>> {
    if payload.len() < STREAMING_HEADER_SIZE {
        return Err(BackupError::Protocol(format!(
            "streaming header too small: {} bytes",
            payload.len()
        )));
    }
    if payload[0] != b'w' {
        return Err(BackupError::Protocol(format!(
            "streaming header corrupt: tag '{}'",
            payload[0] as char
        )));
    }
    let wal_start = Lsn(u64::from_be_bytes(payload[1..9].try_into().unwrap()));
    Ok(XLogDataChunk {
        wal_start,
        data: &payload[STREAMING_HEADER_SIZE..],
    })
}

struct OpenSegment {
    file: tokio::fs::File,
    name: String,
    segno: u64,
    offset: u64,
}

/// Drives the receive loop over a sequence of already-demultiplexed
/// `XLogData` chunks. Callers feed chunks from whatever transport they
/// read `CopyData` messages off; this module owns only segment-file
/// lifecycle, not connection I/O.
pub struct WalReceiver<C: OnSegmentFinish> {
    dir: camino::Utf8PathBuf,
    timeline: u32,
    current: Option<OpenSegment>,
    on_finish: C,
}

impl<C: OnSegmentFinish> WalReceiver<C> {
    pub fn new(dir: &Utf8Path, timeline: u32, on_finish: C) -> Self {
        WalReceiver {
            dir: dir.to_path_buf(),
            timeline,
            current: None,
            on_finish,
        }
    }

    /// Resolves the actual start position: scans `dir` for existing
    /// segments of this timeline, renames any incomplete one found to
    /// `.partial`, and returns the end of the highest completed segment if
    /// there is one (§4.7 "Resumption"), else `server_provided_start`.
    pub async fn resolve_start(&self, server_provided_start: Lsn) -> Result<Lsn> {
        let name_re = Regex::new(r"^[0-9A-F]{24}$").expect("static regex");
        let mut highest_complete: Option<u64> = None;

        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(server_provided_start),
            Err(e) => return Err(BackupError::filesystem(self.dir.as_str(), e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| BackupError::filesystem(self.dir.as_str(), e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name_re.is_match(&name) {
                continue;
            }
            let (name_timeline, segno, _) = match parse_xlog_file_name(&name) {
                Ok(parsed) => parsed,
                Err(_) => continue,
            };
            if name_timeline != self.timeline {
                continue;
            }

            let meta = entry
                .metadata()
                .await
                .map_err(|e| BackupError::filesystem(&name, e))?;

            if meta.len() == WAL_SEGMENT_SIZE {
                highest_complete = Some(highest_complete.map_or(segno, |h| h.max(segno)));
            } else {
                let path = self.dir.join(&name);
                let partial_path = self.dir.join(format!("{name}.partial"));
                tokio::fs::rename(&path, &partial_path)
                    .await
                    .map_err(|e| BackupError::filesystem(path.as_str(), e))?;
                warn!(segment = %name, "renamed incomplete WAL segment to .partial on startup");
            }
        }

        match highest_complete {
            Some(segno) => Ok(segno_to_lsn(segno + 1, WAL_SEGMENT_SIZE)),
            None => Ok(server_provided_start),
        }
    }

    /// Feeds one `XLogData` chunk through the receive state machine,
    /// returning `true` once `on_segment_finish` has asked for a clean
    /// stop (§4.7 steps 1-6).
    pub async fn feed(&mut self, chunk: XLogDataChunk<'_>) -> Result<bool> {
        let segno = lsn_to_segno(chunk.wal_start, WAL_SEGMENT_SIZE);
        let offset_in_segment = chunk.wal_start.0 % WAL_SEGMENT_SIZE;

        match &self.current {
            None => {
                if offset_in_segment != 0 {
                    return Err(BackupError::Invariant(format!(
                        "received xlog record for offset {offset_in_segment} with no file open"
                    )));
                }
                self.current = Some(self.open_segment(segno).await?);
            }
            Some(open) => {
                if open.segno != segno || open.offset != offset_in_segment {
                    return Err(BackupError::Invariant(format!(
                        "WAL data offset error: got segno={segno} offset={offset_in_segment}, expected segno={} offset={}",
                        open.segno, open.offset
                    )));
                }
            }
        }

        let open = self.current.as_mut().expect("just ensured Some");
        open.file
            .write_all(chunk.data)
            .await
            .map_err(|e| BackupError::filesystem(&open.name, e))?;
        open.offset += chunk.data.len() as u64;

        if open.offset == WAL_SEGMENT_SIZE {
            let mut finished = self.current.take().expect("checked above");
            finished
                .file
                .sync_all()
                .await
                .map_err(|e| BackupError::filesystem(&finished.name, e))?;
            drop(finished.file);
            info!(segment = %finished.name, "closed and fsynced completed WAL segment");

            let end = segno_to_lsn(finished.segno + 1, WAL_SEGMENT_SIZE);
            return Ok(self.on_finish.on_segment_finish(end, self.timeline).await);
        }

        Ok(false)
    }

    async fn open_segment(&self, segno: u64) -> Result<OpenSegment> {
        let name = xlog_segment_file_name(self.timeline, segno);
        let path = self.dir.join(&name);
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| BackupError::filesystem(path.as_str(), e))?;
        Ok(OpenSegment {
            file,
            name,
            segno,
            offset: 0,
        })
    }
}

/// Drives the full receive loop (§4.7) over a connection already past
/// `START_REPLICATION`: reads `CopyData` frames, decodes the streaming
/// header, and feeds the payload through `receiver` until the stream ends.
/// Returns `Ok(true)` for a clean end (the server's own `CopyDone`, or
/// `on_segment_finish` asking to stop), `Ok(false)` if the connection drops
/// first (§4.7 "At stream end").
pub async fn receive_wal_stream<IO, C>(
    conn: &mut PostgresClient<IO>,
    receiver: &mut WalReceiver<C>,
) -> Result<bool>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send,
    C: OnSegmentFinish,
{
    loop {
        let msg = match conn.read_be_message().await {
            Ok(m) => m,
            Err(CopyStreamHandlerEnd::Disconnected) => return Ok(false),
            Err(e) => return Err(BackupError::Transport(e.to_string())),
        };
        match msg {
            BeMessageParsed::CopyData(bytes) => {
                let chunk = parse_xlog_data(&bytes)?;
                if receiver.feed(chunk).await? {
                    return Ok(true);
                }
            }
            BeMessageParsed::CopyDone => return Ok(true),
            other => {
                return Err(BackupError::Protocol(format!(
                    "unexpected message while streaming WAL: {other:?}"
                )))
            }
        }
    }
}
