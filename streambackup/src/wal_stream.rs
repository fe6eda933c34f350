//! WAL streamer, sender side (C4): frames outbound WAL bytes as
//! segment-boundary-aware `copy-data` chunks. Not a transport of its own —
//! WAL generation and storage are out of scope (§1) — so the byte source
//! is an injected `WalSource`, the same way `send_wal.rs`'s `WalSender`
//! wraps a `WalReader` it doesn't own the lifecycle of.

use pq_proto::{BeMessage, XLogDataBody};
use postgres_ffi::{lsn_to_segno, segno_to_lsn, WAL_SEGMENT_SIZE};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::trace;
use utils::lsn::Lsn;

use crate::error::{BackupError, Result};

/// `'w'` tag + 8 bytes start-LSN + 8 reserved + 8 reserved (§4.4).
pub const STREAMING_HEADER_SIZE: usize = 1 + 8 + 8 + 8;

/// Upper bound on a single chunk, independent of segment size; mirrors the
/// teacher's own fixed send buffer rather than growing per connection.
pub const MAX_SEND_SIZE: usize = 128 * 1024;

/// An abstract source of not-yet-shipped WAL bytes. `read` returns `0` to
/// mean "nothing more is available right now", which the caller of
/// `stream_wal` treats as "stop for this call", not end of stream — the
/// real sender would re-poll or await a wakeup; that orchestration lives
/// above this module, in whatever drives the connection loop.
#[async_trait::async_trait]
pub trait WalSource: Send {
    async fn read(&mut self, start: Lsn, buf: &mut [u8]) -> Result<usize>;
}

/// Streams WAL starting at `start` until `source.read` reports nothing
/// left to send, returning the new position so the caller can resume
/// later. Every chunk sent is wholly inside one segment (§3 WalBlock
/// invariant, §8 invariant 4's block-alignment half).
pub async fn stream_wal<W, S>(
    conn: &mut W,
    source: &mut S,
    mut start: Lsn,
    wal_end: Lsn,
) -> Result<Lsn>
where
    W: AsyncWrite + Unpin,
    S: WalSource,
{
    let mut buf = vec![0u8; MAX_SEND_SIZE];

    loop {
        let segno = lsn_to_segno(start, WAL_SEGMENT_SIZE);
        let segment_end = segno_to_lsn(segno + 1, WAL_SEGMENT_SIZE);
        let chunk_cap = std::cmp::min(MAX_SEND_SIZE as u64, u64::from(segment_end) - u64::from(start));
        if chunk_cap == 0 {
            return Err(BackupError::Invariant(
                "WAL chunk capacity collapsed to zero at segment boundary".into(),
            ));
        }

        let n = source.read(start, &mut buf[..chunk_cap as usize]).await?;
        if n == 0 {
            return Ok(start);
        }

        conn.write_all(&frame(start, wal_end, &buf[..n]))
            .await
            .map_err(|e| BackupError::filesystem("wal connection", e))?;

        trace!(start_lsn = %start, len = n, "sent WAL chunk");
        start = start
            .checked_add(n as u64)
            .ok_or_else(|| BackupError::Invariant("LSN overflow while streaming WAL".into()))?;
    }
}

fn frame(wal_start: Lsn, wal_end: Lsn, data: &[u8]) -> bytes::Bytes {
    let body = XLogDataBody {
        wal_start,
        wal_end,
        timestamp: current_timestamp(),
        data,
    };
    BeMessage::XLogData(body).to_bytes()
}

fn current_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FixedSource {
        data: Vec<u8>,
        offset: usize,
    }

    #[async_trait::async_trait]
    impl WalSource for FixedSource {
        async fn read(&mut self, _start: Lsn, buf: &mut [u8]) -> Result<usize> {
            let remaining = self.data.len() - self.offset;
            let n = std::cmp::min(remaining, buf.len());
            buf[..n].copy_from_slice(&self.data[self.offset..self.offset + n]);
            self.offset += n;
            Ok(n)
        }
    }

    #[tokio::test]
    async fn streams_until_source_is_dry() {
        let mut source = FixedSource {
            data: vec![1u8; 10_000],
            offset: 0,
        };
        let mut sink = Vec::new();
        let start = Lsn(WAL_SEGMENT_SIZE * 3);
        let end = start.checked_add(10_000).unwrap();
        let new_pos = stream_wal(&mut sink, &mut source, start, end).await.unwrap();
        assert_eq!(new_pos, end);
        assert!(!sink.is_empty());
    }

    #[tokio::test]
    async fn chunk_never_crosses_segment_boundary() {
        let segment_end = segno_to_lsn(1, WAL_SEGMENT_SIZE);
        let start = segment_end.checked_sub(100).unwrap();
        let source_data = Mutex::new(Vec::<(Lsn, usize)>::new());

        struct RecordingSource<'a> {
            log: &'a Mutex<Vec<(Lsn, usize)>>,
            remaining: usize,
        }

        #[async_trait::async_trait]
        impl<'a> WalSource for RecordingSource<'a> {
            async fn read(&mut self, start: Lsn, buf: &mut [u8]) -> Result<usize> {
                if self.remaining == 0 {
                    return Ok(0);
                }
                let n = std::cmp::min(self.remaining, buf.len());
                self.log.lock().unwrap().push((start, n));
                self.remaining -= n;
                Ok(n)
            }
        }

        let mut source = RecordingSource {
            log: &source_data,
            remaining: 300,
        };
        let mut sink = Vec::new();
        let end = start.checked_add(300).unwrap();
        stream_wal(&mut sink, &mut source, start, end).await.unwrap();

        for (chunk_start, len) in source_data.lock().unwrap().iter() {
            let chunk_end = chunk_start.checked_add(*len as u64).unwrap();
            assert!(u64::from(chunk_end) <= u64::from(segment_end));
        }
    }
}
