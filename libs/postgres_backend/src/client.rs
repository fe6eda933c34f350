//! The receiver-side counterpart to `PostgresBackend`: a thin typed-message
//! connection the CLI drivers (`pg_basebackup`, `pg_receivewal`) use to
//! issue `IDENTIFY_SYSTEM` / `BASE_BACKUP` / `START_REPLICATION` (§6.1) and
//! read the header rows and copy-out/copy-both bytes that come back. This
//! is the "generic typed-message connection API" §1 grants the receiver.

use pq_proto::framed::{self, BeMessageParsed, FramedReadError};
use pq_proto::FeMessage;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::CopyStreamHandlerEnd;

/// Wraps a duplex byte stream on the client side of a replication
/// connection. Unlike `PostgresBackend`, there's no split/unsplit here:
/// the CLI drivers never need concurrent read+write the way the WAL
/// sender pairs outbound `XLogData` with inbound standby status updates
/// (§1 scopes client-side flow control feedback out).
pub struct PostgresClient<IO> {
    stream: IO,
}

impl<IO: AsyncRead + AsyncWrite + Unpin> PostgresClient<IO> {
    pub fn new(stream: IO) -> Self {
        PostgresClient { stream }
    }

    pub fn into_inner(self) -> IO {
        self.stream
    }

    /// Issues a simple-query command (§6.1's `IDENTIFY_SYSTEM`,
    /// `BASE_BACKUP LABEL ...`, `START_REPLICATION ...` strings).
    pub async fn send_query(&mut self, sql: &str) -> Result<(), std::io::Error> {
        let bytes = FeMessage::Query(sql.to_string()).to_bytes();
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await
    }

    /// Reads one backend message (§6.1/§6.2's row description, data row,
    /// command-complete, copy-out/copy-both response, or raw copy-data).
    pub async fn read_be_message(&mut self) -> Result<BeMessageParsed, CopyStreamHandlerEnd> {
        match framed::read_be_message(&mut self.stream).await {
            Ok(msg) => Ok(msg),
            Err(FramedReadError::Eof) => Err(CopyStreamHandlerEnd::Disconnected),
            Err(e) => Err(CopyStreamHandlerEnd::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                e,
            ))),
        }
    }

    /// Borrows the underlying stream directly, for callers (C5/C6/C7) that
    /// need to read a raw `CopyData` byte stream without this wrapper's
    /// message-level framing getting in the way — they expect an
    /// already-demultiplexed source, so the caller drains `CopyData`
    /// payloads through `read_be_message` and feeds the inner bytes in.
    pub fn get_mut(&mut self) -> &mut IO {
        &mut self.stream
    }
}
