//! A thin stand-in for the real Postgres backend wire protocol: startup
//! handshake, authentication and simple-query parsing are assumed to have
//! already happened by the time anything in this subsystem runs (out of
//! scope for streaming backup/WAL shipping). What's left, and what this
//! crate actually provides, is the part the backup and WAL-sender code
//! paths (C3/C4) touch directly: writing typed `BeMessage`s, switching a
//! connection into `COPY BOTH` mode, and reading the frontend messages
//! (`CopyData`, `CopyDone`, standby status updates) that arrive on it.

use bytes::BytesMut;
use pq_proto::framed::{self, FramedReadError};
use pq_proto::{BeMessage, FeMessage};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

mod client;
mod copy_data_writer;
mod error;
pub use client::PostgresClient;
pub use copy_data_writer::CopyDataWriter;
pub use error::{CopyStreamHandlerEnd, QueryError};
pub use pq_proto::framed::BeMessageParsed;

/// Wraps a duplex byte stream that has already completed the startup
/// handshake, providing message-level read/write on top of it.
pub struct PostgresBackend<IO> {
    stream: IO,
    write_buf: BytesMut,
}

impl<IO: AsyncRead + AsyncWrite + Unpin> PostgresBackend<IO> {
    pub fn new(stream: IO) -> Self {
        PostgresBackend {
            stream,
            write_buf: BytesMut::new(),
        }
    }

    /// Buffers a message without flushing, returning `self` so callers can
    /// chain several writes before a single `flush()`.
    pub fn write_message_noflush(
        &mut self,
        msg: &BeMessage<'_>,
    ) -> Result<&mut Self, std::io::Error> {
        msg.write(&mut self.write_buf);
        Ok(self)
    }

    pub async fn write_message(&mut self, msg: &BeMessage<'_>) -> Result<(), std::io::Error> {
        self.write_message_noflush(msg)?;
        self.flush().await
    }

    pub async fn flush(&mut self) -> Result<(), std::io::Error> {
        if !self.write_buf.is_empty() {
            self.stream.write_all(&self.write_buf).await?;
            self.write_buf.clear();
        }
        self.stream.flush().await
    }

    /// Sends `CopyBothResponse`, putting the connection into the mode C4's
    /// WAL streamer and C7's WAL receiver both run over.
    pub async fn start_copy_both(&mut self) -> Result<(), std::io::Error> {
        self.write_message(&BeMessage::CopyBothResponse).await
    }

    pub async fn read_copy_message(&mut self) -> Result<FeMessage, CopyStreamHandlerEnd> {
        match framed::read_message(&mut self.stream).await {
            Ok(msg) => Ok(msg),
            Err(FramedReadError::Eof) => Err(CopyStreamHandlerEnd::Disconnected),
            Err(e) => Err(CopyStreamHandlerEnd::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                e,
            ))),
        }
    }

    /// Splits into independent read/write halves so a sender task and a
    /// keepalive/feedback-reading task can run concurrently, the way C4's
    /// WAL streamer pairs outbound `XLogData` with inbound standby status
    /// updates.
    pub fn split(self) -> (PostgresBackendReader<IO>, PostgresBackendWriter<IO>) {
        let (rh, wh) = tokio::io::split(self.stream);
        (
            PostgresBackendReader { stream: rh },
            PostgresBackendWriter {
                stream: wh,
                write_buf: self.write_buf,
            },
        )
    }

    pub fn unsplit(reader: PostgresBackendReader<IO>, writer: PostgresBackendWriter<IO>) -> Self {
        PostgresBackend {
            stream: reader.stream.unsplit(writer.stream),
            write_buf: writer.write_buf,
        }
    }
}

pub struct PostgresBackendReader<IO> {
    stream: ReadHalf<IO>,
}

impl<IO: AsyncRead + Unpin> PostgresBackendReader<IO> {
    pub async fn read_copy_message(&mut self) -> Result<FeMessage, CopyStreamHandlerEnd> {
        match framed::read_message(&mut self.stream).await {
            Ok(msg) => Ok(msg),
            Err(FramedReadError::Eof) => Err(CopyStreamHandlerEnd::Disconnected),
            Err(e) => Err(CopyStreamHandlerEnd::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                e,
            ))),
        }
    }
}

pub struct PostgresBackendWriter<IO> {
    stream: WriteHalf<IO>,
    write_buf: BytesMut,
}

impl<IO: AsyncWrite + Unpin> PostgresBackendWriter<IO> {
    pub fn write_message_noflush(
        &mut self,
        msg: &BeMessage<'_>,
    ) -> Result<&mut Self, std::io::Error> {
        msg.write(&mut self.write_buf);
        Ok(self)
    }

    pub async fn flush(&mut self) -> Result<(), std::io::Error> {
        if !self.write_buf.is_empty() {
            self.stream.write_all(&self.write_buf).await?;
            self.write_buf.clear();
        }
        self.stream.flush().await
    }
}

/// Reads one frontend byte stream as a raw source, used by binaries that
/// speak this subsystem's framing directly over a plain TCP socket rather
/// than through `PostgresBackend`. Kept separate so C5/C6 (which parse a
/// tar stream, not message-framed protocol traffic) don't need to pull in
/// message framing at all.
pub async fn read_raw<IO: AsyncRead + Unpin>(
    stream: &mut IO,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    stream.read(buf).await
}
