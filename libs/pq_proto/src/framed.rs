//! Decodes tagged protocol messages from a byte stream: tag byte, a 4-byte
//! big-endian length (including itself), then `length - 4` bytes of
//! payload. `read_message` decodes frontend messages, the direction
//! `PostgresBackend` (server side) reads; `read_be_message` decodes
//! backend messages, the direction a CLI driver (client side) reads.

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncReadExt};
use utils::lsn::Lsn;

use crate::FeMessage;

#[derive(Debug, thiserror::Error)]
pub enum FramedReadError {
    #[error("connection closed")]
    Eof,
    #[error("malformed message: {0}")]
    Malformed(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

struct RawFrame {
    tag: u8,
    payload: Vec<u8>,
}

async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> Result<RawFrame, FramedReadError> {
    let mut tag = [0u8; 1];
    match stream.read_exact(&mut tag).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FramedReadError::Eof)
        }
        Err(e) => return Err(e.into()),
    }

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = i32::from_be_bytes(len_buf) as usize;
    if len < 4 {
        return Err(FramedReadError::Malformed("length prefix shorter than itself"));
    }
    let mut payload = vec![0u8; len - 4];
    stream.read_exact(&mut payload).await?;
    Ok(RawFrame { tag: tag[0], payload })
}

/// Reads one tagged frontend message: a 1-byte tag, a 4-byte big-endian
/// length (including itself), then `length - 4` bytes of payload.
pub async fn read_message<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> Result<FeMessage, FramedReadError> {
    let frame = read_frame(stream).await?;
    match frame.tag {
        b'd' => Ok(FeMessage::CopyData(Bytes::from(frame.payload))),
        b'c' => Ok(FeMessage::CopyDone),
        b'r' => parse_standby_status_update(&frame.payload),
        _ => Err(FramedReadError::Malformed("unexpected message tag")),
    }
}

/// One column of a decoded `RowDescription`. Only the name is kept; this
/// subsystem's CLI drivers only ever need to know column order, not type
/// metadata, since every value here travels as text (§6.2).
#[derive(Clone, Debug)]
pub struct ColumnName(pub String);

/// Backend messages this subsystem's receiver-side CLI drivers read back
/// off a connection, mirroring `BeMessage`'s write-side variants one for
/// one (minus `XLogData`/`KeepAlive`, which travel nested inside a
/// `CopyData` payload and are decoded by `wal_receive::parse_xlog_data`
/// instead of here).
#[derive(Clone, Debug)]
pub enum BeMessageParsed {
    RowDescription(Vec<ColumnName>),
    DataRow(Vec<Option<Bytes>>),
    CommandComplete(String),
    CopyOutResponse,
    CopyBothResponse,
    CopyData(Bytes),
    CopyDone,
}

/// Reads one tagged backend message the way a replication client (the
/// CLI drivers' connection) would, inverting `BeMessage::write`.
pub async fn read_be_message<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> Result<BeMessageParsed, FramedReadError> {
    let frame = read_frame(stream).await?;
    match frame.tag {
        b'T' => parse_row_description(&frame.payload),
        b'D' => parse_data_row(&frame.payload),
        b'C' => parse_command_complete(&frame.payload),
        b'H' => Ok(BeMessageParsed::CopyOutResponse),
        b'W' => Ok(BeMessageParsed::CopyBothResponse),
        b'd' => Ok(BeMessageParsed::CopyData(Bytes::from(frame.payload))),
        b'c' => Ok(BeMessageParsed::CopyDone),
        _ => Err(FramedReadError::Malformed("unexpected message tag")),
    }
}

fn parse_row_description(payload: &[u8]) -> Result<BeMessageParsed, FramedReadError> {
    let mut buf = payload;
    if buf.len() < 2 {
        return Err(FramedReadError::Malformed("short row description"));
    }
    let count = buf.get_i16() as usize;
    let mut columns = Vec::with_capacity(count);
    for _ in 0..count {
        let name = read_cstr(&mut buf)?;
        if buf.len() < 4 + 2 + 4 + 2 + 4 + 2 {
            return Err(FramedReadError::Malformed("truncated row description field"));
        }
        buf.advance(4 + 2 + 4 + 2 + 4 + 2); // table oid, attnum, typoid, typlen, typmod, format
        columns.push(ColumnName(name));
    }
    Ok(BeMessageParsed::RowDescription(columns))
}

fn parse_data_row(payload: &[u8]) -> Result<BeMessageParsed, FramedReadError> {
    let mut buf = payload;
    if buf.len() < 2 {
        return Err(FramedReadError::Malformed("short data row"));
    }
    let count = buf.get_i16() as usize;
    let mut cols = Vec::with_capacity(count);
    for _ in 0..count {
        if buf.len() < 4 {
            return Err(FramedReadError::Malformed("truncated data row column length"));
        }
        let len = buf.get_i32();
        if len < 0 {
            cols.push(None);
        } else {
            let len = len as usize;
            if buf.len() < len {
                return Err(FramedReadError::Malformed("truncated data row column value"));
            }
            cols.push(Some(Bytes::copy_from_slice(&buf[..len])));
            buf.advance(len);
        }
    }
    Ok(BeMessageParsed::DataRow(cols))
}

fn parse_command_complete(payload: &[u8]) -> Result<BeMessageParsed, FramedReadError> {
    let tag = std::str::from_utf8(payload)
        .map_err(|_| FramedReadError::Malformed("command complete tag is not UTF-8"))?
        .trim_end_matches('\0')
        .to_string();
    Ok(BeMessageParsed::CommandComplete(tag))
}

fn read_cstr(buf: &mut &[u8]) -> Result<String, FramedReadError> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(FramedReadError::Malformed("missing null terminator"))?;
    let s = std::str::from_utf8(&buf[..end])
        .map_err(|_| FramedReadError::Malformed("field name is not UTF-8"))?
        .to_string();
    buf.advance(end + 1);
    Ok(s)
}

fn parse_standby_status_update(payload: &[u8]) -> Result<FeMessage, FramedReadError> {
    let mut buf = payload;
    if buf.len() < 8 * 3 + 8 + 1 {
        return Err(FramedReadError::Malformed("short standby status update"));
    }
    let write_lsn = Lsn(buf.get_u64());
    let flush_lsn = Lsn(buf.get_u64());
    let apply_lsn = Lsn(buf.get_u64());
    let timestamp = buf.get_i64();
    let reply_requested = buf.get_u8() != 0;
    Ok(FeMessage::StandbyStatusUpdate {
        write_lsn,
        flush_lsn,
        apply_lsn,
        timestamp,
        reply_requested,
    })
}
