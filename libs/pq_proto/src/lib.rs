//! Typed backend ("server to client") messages for the subset of the
//! Postgres replication/copy protocol this subsystem needs: enough to
//! describe a base backup's tablespace manifest, switch into `COPY BOTH`,
//! and frame outgoing WAL as `CopyData`. Encoding follows the real wire
//! format (1-byte tag + big-endian `i32` length prefix + payload) but only
//! for the message kinds actually used here.

use bytes::{BufMut, Bytes, BytesMut};
use utils::lsn::Lsn;

pub mod framed;

/// One column of a `RowDescription` message.
#[derive(Clone, Debug)]
pub struct RowDescriptor {
    pub name: &'static str,
    /// Postgres OID of the column's type. `25` is `text`, `20` is `int8`.
    pub typoid: i32,
    pub typlen: i16,
}

impl RowDescriptor {
    pub const fn text_col(name: &'static str) -> Self {
        RowDescriptor {
            name,
            typoid: 25,
            typlen: -1,
        }
    }

    /// OID columns (e.g. `spcoid`) carry a 4-byte big-endian binary integer
    /// in the data row, unlike every other column here (which travels as
    /// ASCII text) — `typlen = 4` reflects that literal wire width.
    pub const fn oid_col(name: &'static str) -> Self {
        RowDescriptor {
            name,
            typoid: 26,
            typlen: 4,
        }
    }

    pub const fn int8_col(name: &'static str) -> Self {
        RowDescriptor {
            name,
            typoid: 20,
            typlen: 8,
        }
    }
}

/// The fixed 25-byte header Postgres prepends to every `CopyData` chunk
/// carrying WAL bytes during `START_REPLICATION`: a `'w'` tag, the
/// starting LSN of the chunk, the current end-of-WAL LSN, and a send
/// timestamp.
#[derive(Clone, Debug)]
pub struct XLogDataBody<'a> {
    pub wal_start: Lsn,
    pub wal_end: Lsn,
    pub timestamp: i64,
    pub data: &'a [u8],
}

#[derive(Clone, Debug)]
pub struct WalSndKeepAlive {
    pub wal_end: Lsn,
    pub timestamp: i64,
    pub request_reply: bool,
}

/// Backend-to-frontend messages this subsystem emits. Variants are named
/// after their real Postgres message type names.
#[derive(Clone, Debug)]
pub enum BeMessage<'a> {
    RowDescription(&'a [RowDescriptor]),
    DataRow(&'a [Option<&'a [u8]>]),
    CommandComplete(&'a str),
    CopyOutResponse,
    CopyBothResponse,
    CopyData(&'a [u8]),
    CopyDone,
    XLogData(XLogDataBody<'a>),
    KeepAlive(WalSndKeepAlive),
}

impl BeMessage<'_> {
    /// Encodes this message onto `buf` using the tag-byte + length-prefix
    /// framing every Postgres backend message shares.
    pub fn write(&self, buf: &mut BytesMut) {
        match self {
            BeMessage::RowDescription(fields) => {
                let mut body = BytesMut::new();
                body.put_i16(fields.len() as i16);
                for f in *fields {
                    body.put_slice(f.name.as_bytes());
                    body.put_u8(0);
                    body.put_i32(0); // table oid, unused
                    body.put_i16(0); // column attnum, unused
                    body.put_i32(f.typoid);
                    body.put_i16(f.typlen);
                    body.put_i32(-1); // type modifier
                    body.put_i16(0); // format code: text
                }
                write_tagged(buf, b'T', &body);
            }
            BeMessage::DataRow(cols) => {
                let mut body = BytesMut::new();
                body.put_i16(cols.len() as i16);
                for c in *cols {
                    match c {
                        Some(v) => {
                            body.put_i32(v.len() as i32);
                            body.put_slice(v);
                        }
                        None => body.put_i32(-1),
                    }
                }
                write_tagged(buf, b'D', &body);
            }
            BeMessage::CommandComplete(tag) => {
                let mut body = BytesMut::new();
                body.put_slice(tag.as_bytes());
                body.put_u8(0);
                write_tagged(buf, b'C', &body);
            }
            BeMessage::CopyOutResponse => {
                let mut body = BytesMut::new();
                body.put_u8(0); // overall format: text
                body.put_i16(0); // zero columns, count fixed up by caller if needed
                write_tagged(buf, b'H', &body);
            }
            BeMessage::CopyBothResponse => {
                let mut body = BytesMut::new();
                body.put_u8(0);
                body.put_i16(0);
                write_tagged(buf, b'W', &body);
            }
            BeMessage::CopyData(data) => write_tagged(buf, b'd', data),
            BeMessage::CopyDone => write_tagged(buf, b'c', &[]),
            BeMessage::XLogData(body) => {
                let mut payload = BytesMut::with_capacity(25 + body.data.len());
                payload.put_u8(b'w');
                payload.put_u64(body.wal_start.into());
                payload.put_u64(body.wal_end.into());
                payload.put_i64(body.timestamp);
                payload.put_slice(body.data);
                write_tagged(buf, b'd', &payload);
            }
            BeMessage::KeepAlive(ka) => {
                let mut payload = BytesMut::with_capacity(18);
                payload.put_u8(b'k');
                payload.put_u64(ka.wal_end.into());
                payload.put_i64(ka.timestamp);
                payload.put_u8(ka.request_reply as u8);
                write_tagged(buf, b'd', &payload);
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.write(&mut buf);
        buf.freeze()
    }
}

fn write_tagged(buf: &mut BytesMut, tag: u8, body: &[u8]) {
    buf.put_u8(tag);
    buf.put_i32(body.len() as i32 + 4);
    buf.put_slice(body);
}

/// Frontend-to-backend messages this subsystem needs to read or write: a
/// simple-query string (the CLI drivers' only way to issue `IDENTIFY_SYSTEM`
/// / `BASE_BACKUP` / `START_REPLICATION`, §6.1), the replication-mode
/// standby status update (`'r'`), and copy termination.
#[derive(Clone, Debug)]
pub enum FeMessage {
    Query(String),
    StandbyStatusUpdate {
        write_lsn: Lsn,
        flush_lsn: Lsn,
        apply_lsn: Lsn,
        timestamp: i64,
        reply_requested: bool,
    },
    CopyData(Bytes),
    CopyDone,
}

impl FeMessage {
    /// Encodes this message for the client (receiver) side to send. Only
    /// `Query` and the copy-mode variants are ever written by this
    /// subsystem's CLI drivers; `StandbyStatusUpdate` is written by a real
    /// `libpq`-based client but this implementation's WAL receiver doesn't
    /// send feedback (§1 scopes flow control out).
    pub fn write(&self, buf: &mut BytesMut) {
        match self {
            FeMessage::Query(sql) => {
                let mut body = BytesMut::new();
                body.put_slice(sql.as_bytes());
                body.put_u8(0);
                write_tagged(buf, b'Q', &body);
            }
            FeMessage::StandbyStatusUpdate {
                write_lsn,
                flush_lsn,
                apply_lsn,
                timestamp,
                reply_requested,
            } => {
                let mut body = BytesMut::new();
                body.put_u64((*write_lsn).into());
                body.put_u64((*flush_lsn).into());
                body.put_u64((*apply_lsn).into());
                body.put_i64(*timestamp);
                body.put_u8(*reply_requested as u8);
                write_tagged(buf, b'r', &body);
            }
            FeMessage::CopyData(data) => write_tagged(buf, b'd', data),
            FeMessage::CopyDone => write_tagged(buf, b'c', &[]),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.write(&mut buf);
        buf.freeze()
    }
}
