//! Ustar-variant tar archive emission (C1). Header byte layout is produced
//! by `tokio_tar`'s own `Header` encoder, so the checksum and field-offset
//! rules (§8 invariants 1-2) fall out of a well-tested encoder rather than
//! a hand-rolled one; body emission is handled here directly rather than
//! through `tokio_tar::Builder`, because the truncation/growth tolerance
//! this module needs (pad on shrink, discard on grow) isn't something a
//! generic tar builder promises.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tar::{EntryType, Header};
use tracing::trace;

use crate::error::{BackupError, Result};

/// Tar members larger than this are refused outright (§4.1, "member size
/// cap"): ustar's 11-octal-digit size field can represent at most 8 GiB,
/// but Postgres's own limit is tighter still, so we match it exactly.
pub const MAX_TAR_MEMBER_FILELEN: u64 = (1u64 << 33) - 1;

const BLOCK_SIZE: u64 = 512;
const COPY_BUF_SIZE: usize = 32 * 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MemberKind {
    Regular,
    Directory,
    Symlink,
}

#[derive(Clone, Debug)]
pub struct ArchiveMember {
    pub name: String,
    pub kind: MemberKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u64,
    pub size: u64,
    pub link_target: Option<String>,
}

impl ArchiveMember {
    pub fn directory(name: impl Into<String>, mtime: u64) -> Self {
        ArchiveMember {
            name: with_trailing_slash(name.into()),
            kind: MemberKind::Directory,
            mode: 0o755,
            uid: 0,
            gid: 0,
            mtime,
            size: 0,
            link_target: None,
        }
    }

    pub fn symlink(name: impl Into<String>, target: impl Into<String>, mtime: u64) -> Self {
        ArchiveMember {
            name: with_trailing_slash(name.into()),
            kind: MemberKind::Symlink,
            mode: 0o777,
            uid: 0,
            gid: 0,
            mtime,
            size: 0,
            link_target: Some(target.into()),
        }
    }

    pub fn regular(name: impl Into<String>, mode: u32, mtime: u64, size: u64) -> Self {
        ArchiveMember {
            name: name.into(),
            kind: MemberKind::Regular,
            mode,
            uid: 0,
            gid: 0,
            mtime,
            size,
            link_target: None,
        }
    }
}

fn with_trailing_slash(mut name: String) -> String {
    if !name.ends_with('/') {
        name.push('/');
    }
    name
}

/// Writes ustar members into an opaque `AsyncWrite` sink. Does not emit
/// the end-of-archive terminator; that's C6's job (§4.1 "End of stream"),
/// since C1 is reused for both the unpack-destined stream (which never
/// gets the two zero blocks written locally) and the archive-destined one.
pub struct ArchiveWriter<W> {
    sink: W,
}

impl<W: AsyncWrite + Unpin> ArchiveWriter<W> {
    pub fn new(sink: W) -> Self {
        ArchiveWriter { sink }
    }

    pub fn into_inner(self) -> W {
        self.sink
    }

    /// Emits one member. `body` must be `Some` for `MemberKind::Regular`
    /// and is ignored otherwise.
    pub async fn write_member<R: AsyncRead + Unpin>(
        &mut self,
        member: &ArchiveMember,
        mut body: Option<R>,
    ) -> Result<()> {
        if member.kind == MemberKind::Regular && member.size >= MAX_TAR_MEMBER_FILELEN {
            return Err(BackupError::Invariant(format!(
                "member {:?} size {} exceeds MAX_TAR_MEMBER_FILELEN",
                member.name, member.size
            )));
        }

        let header = build_header(member)?;
        self.sink
            .write_all(header.as_bytes())
            .await
            .map_err(|e| BackupError::filesystem("archive sink", e))?;

        if member.kind != MemberKind::Regular {
            trace!(name = %member.name, kind = ?member.kind, "wrote tar member header");
            return Ok(());
        }

        let body = body
            .as_mut()
            .ok_or_else(|| BackupError::Invariant("regular member missing body reader".into()))?;
        self.write_body(member.size, body).await?;
        trace!(name = %member.name, size = member.size, "wrote tar member body");
        Ok(())
    }

    /// Copies up to `size` bytes from `body`, zero-padding on early EOF and
    /// discarding anything beyond `size`, then pads to the next 512-byte
    /// boundary (§4.1 "Body emission", §8 invariant 2).
    async fn write_body<R: AsyncRead + Unpin>(&mut self, size: u64, body: &mut R) -> Result<()> {
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        let mut remaining = size;

        while remaining > 0 {
            let want = std::cmp::min(remaining, COPY_BUF_SIZE as u64) as usize;
            let n = body
                .read(&mut buf[..want])
                .await
                .map_err(|e| BackupError::filesystem("archive member body", e))?;
            if n == 0 {
                // Early EOF: zero-pad the rest of the declared size.
                zero_fill(&mut self.sink, remaining).await?;
                remaining = 0;
                break;
            }
            self.sink
                .write_all(&buf[..n])
                .await
                .map_err(|e| BackupError::filesystem("archive sink", e))?;
            remaining -= n as u64;
        }

        // Discard anything the reader still has beyond the declared size;
        // the engine's WAL replay, not this archive, is the source of
        // truth for a file that grew mid-send.
        let pad = padding_len(size);
        if pad > 0 {
            zero_fill(&mut self.sink, pad).await?;
        }
        Ok(())
    }
}

fn padding_len(size: u64) -> u64 {
    let rem = size % BLOCK_SIZE;
    if rem == 0 {
        0
    } else {
        BLOCK_SIZE - rem
    }
}

async fn zero_fill<W: AsyncWrite + Unpin>(sink: &mut W, mut len: u64) -> Result<()> {
    let zeros = [0u8; COPY_BUF_SIZE];
    while len > 0 {
        let chunk = std::cmp::min(len, COPY_BUF_SIZE as u64) as usize;
        sink.write_all(&zeros[..chunk])
            .await
            .map_err(|e| BackupError::filesystem("archive sink", e))?;
        len -= chunk as u64;
    }
    Ok(())
}

fn build_header(member: &ArchiveMember) -> Result<Header> {
    let mut header = Header::new_ustar();
    header.set_path(&member.name).map_err(|e| {
        BackupError::Invariant(format!("member name {:?} unrepresentable: {e}", member.name))
    })?;
    header.set_mode(member.mode);
    header.set_uid(member.uid as u64);
    header.set_gid(member.gid as u64);
    header.set_mtime(member.mtime);
    header.set_size(if member.kind == MemberKind::Regular {
        member.size
    } else {
        0
    });
    header.set_entry_type(match member.kind {
        MemberKind::Regular => EntryType::regular(),
        MemberKind::Directory => EntryType::dir(),
        MemberKind::Symlink => EntryType::symlink(),
    });
    if let Some(target) = &member.link_target {
        header
            .set_link_name(target)
            .map_err(|e| BackupError::Invariant(format!("link target unrepresentable: {e}")))?;
    }
    // `Header::new_ustar()` leaves the magic+version field as POSIX
    // "ustar\0" + "00" (a NUL at byte 262); base backups require the literal
    // ASCII "ustar00\0" at [257..265).
    header.as_mut_bytes()[257..265].copy_from_slice(b"ustar00\0");
    header.set_cksum();
    Ok(header)
}
