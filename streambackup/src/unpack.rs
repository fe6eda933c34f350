//! Receive-and-Unpack (C5): drives `pg_basebackup`'s
//! `ReceiveAndUnpackTarFile` state machine over whatever-sized buffers
//! arrive on a `copy-out` stream, reconstructing directories, symlinks,
//! and regular files underneath a target directory.

use camino::Utf8Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::trace;

use crate::error::{BackupError, Result};

#[derive(Clone, Debug)]
pub struct UnpackOptions {
    /// §9 resolution: when `false` (default), a member name beginning with
    /// `/` is a fatal protocol error. When `true`, the historical
    /// leading-`/`-to-`_` rewrite is applied and a warning is logged.
    pub allow_absolute_member_names: bool,
}

impl Default for UnpackOptions {
    fn default() -> Self {
        UnpackOptions {
            allow_absolute_member_names: false,
        }
    }
}

enum State {
    BetweenMembers,
    InFile {
        file: tokio::fs::File,
        remaining: u64,
        padding: u64,
    },
}

/// Consumes arbitrarily-sized chunks of a tar stream (whatever a `CopyData`
/// message happens to carry — never assumed to line up with a 512-byte tar
/// block) and reconstructs them under `target_dir`. Incoming bytes are
/// accumulated in `inbox` and drained in 512-byte (header) or
/// remaining/padding-sized (body) units as they become available, the way
/// `ReceiveAndUnpackTarFile` reassembles blocks from its own socket reads
/// rather than trusting libpq's message boundaries. Callers drive this by
/// repeatedly calling `feed` with each incoming chunk, then `finish` once
/// the stream ends.
pub struct Unpacker {
    state: State,
    inbox: Vec<u8>,
    target_dir: camino::Utf8PathBuf,
    options: UnpackOptions,
}

impl Unpacker {
    pub fn new(target_dir: &Utf8Path, options: UnpackOptions) -> Self {
        Unpacker {
            state: State::BetweenMembers,
            inbox: Vec::new(),
            target_dir: target_dir.to_path_buf(),
            options,
        }
    }

    pub async fn feed(&mut self, buf: &[u8]) -> Result<()> {
        self.inbox.extend_from_slice(buf);
        loop {
            let between_members = matches!(self.state, State::BetweenMembers);
            let progressed = if between_members {
                self.try_consume_header().await?
            } else {
                self.try_consume_body().await?
            };
            if !progressed {
                return Ok(());
            }
        }
    }

    /// At stream end no file may be left in the open state, and no partial
    /// (incomplete) header may be sitting unconsumed in `inbox`.
    pub fn finish(self) -> Result<()> {
        match self.state {
            State::BetweenMembers if self.inbox.is_empty() => Ok(()),
            State::BetweenMembers => Err(BackupError::Protocol(
                "tar stream ended with a partial header".into(),
            )),
            State::InFile { .. } => Err(BackupError::Protocol(
                "last file was never finished".into(),
            )),
        }
    }

    /// Drains one 512-byte block from `inbox` if a full one is available.
    /// Returns `Ok(false)` when there isn't enough buffered yet — the
    /// caller stops and waits for the next `feed`. An all-zero block is
    /// the tar end-of-archive marker; it's simply dropped (there may be
    /// one or two of them, and nothing follows), never treated as a
    /// member header.
    async fn try_consume_header(&mut self) -> Result<bool> {
        if self.inbox.len() < 512 {
            return Ok(false);
        }
        let header: Vec<u8> = self.inbox.drain(..512).collect();
        if header.iter().all(|&b| b == 0) {
            return Ok(true);
        }
        self.handle_header(&header).await?;
        Ok(true)
    }

    /// Drains as much of the current member's remaining body (then its
    /// padding) as `inbox` currently holds. Returns `Ok(false)` once
    /// `inbox` is empty and there's nothing left to consume right now.
    async fn try_consume_body(&mut self) -> Result<bool> {
        let (remaining, available) = match &self.state {
            State::InFile { remaining, .. } => (*remaining, self.inbox.len() as u64),
            State::BetweenMembers => unreachable!("try_consume_body called between members"),
        };

        if remaining > 0 {
            if available == 0 {
                return Ok(false);
            }
            let n = std::cmp::min(remaining, available) as usize;
            let chunk: Vec<u8> = self.inbox.drain(..n).collect();
            let State::InFile { file, remaining, .. } = &mut self.state else {
                unreachable!("checked above");
            };
            file.write_all(&chunk)
                .await
                .map_err(|e| BackupError::filesystem("unpack target", e))?;
            *remaining -= n as u64;
            return Ok(true);
        }

        let padding = match &self.state {
            State::InFile { padding, .. } => *padding,
            State::BetweenMembers => unreachable!("checked above"),
        };
        if padding > 0 {
            if available == 0 {
                return Ok(false);
            }
            let n = std::cmp::min(padding, available) as usize;
            self.inbox.drain(..n);
            let State::InFile { padding, .. } = &mut self.state else {
                unreachable!("checked above");
            };
            *padding -= n as u64;
            return Ok(true);
        }

        self.state = State::BetweenMembers;
        Ok(true)
    }

    async fn handle_header(&mut self, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), 512);

        let size_field = std::str::from_utf8(&buf[124..135])
            .map_err(|_| BackupError::Protocol("size field is not ASCII".into()))?;
        let size = u64::from_str_radix(size_field.trim(), 8)
            .map_err(|_| BackupError::Protocol("could not parse file size".into()))?;
        let padding = (512 - size % 512) % 512;

        let name_end = buf[0..100].iter().position(|&b| b == 0).unwrap_or(100);
        let raw_name = std::str::from_utf8(&buf[0..name_end])
            .map_err(|_| BackupError::Protocol("member name is not valid UTF-8".into()))?;
        let name = self.sanitize_name(raw_name)?;

        if name.ends_with('/') {
            let typeflag = buf[156];
            let stripped = name.trim_end_matches('/');
            let abs = self.target_dir.join(stripped);
            match typeflag {
                b'5' => {
                    tokio::fs::create_dir(&abs)
                        .await
                        .map_err(|e| BackupError::filesystem(abs.as_str(), e))?;
                    trace!(path = %abs, "created directory");
                }
                b'2' => {
                    let link_end = buf[157..257].iter().position(|&b| b == 0).unwrap_or(100);
                    let target = std::str::from_utf8(&buf[157..157 + link_end])
                        .map_err(|_| BackupError::Protocol("link target not valid UTF-8".into()))?;
                    create_symlink(target, &abs)
                        .await
                        .map_err(|e| BackupError::filesystem(abs.as_str(), e))?;
                    trace!(path = %abs, target, "created symlink");
                }
                other => {
                    return Err(BackupError::Protocol(format!(
                        "unknown link indicator '{}'",
                        other as char
                    )))
                }
            }
            return Ok(());
        }

        let abs = self.target_dir.join(&name);
        let file = tokio::fs::File::create(&abs)
            .await
            .map_err(|e| BackupError::filesystem(abs.as_str(), e))?;

        if size == 0 {
            return Ok(());
        }

        self.state = State::InFile {
            file,
            remaining: size,
            padding,
        };
        Ok(())
    }

    /// §4.5 "Path handling": member names beginning with `/` are either a
    /// fatal protocol error or rewritten with the historical leading-`/`
    /// hack, depending on `allow_absolute_member_names`.
    fn sanitize_name(&self, raw_name: &str) -> Result<String> {
        if let Some(rest) = raw_name.strip_prefix('/') {
            if self.options.allow_absolute_member_names {
                tracing::warn!(
                    name = raw_name,
                    "rewriting absolute tar member name with leading underscore (compatibility shim)"
                );
                Ok(format!("_{rest}"))
            } else {
                Err(BackupError::Protocol(format!(
                    "refusing absolute tar member name {raw_name:?}"
                )))
            }
        } else {
            Ok(raw_name.trim_start_matches("./").to_string())
        }
    }
}

#[cfg(unix)]
async fn create_symlink(target: &str, link: &camino::Utf8Path) -> std::io::Result<()> {
    tokio::fs::symlink(target, link).await
}

#[cfg(not(unix))]
async fn create_symlink(_target: &str, _link: &camino::Utf8Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "symlinks are not supported on this platform",
    ))
}

/// Reads an entire tar byte stream (already demultiplexed from whatever
/// transport framing wraps it) in whatever chunk sizes `source` yields,
/// and drives an `Unpacker` over them.
pub async fn unpack_stream<R: tokio::io::AsyncRead + Unpin>(
    source: &mut R,
    target_dir: &Utf8Path,
    options: UnpackOptions,
) -> Result<()> {
    let mut unpacker = Unpacker::new(target_dir, options);
    let mut buf = vec![0u8; 32 * 1024];
    loop {
        let n = source
            .read(&mut buf)
            .await
            .map_err(|e| BackupError::filesystem("unpack source", e))?;
        if n == 0 {
            break;
        }
        unpacker.feed(&buf[..n]).await?;
    }
    unpacker.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;
    use std::io::Cursor;

    fn tar_header(name: &str, size: u64, typeflag: u8, link_target: &str) -> Vec<u8> {
        let mut header = vec![0u8; 512];
        header[0..name.len()].copy_from_slice(name.as_bytes());
        let size_str = format!("{size:011o}");
        header[124..124 + size_str.len()].copy_from_slice(size_str.as_bytes());
        header[156] = typeflag;
        if !link_target.is_empty() {
            header[157..157 + link_target.len()].copy_from_slice(link_target.as_bytes());
        }
        header
    }

    #[tokio::test]
    async fn unpacks_dir_and_regular_file() {
        let dir = tempdir().unwrap();
        let mut stream = Vec::new();
        stream.extend(tar_header("d/", 0, b'5', ""));
        stream.extend(tar_header("x", 9, 0, ""));
        stream.extend_from_slice(b"abcdefghi");
        stream.extend_from_slice(&[0u8; 503]); // padding to 512

        unpack_stream(
            &mut Cursor::new(stream),
            dir.path(),
            UnpackOptions::default(),
        )
        .await
        .unwrap();

        assert!(dir.path().join("d").is_dir());
        let content = std::fs::read(dir.path().join("x")).unwrap();
        assert_eq!(content, b"abcdefghi");
    }

    #[tokio::test]
    async fn rejects_absolute_member_name_by_default() {
        let dir = tempdir().unwrap();
        let mut stream = Vec::new();
        stream.extend(tar_header("/etc/passwd", 0, 0, ""));

        let err = unpack_stream(
            &mut Cursor::new(stream),
            dir.path(),
            UnpackOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BackupError::Protocol(_)));
    }

    #[tokio::test]
    async fn rewrites_absolute_member_name_when_allowed() {
        let dir = tempdir().unwrap();
        let mut stream = Vec::new();
        stream.extend(tar_header("/passwd", 0, 0, ""));

        unpack_stream(
            &mut Cursor::new(stream),
            dir.path(),
            UnpackOptions {
                allow_absolute_member_names: true,
            },
        )
        .await
        .unwrap();
        assert!(dir.path().join("_passwd").is_file());
    }

    #[tokio::test]
    async fn unfinished_file_at_stream_end_is_an_error() {
        let dir = tempdir().unwrap();
        let mut stream = Vec::new();
        stream.extend(tar_header("x", 9, 0, ""));
        stream.extend_from_slice(b"abc"); // short, stream ends mid-file

        let err = unpack_stream(
            &mut Cursor::new(stream),
            dir.path(),
            UnpackOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BackupError::Protocol(_)));
    }
}
