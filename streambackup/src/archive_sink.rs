//! Receive-as-Archive (C6): writes a batch's tar stream straight through to
//! `base.tar[.gz]` / `<id>.tar[.gz]` with no inspection of its contents,
//! grounded on `pg_basebackup.c`'s `ReceiveTarFile`.

use async_compression::tokio::write::GzipEncoder;
use async_compression::Level;
use camino::Utf8PathBuf;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::error::{BackupError, Result};

/// `Gzip` carries the `--compress` level (§6.4, `[1..9]`); the CLI driver
/// validates the range before constructing this.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip(u32),
}

/// Where a batch's archive file is written. `Stdout` only makes sense for
/// a single-batch backup (§4.4 "a single location written to stdout is
/// only valid when the base backup has no additional tablespaces").
#[derive(Clone, Debug)]
pub enum ArchiveDestination {
    Stdout,
    Directory(Utf8PathBuf),
}

enum Sink {
    Plain(tokio::fs::File),
    Gzip(GzipEncoder<tokio::fs::File>),
    Stdout(tokio::io::Stdout),
}

impl Sink {
    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Sink::Plain(f) => f.write_all(buf).await,
            Sink::Gzip(f) => f.write_all(buf).await,
            Sink::Stdout(s) => s.write_all(buf).await,
        }
    }

    async fn finish(mut self) -> std::io::Result<()> {
        match &mut self {
            Sink::Plain(f) => f.flush().await?,
            Sink::Gzip(f) => f.shutdown().await?,
            Sink::Stdout(s) => s.flush().await?,
        }
        Ok(())
    }
}

/// Opens the destination file for a batch (or binds to stdout) before any
/// bytes of the archive have arrived, so a permission/path error surfaces
/// before the server starts streaming.
pub struct ArchiveSink {
    sink: Sink,
    path_for_errors: String,
}

impl ArchiveSink {
    /// `location_id` is `None` for the primary data directory's archive.
    pub async fn create(
        destination: &ArchiveDestination,
        location_id: Option<&str>,
        compression: Compression,
    ) -> Result<Self> {
        let (sink, path_for_errors) = match destination {
            ArchiveDestination::Stdout => {
                if matches!(compression, Compression::Gzip(_)) {
                    return Err(BackupError::Semantic(
                        "gzip compression to stdout is not supported".into(),
                    ));
                }
                (Sink::Stdout(tokio::io::stdout()), "<stdout>".to_string())
            }
            ArchiveDestination::Directory(dir) => {
                let stem = location_id.unwrap_or("base");
                let ext = if matches!(compression, Compression::Gzip(_)) {
                    "tar.gz"
                } else {
                    "tar"
                };
                let path = dir.join(format!("{stem}.{ext}"));
                let file = tokio::fs::File::create(&path)
                    .await
                    .map_err(|e| BackupError::filesystem(path.as_str(), e))?;
                let sink = match compression {
                    Compression::Gzip(level) => Sink::Gzip(GzipEncoder::with_quality(
                        file,
                        Level::Precise(level as i32),
                    )),
                    Compression::None => Sink::Plain(file),
                };
                (sink, path.to_string())
            }
        };

        Ok(ArchiveSink {
            sink,
            path_for_errors,
        })
    }

    pub async fn write_chunk(&mut self, buf: &[u8]) -> Result<()> {
        self.sink
            .write_all(buf)
            .await
            .map_err(|e| BackupError::filesystem(self.path_for_errors.clone(), e))
    }

    /// Closes the file (stdout is flushed, not closed). The terminating
    /// zero blocks are part of the tar byte stream itself and arrive
    /// through `write_chunk` like any other bytes — this mode never
    /// inspects the stream, so it has no business appending its own.
    pub async fn finish(mut self) -> Result<()> {
        self.sink
            .finish()
            .await
            .map_err(|e| BackupError::filesystem(self.path_for_errors.clone(), e))
    }
}

/// Copies every chunk `source` yields into a freshly created archive file,
/// with no attempt to inspect or validate the tar contents (§5.2 "Receive
/// as Archive").
pub async fn receive_as_archive<R: tokio::io::AsyncRead + Unpin>(
    source: &mut R,
    destination: &ArchiveDestination,
    location_id: Option<&str>,
    compression: Compression,
) -> Result<u64> {
    let mut sink = ArchiveSink::create(destination, location_id, compression).await?;
    let mut buf = vec![0u8; 32 * 1024];
    let mut total = 0u64;
    loop {
        use tokio::io::AsyncReadExt;
        let n = source
            .read(&mut buf)
            .await
            .map_err(|e| BackupError::filesystem("archive source", e))?;
        if n == 0 {
            break;
        }
        sink.write_chunk(&buf[..n]).await?;
        total += n as u64;
    }
    sink.finish().await?;
    info!(bytes = total, "wrote archive batch");
    Ok(total)
}

pub fn is_single_batch_compatible(destination: &ArchiveDestination, tablespace_count: usize) -> bool {
    match destination {
        ArchiveDestination::Stdout => tablespace_count == 0,
        ArchiveDestination::Directory(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;
    use std::io::Cursor;

    #[tokio::test]
    async fn writes_plain_archive_with_terminator() {
        let dir = tempdir().unwrap();
        let destination = ArchiveDestination::Directory(dir.path().to_path_buf());
        let mut source = b"hello tar bytes".to_vec();
        source.extend_from_slice(&[0u8; 1024]);
        let n = receive_as_archive(
            &mut Cursor::new(source.clone()),
            &destination,
            None,
            Compression::None,
        )
        .await
        .unwrap();
        assert_eq!(n, source.len() as u64);

        let out = std::fs::read(dir.path().join("base.tar")).unwrap();
        assert_eq!(out, source);
    }

    #[tokio::test]
    async fn tablespace_archive_is_named_by_id() {
        let dir = tempdir().unwrap();
        let destination = ArchiveDestination::Directory(dir.path().to_path_buf());
        receive_as_archive(
            &mut Cursor::new(b"tbl bytes".to_vec()),
            &destination,
            Some("16384"),
            Compression::None,
        )
        .await
        .unwrap();
        assert!(dir.path().join("16384.tar").is_file());
    }

    #[tokio::test]
    async fn gzip_compression_uses_gz_extension() {
        let dir = tempdir().unwrap();
        let destination = ArchiveDestination::Directory(dir.path().to_path_buf());
        receive_as_archive(
            &mut Cursor::new(b"compress me".to_vec()),
            &destination,
            None,
            Compression::Gzip(6),
        )
        .await
        .unwrap();
        let out = std::fs::read(dir.path().join("base.tar.gz")).unwrap();
        // gzip magic bytes
        assert_eq!(&out[0..2], &[0x1f, 0x8b]);
    }

    #[tokio::test]
    async fn gzip_to_stdout_is_rejected() {
        let destination = ArchiveDestination::Stdout;
        let err = ArchiveSink::create(&destination, None, Compression::Gzip(6))
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Semantic(_)));
    }

    #[test]
    fn stdout_destination_requires_single_batch() {
        assert!(is_single_batch_compatible(&ArchiveDestination::Stdout, 0));
        assert!(!is_single_batch_compatible(&ArchiveDestination::Stdout, 1));
        let dir_dest = ArchiveDestination::Directory(Utf8PathBuf::from("/tmp"));
        assert!(is_single_batch_compatible(&dir_dest, 3));
    }
}
