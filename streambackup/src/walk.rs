//! Directory walker (C2): enumerates a live filesystem tree the same way
//! the sender's tablespace-aware traversal does, classifying entries,
//! skipping reserved paths, and following only the `pg_tblspc` symlink
//! whitelist (§4.2).

use camino::{Utf8Path, Utf8PathBuf};
use std::time::UNIX_EPOCH;
use tracing::warn;

use crate::archive::{ArchiveMember, ArchiveWriter};
use crate::error::{BackupError, Result};

/// Entries skipped unconditionally when walking the primary data directory:
/// the WAL directory (shipped separately by C4) and the postmaster's PID
/// file, which is meaningless once copied elsewhere.
const RESERVED_TOP_LEVEL: &[&str] = &["pg_xlog", "postmaster.pid"];

const TABLESPACE_DIR: &str = "pg_tblspc";

#[derive(Clone, Copy, Eq, PartialEq)]
pub enum WalkPurpose {
    /// Only sum up regular-file bytes; used for the optional progress total.
    Size,
    /// Sum bytes and also emit tar members through the given writer.
    Emit,
}

/// Walks `root`, optionally emitting tar members via `writer`. Returns the
/// total regular-file bytes seen, matching `sendDir`'s accumulation in the
/// reference sender.
pub async fn walk<W: tokio::io::AsyncWrite + Unpin>(
    root: &Utf8Path,
    purpose: WalkPurpose,
    writer: Option<&mut ArchiveWriter<W>>,
    is_toplevel: bool,
) -> Result<u64> {
    let mut writer = writer;
    walk_inner(root, Utf8Path::new(""), purpose, &mut writer, is_toplevel).await
}

fn walk_inner<'a, W: tokio::io::AsyncWrite + Unpin>(
    root: &'a Utf8Path,
    rel: &'a Utf8Path,
    purpose: WalkPurpose,
    writer: &'a mut Option<&mut ArchiveWriter<W>>,
    is_toplevel: bool,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<u64>> + Send + 'a>> {
    Box::pin(async move {
        let abs_dir = if rel.as_str().is_empty() {
            root.to_path_buf()
        } else {
            root.join(rel)
        };

        let mut entries = match tokio::fs::read_dir(&abs_dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(BackupError::filesystem(abs_dir.as_str(), e)),
        };

        let mut total: u64 = 0;

        if purpose == WalkPurpose::Emit {
            if let Some(w) = writer.as_deref_mut() {
                let mtime = mtime_of(&abs_dir).await.unwrap_or(0);
                w.write_member::<tokio::fs::File>(
                    &ArchiveMember::directory(format!("./{rel}"), mtime),
                    None,
                )
                .await?;
            }
        }

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(e)) => e,
                Ok(None) => break,
                Err(e) => return Err(BackupError::filesystem(abs_dir.as_str(), e)),
            };

            let file_name = entry.file_name();
            let name = file_name.to_string_lossy().into_owned();
            if name == "." || name == ".." {
                continue;
            }

            let child_rel = if rel.as_str().is_empty() {
                Utf8PathBuf::from(&name)
            } else {
                rel.join(&name)
            };

            if is_toplevel
                && rel.as_str().is_empty()
                && RESERVED_TOP_LEVEL.contains(&child_rel.as_str())
            {
                continue;
            }

            let meta = match tokio::fs::symlink_metadata(entry.path()).await {
                Ok(m) => m,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(path = %child_rel, error = %e, "skipping entry after stat failure");
                    continue;
                }
            };

            let file_type = meta.file_type();

            if file_type.is_symlink() {
                let is_tablespace_link = rel.as_str() == TABLESPACE_DIR;
                if !is_tablespace_link {
                    warn!(path = %child_rel, "skipping symlink outside pg_tblspc");
                    continue;
                }
                let target = tokio::fs::read_link(entry.path())
                    .await
                    .map_err(|e| BackupError::filesystem(child_rel.as_str(), e))?;
                if purpose == WalkPurpose::Emit {
                    if let Some(w) = writer.as_deref_mut() {
                        let mtime = mtime_of_meta(&meta);
                        w.write_member::<tokio::fs::File>(
                            &ArchiveMember::symlink(
                                format!("./{child_rel}"),
                                target.to_string_lossy(),
                                mtime,
                            ),
                            None,
                        )
                        .await?;
                    }
                }
                continue;
            }

            if file_type.is_dir() {
                total += walk_inner(root, &child_rel, purpose, writer, is_toplevel).await?;
                continue;
            }

            if file_type.is_file() {
                total += meta.len();
                if purpose == WalkPurpose::Emit {
                    if let Some(w) = writer.as_deref_mut() {
                        emit_regular_file(w, root, &child_rel, &meta).await?;
                    }
                }
                continue;
            }

            warn!(path = %child_rel, "skipping entry of unsupported file type");
        }

        Ok(total)
    })
}

async fn emit_regular_file<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut ArchiveWriter<W>,
    root: &Utf8Path,
    rel: &Utf8Path,
    meta: &std::fs::Metadata,
) -> Result<()> {
    let abs_path = root.join(rel);
    let file = tokio::fs::File::open(&abs_path)
        .await
        .map_err(|e| BackupError::filesystem(abs_path.as_str(), e))?;
    let mtime = mtime_of_meta(meta);
    let member = ArchiveMember::regular(format!("./{rel}"), mode_of(meta), mtime, meta.len());
    writer.write_member(&member, Some(file)).await
}

#[cfg(unix)]
fn mode_of(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(_meta: &std::fs::Metadata) -> u32 {
    0o600
}

fn mtime_of_meta(meta: &std::fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

async fn mtime_of(path: &Utf8Path) -> Option<u64> {
    tokio::fs::metadata(path)
        .await
        .ok()
        .map(|m| mtime_of_meta(&m))
}
