//! Backup session orchestration (C3): `start_backup → per-location batch →
//! stop_backup`, with an `abort_backup()` cleanup hook armed for the whole
//! duration. The source guards this with a process-wide flag released by
//! an error-cleanup callback; here it's an explicit `BackupSessionGuard`
//! value (design notes §9).

use camino::Utf8Path;
use pq_proto::{BeMessage, RowDescriptor};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{info, info_span, warn, Instrument};

use crate::archive::{ArchiveMember, ArchiveWriter};
use crate::error::{BackupError, Result};
use crate::walk::{walk, WalkPurpose};

/// The three `start_backup`/`stop_backup`/`abort_backup` primitives the
/// transactional engine provides. Out of scope for this subsystem (§1);
/// callers supply an implementation.
#[async_trait::async_trait]
pub trait BackupLifecycle: Send {
    async fn start_backup(&mut self, label: &str, fast: bool) -> Result<()>;
    async fn stop_backup(&mut self) -> Result<()>;
    /// Infallible: an error while aborting an already-failing backup has
    /// nowhere further to propagate to.
    async fn abort_backup(&mut self);
}

/// RAII guard around an armed backup. Dropping it without calling
/// `commit()` spawns `abort_backup()` on the ambient Tokio runtime, the
/// same "run cleanup unless explicitly disarmed" contract the source
/// expressed with `PG_ENSURE_ERROR_CLEANUP`.
pub struct BackupSessionGuard {
    lifecycle: Option<Box<dyn BackupLifecycle>>,
}

impl BackupSessionGuard {
    pub async fn arm(mut lifecycle: Box<dyn BackupLifecycle>, label: &str) -> Result<Self> {
        lifecycle.start_backup(label, true).await?;
        Ok(BackupSessionGuard {
            lifecycle: Some(lifecycle),
        })
    }

    /// Disarms the guard and runs `stop_backup()`. Consuming `self` means a
    /// second call (or a drop after this one) is a compile-time error, not
    /// a double-abort bug.
    pub async fn commit(mut self) -> Result<()> {
        let mut lifecycle = self.lifecycle.take().expect("commit called at most once");
        lifecycle.stop_backup().await
    }
}

impl Drop for BackupSessionGuard {
    fn drop(&mut self) {
        if let Some(mut lifecycle) = self.lifecycle.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        lifecycle.abort_backup().await;
                    });
                }
                Err(_) => {
                    tracing::error!(
                        "BackupSessionGuard dropped outside a Tokio runtime; abort_backup() was not invoked"
                    );
                }
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct BackupOptions {
    pub label: String,
    pub want_progress: bool,
}

#[derive(Clone, Debug)]
struct StorageLocation {
    /// `None` for the primary data directory.
    id: Option<String>,
    abs_path: Option<camino::Utf8PathBuf>,
}

/// Drives the whole `C3` sequence over an already-established connection:
/// open `pg_tblspc`, `start_backup`, emit the primary batch then one batch
/// per auxiliary location, `stop_backup`.
pub async fn send_base_backup<W, L>(
    conn: &mut W,
    data_dir: &Utf8Path,
    options: &BackupOptions,
    lifecycle: L,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
    L: BackupLifecycle + 'static,
{
    let tblspc_dir = data_dir.join("pg_tblspc");
    let mut tblspc_entries = tokio::fs::read_dir(&tblspc_dir)
        .await
        .map_err(|e| BackupError::filesystem(tblspc_dir.as_str(), e))?;

    let guard = BackupSessionGuard::arm(Box::new(lifecycle), &options.label).await?;

    let result = send_all_batches(conn, data_dir, options, &mut tblspc_entries).await;

    match result {
        Ok(()) => {
            guard.commit().await?;
            Ok(())
        }
        Err(e) => {
            // `guard` drops here, spawning `abort_backup()`.
            Err(e)
        }
    }
}

async fn send_all_batches<W: AsyncWrite + Unpin + Send>(
    conn: &mut W,
    data_dir: &Utf8Path,
    options: &BackupOptions,
    tblspc_entries: &mut tokio::fs::ReadDir,
) -> Result<()> {
    send_batch(
        conn,
        &StorageLocation {
            id: None,
            abs_path: None,
        },
        data_dir,
        options,
    )
    .instrument(info_span!("send_tarball", location = "primary"))
    .await?;

    loop {
        let entry = match tblspc_entries.next_entry().await {
            Ok(Some(e)) => e,
            Ok(None) => break,
            Err(e) => return Err(BackupError::filesystem("pg_tblspc", e)),
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "." || name == ".." {
            continue;
        }
        let target = match tokio::fs::read_link(entry.path()).await {
            Ok(t) => t,
            Err(e) => {
                warn!(location = %name, error = %e, "skipping tablespace with unreadable link");
                continue;
            }
        };
        let abs_path = match camino::Utf8PathBuf::try_from(target) {
            Ok(p) => p,
            Err(e) => {
                warn!(location = %name, error = %e, "skipping tablespace with non-utf8 target");
                continue;
            }
        };
        let location = StorageLocation {
            id: Some(name.clone()),
            abs_path: Some(abs_path.clone()),
        };
        send_batch(conn, &location, &abs_path, options)
            .instrument(info_span!("send_tarball", location = %name))
            .await?;
    }

    Ok(())
}

/// Sends one complete `BackupBatch`: header row-set, tar stream, copy-done
/// (§4.3 "Per-batch protocol", §6.2 framing).
async fn send_batch<W: AsyncWrite + Unpin + Send>(
    conn: &mut W,
    location: &StorageLocation,
    root: &Utf8Path,
    options: &BackupOptions,
) -> Result<()> {
    let size_kb = if options.want_progress {
        walk::<Vec<u8>>(root, WalkPurpose::Size, None, location.id.is_none())
            .await?
            / 1024
    } else {
        0
    };

    write_message(
        conn,
        &BeMessage::RowDescription(&[
            RowDescriptor::oid_col("spcoid"),
            RowDescriptor::text_col("spclocation"),
            RowDescriptor::int8_col("size"),
        ]),
    )
    .await?;

    let spcoid_bytes;
    let (spcoid, spclocation): (Option<&[u8]>, Option<&[u8]>) = match &location.id {
        None => (None, None),
        Some(id) => {
            let oid: u32 = id
                .parse()
                .map_err(|_| BackupError::Invariant(format!("tablespace id {id:?} is not a valid OID")))?;
            spcoid_bytes = oid.to_be_bytes();
            (Some(&spcoid_bytes[..]), location.abs_path.as_ref().map(|p| p.as_str().as_bytes()))
        }
    };
    let size_str = size_kb.to_string();
    write_message(
        conn,
        &BeMessage::DataRow(&[spcoid, spclocation, Some(size_str.as_bytes())]),
    )
    .await?;
    write_message(conn, &BeMessage::CommandComplete("SELECT")).await?;
    write_message(conn, &BeMessage::CopyOutResponse).await?;

    info!(location = ?location.id, size_kb, "emitting archive for storage location");

    {
        let mut copy_writer = postgres_backend::CopyDataWriter::new(&mut *conn);
        let mut writer = ArchiveWriter::new(&mut copy_writer);
        walk(
            root,
            WalkPurpose::Emit,
            Some(&mut writer),
            location.id.is_none(),
        )
        .await?;
        // Two 512-byte zero blocks terminate the tar stream (§4.3 step
        // emits the archive "followed by two 512-byte zero blocks").
        copy_writer
            .write_all(&[0u8; 1024])
            .await
            .map_err(|e| BackupError::filesystem("connection", e))?;
    }

    write_message(conn, &BeMessage::CopyDone).await?;
    Ok(())
}

async fn write_message<W: AsyncWrite + Unpin>(conn: &mut W, msg: &BeMessage<'_>) -> Result<()> {
    let bytes = msg.to_bytes();
    conn.write_all(&bytes)
        .await
        .map_err(|e| BackupError::filesystem("connection", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingLifecycle {
        started: Arc<AtomicUsize>,
        stopped: Arc<AtomicUsize>,
        aborted: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl BackupLifecycle for CountingLifecycle {
        async fn start_backup(&mut self, _label: &str, _fast: bool) -> Result<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn stop_backup(&mut self) -> Result<()> {
            self.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn abort_backup(&mut self) {
            self.aborted.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn successful_backup_commits_without_aborting() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("pg_tblspc")).unwrap();
        std::fs::write(dir.path().join("x"), b"abcdefghi").unwrap();

        let started = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        let aborted = Arc::new(AtomicUsize::new(0));
        let lifecycle = CountingLifecycle {
            started: started.clone(),
            stopped: stopped.clone(),
            aborted: aborted.clone(),
        };

        let mut sink = Vec::new();
        let options = BackupOptions {
            label: "test".into(),
            want_progress: false,
        };
        send_base_backup(&mut sink, dir.path(), &options, lifecycle)
            .await
            .unwrap();

        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        // give any (unexpected) spawned abort task a chance to run
        tokio::task::yield_now().await;
        assert_eq!(aborted.load(Ordering::SeqCst), 0);
        assert!(!sink.is_empty());
    }

    #[tokio::test]
    async fn missing_tblspc_dir_fails_before_start_backup() {
        let dir = tempdir().unwrap();
        let started = Arc::new(AtomicUsize::new(0));
        let lifecycle = CountingLifecycle {
            started: started.clone(),
            stopped: Arc::new(AtomicUsize::new(0)),
            aborted: Arc::new(AtomicUsize::new(0)),
        };
        let mut sink = Vec::new();
        let options = BackupOptions {
            label: "test".into(),
            want_progress: false,
        };
        let err = send_base_backup(&mut sink, dir.path(), &options, lifecycle)
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Filesystem { .. }));
        assert_eq!(started.load(Ordering::SeqCst), 0);
    }
}
