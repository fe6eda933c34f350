/// The five error kinds this subsystem distinguishes (design notes §7),
/// kept as a single enum so callers on the sender side can decide whether
/// a failure should trigger `abort_backup()` (anything but a semantic
/// argument error reaching it after a session is open) versus just
/// exiting the CLI with status 1.
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    /// Connection lost, or the peer returned an unexpected result kind.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed block header, unknown typeflag, size parse failure.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// stat/open/read/write/mkdir/symlink/rename failure.
    #[error("filesystem error at {path}: {source}")]
    Filesystem {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Archive member too large, WAL offset mismatch, non-empty target dir.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Conflicting CLI flags, invalid combination, etc. Detected at
    /// argument-parse time, before any I/O happens.
    #[error("invalid arguments: {0}")]
    Semantic(String),
}

impl BackupError {
    pub fn filesystem(path: impl Into<String>, source: std::io::Error) -> Self {
        BackupError::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Whether this error, raised mid-session on the sender, should arm
    /// `abort_backup()` (every kind except a semantic argument error, which
    /// can only occur before a session exists in the first place).
    pub fn should_abort_backup(&self) -> bool {
        !matches!(self, BackupError::Semantic(_))
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
