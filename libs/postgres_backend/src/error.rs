/// Distinguishes a copy-mode stream ending because the peer said so
/// (`CopyDone`, clean disconnect) from one that ended because we need to
/// report something back — callers that get `Disconnected`/`ServerInitiated`
/// know the connection is already gone and must not try to write a reply.
#[derive(Debug, thiserror::Error)]
pub enum CopyStreamHandlerEnd {
    #[error("terminated by client's CopyDone")]
    CopyDone,
    #[error("client disconnected")]
    Disconnected,
    #[error("server is shutting down")]
    ServerInitiated(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors surfaced while a backup session or WAL stream is being driven.
/// Kept distinct from `CopyStreamHandlerEnd` because a `QueryError` still
/// expects the caller to be able to send an `ErrorResponse` back, whereas
/// `CopyStreamHandlerEnd` means the connection is already gone.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error(transparent)]
    Copy(#[from] CopyStreamHandlerEnd),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}
