use std::io;

use thiserror::Error;

/// Errors from the thread stopper and walker. `ThreadGone`, `AlreadyMe` and
/// `StuckThread` are per-thread and downgrade to an empty-stack sample;
/// the rest are fatal for the session.
#[derive(Debug, Clone, Error)]
pub enum SamplingError {
    #[error("sampling is not supported on this platform")]
    UnsupportedPlatform,

    #[error("could not install the profiling signal handler: errno {0}")]
    HandlerInstallFailed(i32),

    #[error("the target thread exited before it could be stopped")]
    ThreadGone,

    #[error("refusing to stop the calling thread")]
    AlreadyMe,

    #[error("the target thread did not reach the signal handler within {0} ms")]
    StuckThread(u64),

    #[error("could not signal the target thread: errno {0}")]
    SignalFailed(i32),

    #[error("could not enumerate threads: {0}")]
    Enumerate(String),
}

impl SamplingError {
    /// Per-thread failures downgrade to an empty-stack sample; everything
    /// else aborts the round.
    pub fn is_per_thread(&self) -> bool {
        matches!(
            self,
            SamplingError::ThreadGone
                | SamplingError::AlreadyMe
                | SamplingError::StuckThread(_)
                | SamplingError::SignalFailed(_)
        )
    }
}

/// Per-query symbolization failures. None of these poison the cache; the
/// caller substitutes a synthetic "unknown" frame and the stream continues.
#[derive(Debug, Clone, Error)]
pub enum SymbolizeError {
    #[error("the symbolizer backend did not answer within {0} ms")]
    BackendTimeout(u64),

    #[error("could not parse the backend response: {0}")]
    BackendParse(String),

    #[error("the symbolizer backend is no longer running")]
    BackendGone,

    #[error("the symbolizer was shut down while the query was outstanding")]
    Cancelled,

    #[error("could not read {path}: {source}")]
    LibraryIo {
        path: String,
        source: std::sync::Arc<io::Error>,
    },
}

/// Session-level failures. Spool and renderer errors are fatal for the
/// session; a partial spool file is kept on disk for debugging.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Sampling(#[from] SamplingError),

    #[error("spool i/o failed: {0}")]
    Spool(#[from] io::Error),

    #[error("renderer failed: {0}")]
    Render(String),

    #[error("invalid session configuration: {0}")]
    InvalidConfig(String),
}
