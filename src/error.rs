use thiserror::Error;

/// Failure modes surfaced through the session-construction completion.
///
/// These never cross the public boundary as panics; mid-session failures
/// (a failed poll, a failed beacon) are logged and retried instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("connection error: {0}")]
    ConnectionError(String),
    #[error("connection timed out: {0}")]
    ConnectionTimeout(String),
    #[error("malformed ad schedule: {0}")]
    MalformedSchedule(String),
    /// The manifest carries no analytics endpoint — playback can continue
    /// but no ad management is possible.
    #[error("source is not an ad-managed stream")]
    NotAYospaceSource,
    /// A live-pause session was requested but the manifest carries no
    /// live-pause endpoint.
    #[error("stream does not advertise live-pause support")]
    NoLivePauseSupport,
}

/// Overall outcome of session construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitResult {
    /// Session is ready; analytics polling will run.
    Initialised,
    /// Playback is possible but ad management is disabled.
    NoAnalytics,
}
