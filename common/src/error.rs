//! Error taxonomy shared by the archive producer and the remote channel.
//!
//! Every failure is fatal to the copy in progress. The variants mirror where the
//! failure was observed so callers can tell a local filesystem problem from a
//! remote one without parsing messages.

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid glob pattern {pattern:?}")]
    Glob {
        pattern: String,
        #[source]
        source: globset::Error,
    },
    #[error("failed reading metadata from {path:?}")]
    Stat {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot open directory {path:?} for reading")]
    ReadDir {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed reading symlink {path:?}")]
    LinkRead {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },
    #[error("failed connecting to remote: {context}")]
    Connection {
        context: String,
        #[source]
        source: Option<BoxError>,
    },
    #[error("remote command failed{}: {message}", code.map(|c| format!(" with exit code {c}")).unwrap_or_default())]
    RemoteNonZeroExit { code: Option<i32>, message: String },
    #[error("remote stream broken: {context}")]
    Stream {
        context: String,
        #[source]
        source: Option<BoxError>,
    },
}

impl Error {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    pub fn connection<E>(context: impl Into<String>, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        Error::Connection {
            context: context.into(),
            source: Some(source.into()),
        }
    }

    pub fn stream<E>(context: impl Into<String>, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        Error::Stream {
            context: context.into(),
            source: Some(source.into()),
        }
    }

    /// True for failures reported by the remote side rather than observed locally.
    #[must_use]
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            Error::Connection { .. } | Error::RemoteNonZeroExit { .. } | Error::Stream { .. }
        )
    }
}
