use orcanet_shared::StreamError;

/// User-facing error taxonomy. The `Display` strings are what the RPC
/// boundary returns to callers, so they are part of the external contract.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("internal error")]
    Internal,

    #[error("invalid parameters")]
    InvalidParams,

    #[error("incorrect username or password")]
    InvalidCredentials,

    #[error("username already exists")]
    UsernameTaken,

    #[error("already logged in")]
    AlreadyLoggedIn,

    #[error("not logged in")]
    NotLoggedIn,

    #[error("failed to connect to peer")]
    PeerConnection,

    #[error("peer not found")]
    PeerNotFound,

    #[error("key not found")]
    KeyNotFound,

    #[error("request timed out")]
    Timeout,

    #[error("failed to open file")]
    FailedToOpenFile,

    #[error("session not found")]
    SessionNotFound,

    #[error("remote session not found")]
    RemoteSessionNotFound,

    #[error("content not found")]
    ContentNotFound,

    #[error("chat not found")]
    ChatNotFound,

    #[error("chat request not found")]
    RequestNotFound,

    #[error("chat is not ongoing")]
    ChatNotOngoing,

    #[error("failed to send message")]
    FailedToSendMessage,

    #[error("unexpected response from peer")]
    UnexpectedResponse,
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<StreamError> for Error {
    fn from(e: StreamError) -> Self {
        match e {
            StreamError::Timeout => Error::Timeout,
            StreamError::Eof | StreamError::Reset(_) => Error::PeerConnection,
            StreamError::LineTooLong | StreamError::InvalidUtf8 => Error::UnexpectedResponse,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        tracing::error!("database operation failed: {e}");
        Error::Internal
    }
}
