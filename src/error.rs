//! The errors that can occur.

use std::time::Duration;
use thiserror::Error;

/// A type alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// The possible errors that can occur.
#[derive(Debug, Error)]
pub enum Error {
    /// An error occurred while interacting with the file system.
    #[error("An IO error occurred: {0}")]
    IO(#[from] std::io::Error),
    /// An error occurred while fetching.
    #[error("An error occurred while fetching: {0}")]
    Reqwest(#[from] reqwest::Error),
    /// An error occurred while parsing JSON.
    #[error("An error occurred while parsing JSON: {0}")]
    Serde(#[from] serde_json::Error),
    /// An error occurred while parsing a URL.
    #[error("An invalid URL was encountered: {0}")]
    Url(#[from] url::ParseError),
    /// An error occurred on the DevTools websocket.
    #[error("A websocket error occurred: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    /// Every discovery probe ran and none produced a usable media URL.
    #[error("No playable media found for {0}")]
    DiscoveryEmpty(String),
    /// The server answered with a non-success status.
    #[error("Request to {url} failed with status {status}")]
    Transfer { url: String, status: u16 },
    /// The server answered without a body.
    #[error("Response from {0} carried no body")]
    EmptyBody(String),
    /// The transcoder exited unsuccessfully.
    #[error("{program} exited with code {code:?}: {stderr}")]
    Subprocess {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
    /// The browser could not be launched or talked to.
    #[error("Browser error: {0}")]
    Browser(String),
    /// A DevTools command returned an error.
    #[error("DevTools command {method} failed: {message}")]
    Protocol { method: String, message: String },
    /// A manifest could not be parsed.
    #[error("Failed to parse playlist: {0}")]
    Playlist(String),
    /// An error occurred due to a timeout.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
    /// The operation was interrupted.
    #[error("Operation was cancelled")]
    Cancelled,
    /// The configuration could not be loaded.
    #[error("Invalid configuration: {0}")]
    Config(String),
    /// The given URL does not point at a supported post.
    #[error("Unsupported URL: {0}")]
    InvalidUrl(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(error))
    }
}

impl Error {
    /// Whether this error came from an interrupt rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
