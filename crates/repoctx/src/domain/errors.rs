//! Error taxonomy shared by every repository source.

use std::fmt;
use std::io;

use thiserror::Error;

/// Classified failure kind. Every provider maps raw transport failures onto one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceErrorKind {
    InvalidUrl,
    AuthRequired,
    AuthFailed,
    NotFound,
    RateLimited,
    NetworkError,
    ParseError,
    Unknown,
}

impl SourceErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceErrorKind::InvalidUrl => "invalid url",
            SourceErrorKind::AuthRequired => "authentication required",
            SourceErrorKind::AuthFailed => "authentication failed",
            SourceErrorKind::NotFound => "not found",
            SourceErrorKind::RateLimited => "rate limited",
            SourceErrorKind::NetworkError => "network error",
            SourceErrorKind::ParseError => "parse error",
            SourceErrorKind::Unknown => "unknown error",
        }
    }

    /// Human readable remediation shown next to every surfaced error.
    pub fn hint(&self) -> &'static str {
        match self {
            SourceErrorKind::InvalidUrl => {
                "Check the repository URL, local directory, or zip path and try again."
            }
            SourceErrorKind::AuthRequired => {
                "This repository needs an access token. Create one and pass it with --token or the provider's token environment variable."
            }
            SourceErrorKind::AuthFailed => {
                "The access token was rejected. Refresh the token or check that it has read access to the repository."
            }
            SourceErrorKind::NotFound => {
                "The repository, branch, or path does not exist. Private repositories also report not found without a token."
            }
            SourceErrorKind::RateLimited => {
                "The provider's rate limit was hit. Wait a moment and retry, or add an access token for a higher limit."
            }
            SourceErrorKind::NetworkError => {
                "The provider could not be reached. Check your connection and retry."
            }
            SourceErrorKind::ParseError => {
                "The provider returned data that could not be decoded. Retry, or report the repository if it persists."
            }
            SourceErrorKind::Unknown => "An unexpected error occurred. Retry with -v for details.",
        }
    }

    /// Network failures, 5xx responses and timeouts are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceErrorKind::NetworkError)
    }
}

impl fmt::Display for SourceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Suggested follow-up for the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Open the provider's token-creation page.
    OpenTokenPage(String),
    /// Try the same operation again later.
    Retry,
    /// Correct the identifier that was entered.
    CheckInput,
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryAction::OpenTokenPage(url) => write!(f, "create a token at {url}"),
            RecoveryAction::Retry => f.write_str("retry the operation"),
            RecoveryAction::CheckInput => f.write_str("check the source identifier"),
        }
    }
}

/// Error surfaced by repository sources.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct SourceError {
    pub kind: SourceErrorKind,
    pub message: String,
    pub status: Option<u16>,
    token_page: Option<String>,
}

impl SourceError {
    pub fn new(kind: SourceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            token_page: None,
        }
    }

    pub fn invalid_url(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::InvalidUrl, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::NotFound, message)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::ParseError, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::NetworkError, message)
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Attach the provider page where a credential can be created.
    pub fn with_token_page(mut self, url: impl Into<String>) -> Self {
        self.token_page = Some(url.into());
        self
    }

    pub fn hint(&self) -> &'static str {
        self.kind.hint()
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    pub fn recovery(&self) -> Option<RecoveryAction> {
        match self.kind {
            SourceErrorKind::AuthRequired | SourceErrorKind::AuthFailed => self
                .token_page
                .clone()
                .map(RecoveryAction::OpenTokenPage)
                .or(Some(RecoveryAction::CheckInput)),
            SourceErrorKind::RateLimited => self
                .token_page
                .clone()
                .map(RecoveryAction::OpenTokenPage)
                .or(Some(RecoveryAction::Retry)),
            SourceErrorKind::NetworkError | SourceErrorKind::ParseError => {
                Some(RecoveryAction::Retry)
            }
            SourceErrorKind::InvalidUrl | SourceErrorKind::NotFound => {
                Some(RecoveryAction::CheckInput)
            }
            SourceErrorKind::Unknown => None,
        }
    }

    /// Multi-line report with the hint and recovery suggestion.
    pub fn report(&self) -> String {
        let mut out = format!("{self}\nhint: {}", self.hint());
        if let Some(action) = self.recovery() {
            out.push_str(&format!("\nnext: {action}"));
        }
        out
    }
}

impl From<io::Error> for SourceError {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::NotFound => SourceErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => SourceErrorKind::AuthFailed,
            io::ErrorKind::InvalidData => SourceErrorKind::ParseError,
            io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => SourceErrorKind::NetworkError,
            _ => SourceErrorKind::Unknown,
        };
        SourceError::new(kind, err.to_string())
    }
}

impl From<serde_json::Error> for SourceError {
    fn from(err: serde_json::Error) -> Self {
        SourceError::parse(format!("invalid JSON response: {err}"))
    }
}

impl From<base64::DecodeError> for SourceError {
    fn from(err: base64::DecodeError) -> Self {
        SourceError::parse(format!("invalid base64 content: {err}"))
    }
}

impl From<zip::result::ZipError> for SourceError {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(io) => io.into(),
            zip::result::ZipError::FileNotFound => {
                SourceError::not_found("entry not found in archive")
            }
            other => SourceError::parse(format!("unreadable zip archive: {other}")),
        }
    }
}

/// Failure of a single item inside a batch fetch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("failed to fetch {path}: {error}")]
pub struct FetchFailure {
    pub path: String,
    #[source]
    pub error: SourceError,
}
