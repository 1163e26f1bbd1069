use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("no data: {0}")]
    NoData(String),
    #[error("http {status} from {url}: {body}")]
    Http {
        status: u16,
        url: String,
        body: String,
    },
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("parse error: {0}")]
    Parse(String),
    /// Pagination could not advance past a page; the result would be truncated.
    #[error("incomplete result: {0}")]
    Incomplete(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("{operation} failed for device {device}: {source}")]
    Operation {
        operation: &'static str,
        device: String,
        #[source]
        source: Box<Error>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    NoData,
    Http,
    Transport,
    Parse,
    Incomplete,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::NoData => "no_data",
            ErrorKind::Http => "http",
            ErrorKind::Transport => "transport",
            ErrorKind::Parse => "parse",
            ErrorKind::Incomplete => "incomplete",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse(message.into())
    }

    /// Taxonomy of the innermost error, looking through `Operation` wrappers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::NoData(_) => ErrorKind::NoData,
            Error::Http { .. } => ErrorKind::Http,
            Error::Transport { .. } => ErrorKind::Transport,
            Error::Parse(_) => ErrorKind::Parse,
            Error::Incomplete(_) => ErrorKind::Incomplete,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Operation { source, .. } => source.kind(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Http | ErrorKind::Transport)
    }

    pub fn http_status(&self) -> Option<u16> {
        match self {
            Error::Http { status, .. } => Some(*status),
            Error::Operation { source, .. } => source.http_status(),
            _ => None,
        }
    }

    pub(crate) fn in_operation(self, operation: &'static str, device: &str) -> Self {
        match self {
            // Argument errors already name the offending input.
            Error::Validation(_) | Error::Operation { .. } => self,
            other => Error::Operation {
                operation,
                device: device.to_string(),
                source: Box::new(other),
            },
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
