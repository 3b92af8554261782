use std::io;

use thiserror::Error;

/// Errors surfaced by the extraction engine.
///
/// OAI-PMH protocol errors (`<error code="..">` in a response) are not
/// represented here: the repository interface logs them and reports an
/// empty or absent result instead.
#[derive(Debug, Error)]
pub enum ExtractorError {
    /// Underlying HTTP failure: connect, DNS, timeout, or a non-2xx status.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Exhaustive identifier listing processed more resumption tokens than
    /// allowed.
    #[error("maximum number of resumption tokens exceeded ({max})")]
    TokenLimitExceeded { max: u64 },

    /// A transfer-url filter could not be built or evaluated.
    #[error("{0}")]
    Filter(String),

    /// An operation was invoked with missing or conflicting arguments.
    #[error("{0}")]
    Usage(String),

    /// No collision-free filename could be found for a download.
    #[error("cannot find valid filename for requested file with url '{url}'")]
    Collision { url: String },

    /// Job identifier generation collided 100 times in a row.
    #[error("unable to generate unique job identifier")]
    IdentifierExhausted,

    /// A response body was not well-formed XML or missed required elements.
    #[error("malformed xml: {0}")]
    Xml(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<quick_xml::Error> for ExtractorError {
    fn from(value: quick_xml::Error) -> Self {
        ExtractorError::Xml(value.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ExtractorError>;
