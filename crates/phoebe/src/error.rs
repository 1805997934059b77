//! Server errors and their Gemini status mapping.

use smol_str::SmolStr;
use thiserror::Error;

/// Errors surfaced by the wiki engine and protocol handlers.
///
/// Every variant maps to a Gemini two-digit status via [`ServerError::status`];
/// the Titan and HTTP surfaces reuse the same mapping.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServerError {
    /// Request line or URL that cannot be parsed.
    #[error("bad request: {0}")]
    MalformedRequest(SmolStr),

    /// Request line longer than the 1024-byte cap.
    #[error("request line too long")]
    RequestTooLong,

    /// Authority names a host this server does not serve.
    #[error("unknown host '{0}'")]
    UnknownHost(SmolStr),

    /// Page, revision, or file that does not exist.
    #[error("'{0}' not found")]
    NotFound(SmolStr),

    /// Token not in the effective token set.
    #[error("Your token is the wrong token")]
    WrongToken,

    /// Write requires a client certificate and none was presented.
    #[error("client certificate required")]
    CertificateRequired,

    /// Client certificate presented but its fingerprint is not authorized.
    #[error("client certificate not authorized")]
    CertificateNotAuthorized,

    /// Declared Titan size exceeds the configured page size limit.
    #[error("This wiki does not allow more than {0} bytes per page")]
    SizeLimit(u64),

    /// Titan MIME type outside the allow-list.
    #[error("This wiki does not allow {0}")]
    MimeNotAllowed(SmolStr),

    /// Upload body shorter than its declared size.
    #[error("upload body truncated")]
    ShortRead,

    /// Page name rejected by store validation.
    #[error("invalid page name '{0}'")]
    InvalidName(SmolStr),

    /// Filesystem failure while reading or committing.
    #[error("store error '{0}'")]
    Store(SmolStr),

    /// Certificate or key material that cannot be loaded.
    #[error("certificate error '{0}'")]
    Certificate(SmolStr),

    /// Invalid startup or reload configuration.
    #[error("invalid config '{0}'")]
    InvalidConfig(SmolStr),
}

impl ServerError {
    /// The Gemini status code and meta text for this error.
    #[must_use]
    pub fn status(&self) -> (u8, String) {
        match self {
            Self::MalformedRequest(_) | Self::RequestTooLong | Self::ShortRead => {
                (59, self.to_string())
            }
            Self::WrongToken | Self::SizeLimit(_) | Self::MimeNotAllowed(_) => {
                (59, self.to_string())
            }
            Self::InvalidName(_) => (59, self.to_string()),
            Self::UnknownHost(_) => (53, self.to_string()),
            Self::NotFound(_) => (51, self.to_string()),
            Self::CertificateRequired => (60, self.to_string()),
            Self::CertificateNotAuthorized => (61, self.to_string()),
            Self::Store(_) | Self::Certificate(_) | Self::InvalidConfig(_) => {
                (40, self.to_string())
            }
        }
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        Self::Store(SmolStr::new(err.to_string()))
    }
}
