use std::fmt::{self, Display};
use std::time::Duration;

/// Which quota window turned a request away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaScope {
    /// Per-user quota for the current UTC calendar day.
    Daily,
    /// Single global quota for the current UTC calendar month.
    Global,
}

impl Display for QuotaScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaScope::Daily => write!(f, "daily"),
            QuotaScope::Global => write!(f, "global monthly"),
        }
    }
}

/// Classification of a provider failure so a future retry policy can be
/// layered on without touching call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Worth re-issuing later (timeout, 429, 5xx, connection trouble).
    Transient,
    /// Re-issuing the same request will not help (4xx, malformed response).
    Permanent,
}

#[derive(Debug, PartialEq)]
// As long as the struct member is private, everyone has to go through `new`,
// which logs the error at construction time.
pub struct Error(Box<ErrorDetails>);

impl Error {
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Box::new(details))
    }

    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }

    pub fn get_owned_details(self) -> ErrorDetails {
        *self.0
    }

    /// True for admission rejections and `ImageNotFound`: terminal outcomes
    /// with no side effects, as opposed to provider/storage failures.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self.get_details(),
            ErrorDetails::RejectedByCooldown { .. }
                | ErrorDetails::RejectedByQuota { .. }
                | ErrorDetails::ImageNotFound { .. }
        )
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

#[derive(Debug, PartialEq)]
pub enum ErrorDetails {
    Config {
        message: String,
    },
    ImageNotFound {
        user: String,
        sequence: u64,
    },
    Internal {
        message: String,
    },
    Ledger {
        message: String,
    },
    Metadata {
        message: String,
    },
    ObjectStoreDelete {
        message: String,
        key: String,
    },
    ObjectStoreRead {
        message: String,
        key: String,
    },
    ObjectStoreWrite {
        message: String,
        key: String,
    },
    Provider {
        message: String,
        status_code: Option<u16>,
        kind: ProviderErrorKind,
    },
    RejectedByCooldown {
        remaining: Duration,
    },
    RejectedByQuota {
        scope: QuotaScope,
        used: u64,
        limit: u64,
    },
}

impl ErrorDetails {
    /// Log level for this error. Rejections are expected traffic and stay at
    /// debug; collaborator failures are operational problems.
    fn level(&self) -> tracing::Level {
        match self {
            ErrorDetails::RejectedByCooldown { .. }
            | ErrorDetails::RejectedByQuota { .. }
            | ErrorDetails::ImageNotFound { .. } => tracing::Level::DEBUG,
            ErrorDetails::Provider {
                kind: ProviderErrorKind::Transient,
                ..
            }
            | ErrorDetails::Ledger { .. }
            | ErrorDetails::ObjectStoreDelete { .. } => tracing::Level::WARN,
            ErrorDetails::Config { .. }
            | ErrorDetails::Internal { .. }
            | ErrorDetails::Metadata { .. }
            | ErrorDetails::ObjectStoreRead { .. }
            | ErrorDetails::ObjectStoreWrite { .. }
            | ErrorDetails::Provider { .. } => tracing::Level::ERROR,
        }
    }

    pub fn log(&self) {
        let level = self.level();
        if level == tracing::Level::DEBUG {
            tracing::debug!("{self}");
        } else if level == tracing::Level::WARN {
            tracing::warn!("{self}");
        } else {
            tracing::error!("{self}");
        }
    }
}

impl Display for ErrorDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorDetails::Config { message } => {
                write!(f, "Configuration error: {message}")
            }
            ErrorDetails::ImageNotFound { user, sequence } => {
                write!(f, "No image #{sequence} exists for user {user}")
            }
            ErrorDetails::Internal { message } => {
                write!(f, "Internal error: {message}")
            }
            ErrorDetails::Ledger { message } => {
                write!(f, "Usage ledger unavailable: {message}")
            }
            ErrorDetails::Metadata { message } => {
                write!(f, "Image metadata error: {message}")
            }
            ErrorDetails::ObjectStoreDelete { message, key } => {
                write!(f, "Failed to delete artifact {key}: {message}")
            }
            ErrorDetails::ObjectStoreRead { message, key } => {
                write!(f, "Failed to read artifact {key}: {message}")
            }
            ErrorDetails::ObjectStoreWrite { message, key } => {
                write!(f, "Failed to write artifact {key}: {message}")
            }
            ErrorDetails::Provider {
                message,
                status_code,
                kind,
            } => {
                let kind = match kind {
                    ProviderErrorKind::Transient => "transient",
                    ProviderErrorKind::Permanent => "permanent",
                };
                match status_code {
                    Some(code) => {
                        write!(f, "Image provider error ({kind}, status {code}): {message}")
                    }
                    None => write!(f, "Image provider error ({kind}): {message}"),
                }
            }
            ErrorDetails::RejectedByCooldown { remaining } => {
                write!(
                    f,
                    "Please wait {} more seconds before the next request",
                    remaining.as_secs_f64().ceil() as u64
                )
            }
            ErrorDetails::RejectedByQuota { scope, used, limit } => {
                write!(f, "The {scope} limit of {limit} images is reached ({used} used)")
            }
        }
    }
}
