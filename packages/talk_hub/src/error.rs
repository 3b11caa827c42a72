//! Error taxonomy shared by controllers, registries and the broker transport.

use talk_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// A required input was missing. Rejected before anything is queued.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A bounded queue was full. Callers retry or drop.
    #[error("canceled: queue is full")]
    Canceled,

    #[error("not found")]
    NotFound,

    #[error("unauthorized")]
    Unauthorized,

    #[error("transport broken: {0}")]
    TransportBroken(String),

    /// A session mailbox was full or its reader went away.
    #[error("aborted: session mailbox unavailable")]
    Aborted,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl HubError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Canceled => "canceled",
            Self::NotFound => "not_found",
            Self::Unauthorized => "unauthorized",
            Self::TransportBroken(_) => "transport_broken",
            Self::Aborted => "aborted",
            Self::Store(StoreError::NotFound) => "not_found",
            Self::Store(StoreError::TalkClosed(_)) => "talk_closed",
            Self::Store(_) => "storage",
        }
    }
}

pub type Result<T> = std::result::Result<T, HubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_not_found_reads_as_not_found() {
        let err: HubError = StoreError::NotFound.into();
        assert_eq!(err.error_code(), "not_found");
        assert_eq!(HubError::Canceled.error_code(), "canceled");
        let closed: HubError = StoreError::TalkClosed("t1".into()).into();
        assert_eq!(closed.error_code(), "talk_closed");
        assert_eq!(
            HubError::InvalidArgument("talk_id").to_string(),
            "invalid argument: talk_id"
        );
    }
}
