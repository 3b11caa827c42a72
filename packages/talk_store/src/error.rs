//! Storage error type.

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The talk does not exist, or exists outside the caller's scope.
    #[error("talk not found")]
    NotFound,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("talk {0} is closed")]
    TalkClosed(String),

    #[error("talk already attached to servicer {0}")]
    AlreadyAssigned(u64),

    #[error("database schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: i64, supported: i64 },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::NotFound => "not_found",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::TalkClosed(_) => "talk_closed",
            Self::AlreadyAssigned(_) => "already_assigned",
            Self::SchemaTooNew { .. } => "schema_too_new",
            Self::Database(_) => "database",
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
