use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngageError {
    #[error("Not found")]
    NotFound,

    #[error("You have already voted in this poll")]
    AlreadyVoted,

    #[error("Selected option not found in the poll")]
    OptionNotFound,

    #[error("Poll is closed")]
    PollClosed,

    #[error("The specified post is not a poll")]
    NotAPoll,

    #[error("{0}")]
    InvalidState(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("SQL error: {0}")]
    Sql(#[from] rusqlite::Error),
}

pub type EngageResult<T> = Result<T, EngageError>;
