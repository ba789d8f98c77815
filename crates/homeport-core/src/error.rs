use thiserror::Error;

#[derive(Error, Debug)]
pub enum HomeportError {
    #[error("Invalid credentials for user: {0}")]
    InvalidCredentials(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("User already exists: {0}")]
    AlreadyExists(String),

    /// The store cannot answer this kind of request (quota tracking disabled).
    #[error("Method disabled: {0}")]
    MethodDisabled(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl HomeportError {
    /// Whether the error means "enforcement unavailable" rather than a failure.
    pub fn is_method_disabled(&self) -> bool {
        matches!(self, HomeportError::MethodDisabled(_))
    }
}

pub type Result<T> = std::result::Result<T, HomeportError>;
