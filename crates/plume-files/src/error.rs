use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FileError {
    #[error("invalid file id")]
    InvalidFileId,
    #[error("wrong file type")]
    WrongFileType,
    #[error("wrong local location: {0}")]
    WrongLocalLocation(String),
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error("can't share ownership")]
    CantShareOwnership,
    #[error("wrong remote location")]
    WrongRemoteLocation,
    #[error("wrong persistent id")]
    WrongPersistentId,
    #[error("unsupported persistent id version {0}")]
    UnsupportedVersion(u8),
    #[error("cancelled")]
    Cancelled,
    #[error("io: {0}")]
    Io(String),
    #[error("transfer: {message}")]
    Transfer { message: String, retryable: bool },
    #[error("generation failed: {0}")]
    GenerationFailed(String),
}

impl FileError {
    pub fn transfer(message: impl Into<String>, retryable: bool) -> Self {
        FileError::Transfer {
            message: message.into(),
            retryable,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, FileError::Transfer { retryable: true, .. })
    }

    /// Errors that mean the local copy can no longer be trusted.
    pub fn is_local_trouble(&self) -> bool {
        matches!(
            self,
            FileError::Io(_) | FileError::FileNotFound(_) | FileError::WrongLocalLocation(_)
        )
    }
}

impl From<std::io::Error> for FileError {
    fn from(err: std::io::Error) -> Self {
        FileError::Io(err.to_string())
    }
}
