use serde::Serialize;

pub type ConvertResult<T> = Result<T, ConvertError>;

#[derive(thiserror::Error, Debug)]
pub enum ConvertError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("unsupported input: {0}")]
    UnsupportedInput(String),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("scheduler at capacity: {0}")]
    Capacity(String),

    #[error("job not found")]
    NotFound,

    #[error("job output not ready")]
    NotReady,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Wire-level classification of a [`ConvertError`].
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidParams,
    UnsupportedInput,
    EncodingFailed,
    AtCapacity,
    NotFound,
    NotReady,
    Internal,
}

impl ConvertError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedInput(msg.into())
    }

    pub fn encoding(msg: impl Into<String>) -> Self {
        Self::Encoding(msg.into())
    }

    pub fn capacity(msg: impl Into<String>) -> Self {
        Self::Capacity(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::InvalidParams,
            Self::UnsupportedInput(_) => ErrorKind::UnsupportedInput,
            Self::Encoding(_) => ErrorKind::EncodingFailed,
            Self::Capacity(_) => ErrorKind::AtCapacity,
            Self::NotFound => ErrorKind::NotFound,
            Self::NotReady => ErrorKind::NotReady,
            Self::Io(_) => ErrorKind::Internal,
        }
    }
}

impl From<image::ImageError> for ConvertError {
    fn from(err: image::ImageError) -> Self {
        Self::UnsupportedInput(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_prefixes_are_stable() {
        assert!(ConvertError::validation("x")
            .to_string()
            .contains("validation error:"));
        assert!(ConvertError::unsupported("x")
            .to_string()
            .contains("unsupported input:"));
        assert!(ConvertError::encoding("x")
            .to_string()
            .contains("encoding error:"));
        assert!(ConvertError::capacity("x")
            .to_string()
            .contains("at capacity"));
    }

    #[test]
    fn kinds_follow_variants() {
        assert_eq!(ConvertError::validation("x").kind(), ErrorKind::InvalidParams);
        assert_eq!(ConvertError::NotReady.kind(), ErrorKind::NotReady);
        let io = ConvertError::from(std::io::Error::other("boom"));
        assert_eq!(io.kind(), ErrorKind::Internal);
        assert!(io.to_string().contains("boom"));
    }
}
