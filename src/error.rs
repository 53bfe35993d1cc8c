use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Message(String),
    #[error("missing required input: {}", .missing.join(", "))]
    Validation { missing: Vec<&'static str> },
    #[error("generation failed: {0}")]
    Generation(String),
    #[error("a generation is already in progress")]
    GenerationInProgress,
    #[error("unknown style preset: {0}")]
    UnknownStyle(String),
    #[error("invalid import file: {0}")]
    Format(String),
    #[error("index {index} is out of bounds for history of length {len}")]
    Index { index: usize, len: usize },
    #[error("export failed for {asset}: {reason}")]
    Export { asset: String, reason: String },
    #[error("stored {key} is corrupt: {reason}")]
    StorageCorruption { key: String, reason: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("image decode/encode error: {0}")]
    Image(#[from] image::ImageError),
    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl AppError {
    pub fn msg<T: Into<String>>(message: T) -> Self {
        Self::Message(message.into())
    }

    pub fn format<T: Into<String>>(message: T) -> Self {
        Self::Format(message.into())
    }

    pub fn generation<T: Into<String>>(message: T) -> Self {
        Self::Generation(message.into())
    }
}
