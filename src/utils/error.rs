use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("API request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("CSV processing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Source error: {message}")]
    Source { message: String },

    #[error("Transform error on record {position}: {message}")]
    Transform { position: usize, message: String },

    #[error("Dispatch error: {message}")]
    Dispatch { message: String },
}

pub type Result<T> = std::result::Result<T, LoaderError>;
