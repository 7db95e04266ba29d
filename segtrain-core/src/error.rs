use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to decode image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("annotation table error: {0}")]
    Csv(#[from] csv::Error),

    #[error("malformed annotation: {0}")]
    Annotation(String),

    #[error("invalid run-length encoding: {0}")]
    Rle(String),

    #[error("unknown augmentation level `{0}`, expected one of: default, 1, 2")]
    UnknownAugmentation(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("expected {} to exist", .0.display())]
    MissingFile(PathBuf),

    #[error("failed to read tensor data: {0}")]
    Tensor(String),

    #[error("record error: {0}")]
    Record(String),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<burn::record::RecorderError> for Error {
    fn from(err: burn::record::RecorderError) -> Self {
        Error::Record(err.to_string())
    }
}
