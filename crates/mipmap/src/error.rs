use std::path::PathBuf;

use task_queue::TaskQueueError;

#[derive(Debug, thiserror::Error)]
pub enum MipmapError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("unsupported image {path}: {reason}")]
    UnsupportedImage { path: PathBuf, reason: String },
    #[error("corrupt cache file {path}: {reason}")]
    CorruptCache { path: PathBuf, reason: &'static str },
    #[error("block compression failed: {0}")]
    Compression(String),
    #[error("texture creation failed: {0}")]
    Texture(String),
    #[error(transparent)]
    TaskQueue(#[from] TaskQueueError),
}

impl MipmapError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn decode(path: impl Into<PathBuf>, source: image::ImageError) -> Self {
        Self::Decode {
            path: path.into(),
            source,
        }
    }
}
