use std::any::Any;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HprofRetainError {
    #[error("malformed dump at byte {offset}: {message}")]
    MalformedDump { offset: u64, message: String },
    #[error("unsupported hprof format version '{found}'")]
    UnsupportedFormatVersion { found: String },
    #[error("invalid identifier size {size} (expected 4 or 8 bytes)")]
    InvalidIdSize { size: u32 },
    #[error("index is corrupt: {message}")]
    IndexCorrupt { message: String },
    #[error("no index present at '{path}'")]
    IndexMissing { path: String },
    #[error(
        "working-set budget of {budget} bytes cannot hold the {needed} bytes this phase requires; \
         raise the memory budget"
    )]
    ResourceExhausted { needed: u64, budget: u64 },
    #[error("analysis cancelled")]
    Cancelled,
    #[error("condensed component graph is not acyclic")]
    CycleUnresolved,
    #[error(transparent)]
    StdIoError(#[from] std::io::Error),
    #[error("manifest error: {0}")]
    ManifestError(#[from] serde_json::Error),
    #[error("worker thread panicked")]
    StdThreadError { e: Box<dyn Any + Send + 'static> },
}

impl HprofRetainError {
    pub fn malformed(offset: u64, message: impl Into<String>) -> Self {
        HprofRetainError::MalformedDump {
            offset,
            message: message.into(),
        }
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        HprofRetainError::IndexCorrupt {
            message: message.into(),
        }
    }
}
