use thiserror::Error;

/// Failures of a single watch installation. None of these escape the
/// initialization entrypoint; they end up in `InitSummary::failures`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WatchError {
    #[error("value at `{0}` is not an ordered, indexable collection")]
    SequenceNotArray(String),

    #[error("sequence already instrumented (signature {0})")]
    AlreadyInstrumented(String),

    #[error("no native change subscription on this sequence")]
    NativeObservationUnavailable,

    #[error("append interception could not be installed: {0}")]
    FallbackInstallFailed(String),

    #[error("store `{0}` not found")]
    StoreNotFound(String),

    #[error("no handler registered under `{0}`")]
    UnknownHandler(String),
}

impl WatchError {
    /// `AlreadyInstrumented` is a safe no-op, not something to surface loudly.
    pub fn is_benign(&self) -> bool {
        matches!(self, WatchError::AlreadyInstrumented(_))
    }
}

/// One intercepted response body that could not be turned into records.
#[derive(Debug, Error)]
pub enum NetworkDecodeError {
    #[error("response body from {url} is not valid JSON: {source}")]
    InvalidJson {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("response body from {url} is not valid base64")]
    InvalidBase64 { url: String },

    #[error("response body from {url} has no record-shaped list")]
    NoRecordList { url: String },
}

/// Hard failures. Only the sandbox itself failing is fatal to an extraction.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("script sandbox failed: {0}")]
    Sandbox(String),

    #[error("page snapshot could not be decoded: {0}")]
    SnapshotDecode(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type HarvestResult<T> = std::result::Result<T, HarvestError>;
