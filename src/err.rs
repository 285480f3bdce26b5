pub type ReconcilerResult<T> = Result<T, ReconcilerError>;

/// Errors from decoding/validating the input routing spec.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("malformed JSON: {0}")]
    MalformedJson(#[from] serde_json::Error),
    #[error("unsupported version {0} (only version 2 is accepted)")]
    UnsupportedVersion(i64),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid regular expression '{pattern}': {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("duplicate hostname in vhosts map: {0}")]
    DuplicateHostname(String),
}

/// Errors writing the backend file to disk.
#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    #[error("failed to encode backend file: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to write temp file: {0}")]
    TempWrite(#[source] std::io::Error),
    #[error("failed to rename temp file into place: {0}")]
    Rename(#[source] std::io::Error),
}

/// Errors dispatching a reload request to the proxy.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("reload request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("reload request cancelled")]
    Cancelled,
    #[error("reload rejected by proxy (status {status}): {message}")]
    NonSuccess { status: u16, message: String },
}

/// Errors from a routing-spec source (ConfigMap or file).
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
    #[error("I/O error reading spec file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to watch spec file: {0}")]
    Notify(#[from] notify::Error),
    #[error("ConfigMap '{0}' is missing required key 'routing.json'")]
    MissingKey(String),
    #[error("routing spec source was deleted")]
    SourceGone,
}

/// Top-level error returned from `Reconciler::run`.
#[derive(Debug, thiserror::Error)]
pub enum ReconcilerError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Writer(#[from] WriterError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
    #[error("initial reload failed: {0}")]
    InitialReloadFailed(#[source] Box<ReconcilerError>),
    #[error("reload retries exhausted")]
    RetriesExhausted,
    #[error("routing spec source is gone; reconciler cannot continue")]
    SourceGone,
    #[error("context cancelled")]
    Cancelled,
}
