use thiserror::Error;

/// A `Result` typedef to use with [`CasseroleError`].
pub type Result<T> = std::result::Result<T, CasseroleError>;

/// Error taxonomy shared by every casserole crate.
///
/// The variants map directly onto the error taxonomy in the design notes: most
/// are transient I/O surfaced to the caller, a handful are policy outcomes
/// (`NotCacheable`, `Chunked`) that callers are expected to match on rather
/// than treat as failures.
#[derive(Error, Debug)]
pub enum CasseroleError {
    /// The response is legal but policy forbids caching; callers should
    /// fall back to a passthrough fetch.
    #[error("not cacheable")]
    NotCacheable,
    /// Origin used chunked transfer without a Content-Length; block planning
    /// is impossible, callers should fall back to a passthrough fetch.
    #[error("chunked transfer encoding, cannot block-plan")]
    Chunked,
    /// Origin returned a non-200 status for a HEAD, or hydration of a block
    /// failed in a way that should surface as 404 to the client.
    #[error("not found: {0}")]
    NotFound(String),
    /// Malformed `Range` header.
    #[error("invalid range")]
    InvalidRange,
    /// Filesystem or network I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Failure reaching the origin. Carries the origin client's own message
    /// rather than a `#[from] reqwest::Error` so this crate doesn't need to
    /// depend on `reqwest` just to name the error type.
    #[error("origin request failed: {0}")]
    Origin(String),
    /// URL parsing failure.
    #[error(transparent)]
    InvalidUrl(#[from] url::ParseError),
    /// (De)serialization failure.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Embedded KV store failure (disk block store's timestamp table).
    #[error("disk store error: {0}")]
    DiskStore(String),
    /// Coordination KV (etcd) failure.
    #[error("coordination store error: {0}")]
    Coordination(String),
    /// Catch-all for conditions that don't fit the taxonomy above.
    #[error("{0}")]
    Other(String),
}
