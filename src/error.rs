//! Error types for the ccommit-rs library.
//!
//! All fallible operations return a [`Result<T>`], an alias for
//! `Result<T, CommitError>`.
//!
//! # Error Categories
//!
//! - **Configuration errors**: [`Config`], [`Json`], [`Spec`]
//! - **Collaborator errors**: [`Storage`], [`Archive`]
//! - **Request validation**: [`UnsupportedManifestType`],
//!   [`UnsupportedCompression`], [`InconsistentRequest`]
//! - **Pipeline consistency**: [`Internal`]
//! - **Blob access**: [`BlobNotFound`], [`UnsupportedOperation`], [`Io`]
//!
//! [`Config`]: CommitError::Config
//! [`Json`]: CommitError::Json
//! [`Spec`]: CommitError::Spec
//! [`Storage`]: CommitError::Storage
//! [`Archive`]: CommitError::Archive
//! [`UnsupportedManifestType`]: CommitError::UnsupportedManifestType
//! [`UnsupportedCompression`]: CommitError::UnsupportedCompression
//! [`InconsistentRequest`]: CommitError::InconsistentRequest
//! [`Internal`]: CommitError::Internal
//! [`BlobNotFound`]: CommitError::BlobNotFound
//! [`UnsupportedOperation`]: CommitError::UnsupportedOperation
//! [`Io`]: CommitError::Io
//!
//! # Conversion Traits
//!
//! `From` conversions are provided for `std::io::Error`,
//! `serde_json::Error`, and `oci_spec::OciSpecError`, so the `?` operator
//! works seamlessly with these error types.

/// Result type alias for operations that may return a CommitError.
pub type Result<T> = std::result::Result<T, CommitError>;

/// Error types for commit operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CommitError {
    /// A configuration document could not be parsed or produced.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The storage collaborator reported a failure.
    #[error("storage: {0}")]
    Storage(String),

    /// Archiving or compressing a stream failed.
    #[error("archive: {0}")]
    Archive(String),

    /// The requested manifest type is not one we can produce.
    #[error("no supported manifest types (attempted to use {0:?}, only know OCI v1 and Docker v2s2)")]
    UnsupportedManifestType(String),

    /// The image specs define no media type for this compressor.
    #[error("media type for {0}-compressed layers is not defined")]
    UnsupportedCompression(&'static str),

    /// The commit request contradicts itself.
    #[error("inconsistent commit request: {0}")]
    InconsistentRequest(String),

    /// The pipeline produced inconsistent state.
    #[error("internal error: {0}")]
    Internal(String),

    /// The requested blob is not part of the committed image.
    #[error("opening layer blob {0}")]
    BlobNotFound(String),

    /// The operation is not supported on this object.
    #[error("{0}")]
    UnsupportedOperation(&'static str),

    /// I/O error occurred during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An OCI value could not be parsed or built.
    #[error("OCI spec error: {0}")]
    Spec(#[from] oci_spec::OciSpecError),
}
