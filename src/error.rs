use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum HarvestError {
    #[error("invalid entity id: {0}")]
    InvalidEntityId(String),

    #[error("malformed entity: {0}")]
    MalformedEntity(String),

    #[error("invalid storage URI: {0}")]
    InvalidStorageUri(String),

    #[error("file {0} has no storage URI")]
    MissingStorageUri(String),

    #[error("entity not in cache: {0}")]
    NotCached(String),

    #[error("portal request failed: {0}")]
    PortalHttp(String),

    #[error("portal returned status {status}: {message}")]
    PortalStatus { status: u16, message: String },

    #[error(
        "batch integrity check failed: {resolved} of {requested} entities resolved, missing {missing:?}"
    )]
    #[diagnostic(help("the portal did not return every requested entity; the harvest is incomplete"))]
    MissingEntities {
        requested: usize,
        resolved: usize,
        missing: Vec<String>,
    },

    #[error("storage request failed: {0}")]
    StorageHttp(String),

    #[error("storage returned status {status}: {message}")]
    StorageStatus { status: u16, message: String },

    #[error("transfer service request failed: {0}")]
    TransferHttp(String),

    #[error("transfer service returned status {status}: {message}")]
    TransferStatus { status: u16, message: String },

    #[error("transfer job {job} finished with status {status} (source {source_bucket}, destination {destination_bucket}, manifest {manifest})")]
    TransferFailed {
        job: String,
        status: String,
        source_bucket: String,
        destination_bucket: String,
        manifest: String,
    },

    #[error("workspace request failed: {0}")]
    WorkspaceHttp(String),

    #[error("workspace returned status {status}: {message}")]
    WorkspaceStatus { status: u16, message: String },

    #[error("missing config file harvest.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("unknown profile: {0}")]
    UnknownProfile(String),

    #[error("config file does not set {0}")]
    IncompleteConfig(String),

    #[error("profile {profile} does not set {field}")]
    IncompleteProfile { profile: String, field: String },

    #[error("missing credentials: environment variable {0} is not set")]
    MissingCredentials(String),

    #[error("field {field} of {kind} {id} was left unresolved")]
    UnresolvedField {
        kind: String,
        id: String,
        field: String,
    },

    #[error("failed to start fetch worker pool: {0}")]
    WorkerPool(String),

    #[error("failed to serialize cell: {0}")]
    Serialize(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
