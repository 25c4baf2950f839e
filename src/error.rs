use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum SpiderError {
    #[error("{name} not set by user; pass --{flag} or set the environment variable {name}")]
    #[diagnostic(code(spider::config::credential))]
    MissingCredential { name: &'static str, flag: &'static str },

    #[error("{0}")]
    #[diagnostic(code(spider::config))]
    Configuration(String),

    #[error("no inputs declared for this spider")]
    #[diagnostic(code(spider::config::inputs))]
    NoInputs,

    #[error("invalid input specification: {0}")]
    #[diagnostic(code(spider::config::inputs))]
    InvalidInput(String),

    #[error("executable '{0}' not found")]
    #[diagnostic(code(spider::config::executable))]
    MissingExecutable(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("invalid spider name: {0}")]
    InvalidSpiderName(String),

    #[error("no XNAT object found for {0}")]
    #[diagnostic(code(spider::lookup))]
    NotOnXnat(String),

    #[error("file path does not exist: {0}")]
    #[diagnostic(code(spider::validation))]
    UploadPathMissing(PathBuf),

    #[error("upload value for resource {resource} is not a path or a list of paths")]
    #[diagnostic(code(spider::validation))]
    InvalidUploadValue { resource: String },

    #[error("upload queue already finalized")]
    QueueClosed,

    #[error("failed to stage input {input}: {reason}")]
    #[diagnostic(code(spider::staging))]
    Staging { input: String, reason: String },

    #[error("invalid xnat uri: {0}")]
    #[diagnostic(code(spider::staging::uri))]
    InvalidXnatUri(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("XNAT request failed: {0}")]
    XnatHttp(String),

    #[error("XNAT returned status {status}: {message}")]
    XnatStatus { status: u16, message: String },

    #[error("failed to parse manifest: {0}")]
    ManifestParse(String),

    #[error("failed to read {0}")]
    ManifestRead(PathBuf),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("command failed: {0}")]
    Command(String),

    #[error("failed to read image {path}: {message}")]
    Image { path: PathBuf, message: String },

    #[error("report generation failed: {0}")]
    Report(String),
}

impl SpiderError {
    /// Failures that abort the job before any processing starts.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            SpiderError::MissingCredential { .. }
                | SpiderError::Configuration(_)
                | SpiderError::NoInputs
                | SpiderError::InvalidInput(_)
                | SpiderError::MissingExecutable(_)
                | SpiderError::MissingTool(_)
                | SpiderError::InvalidSpiderName(_)
                | SpiderError::ManifestParse(_)
                | SpiderError::ManifestRead(_)
        )
    }
}
