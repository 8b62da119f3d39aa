// Error types for the batch client. Authentication, credential and catalog
// errors abort the run. Execution errors are scoped to a single file and end
// up in the batch report, except for `ExecutionError::Auth` which is fatal.

use std::path::PathBuf;

use thiserror::Error;

/// The credential file could not be written.
#[derive(Debug, Error)]
pub enum CredentialStoreError {
    #[error("failed to write credentials to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode credentials: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors raised while obtaining or renewing an access token.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The device-code, token or refresh request returned a non-success status.
    #[error("auth endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The user did not confirm the device code before it expired.
    ///
    /// A denied confirmation looks the same to the polling loop, so it also
    /// ends up here.
    #[error("device code not confirmed after {waited} seconds")]
    Timeout { waited: u64 },

    /// Token refresh failed. The user has to go through the device login again.
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("session has an expired access token but no refresh token")]
    MissingRefreshToken,

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Store(#[from] CredentialStoreError),
}

/// Errors raised while listing workflows.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("workflow listing returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// The user picked a workflow number outside the listed range.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid selection {choice:?}: pick a number between 1 and {len}")]
pub struct InvalidSelection {
    pub choice: String,
    pub len: usize,
}

/// Errors raised while processing a single image.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("upload of {} failed with HTTP {status}: {body}", path.display())]
    Upload {
        path: PathBuf,
        status: u16,
        body: String,
    },
    #[error("status query for execution {id} failed with HTTP {status}: {body}")]
    Status { id: String, status: u16, body: String },
    #[error("download of {result_path} failed with HTTP {status}: {body}")]
    Download {
        result_path: String,
        status: u16,
        body: String,
    },
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Auth(#[from] AuthError),
}
