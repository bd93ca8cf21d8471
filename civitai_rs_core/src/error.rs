use std::path::PathBuf;

use civitai_rs_common::TokenSource;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GeneratorError {
    /// The checkpoint has to be downloaded but no token is available.
    #[error("no CivitAI token available from `{token_source}`, it is required to download the model")]
    MissingCredential { token_source: TokenSource },
    #[error("downloading the model from {url} failed")]
    DownloadFailed { url: String },
    #[error("checkpoint {} does not exist", .path.display())]
    MissingCheckpoint { path: PathBuf },
    #[error("invalid generation request: {0}")]
    InvalidRequest(String),
}
