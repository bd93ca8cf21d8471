//! Model sources, credentials and the streaming CivitAI downloader shared by the civitai_rs crates.

mod download;
mod model_source;
mod progress;
mod tokens;

pub use download::{
    fetch, DownloadError, DownloadRequest, Downloader, ModelFetcher, BROWSER_USER_AGENT,
    DEFAULT_CHUNK_SIZE,
};
pub use model_source::*;
pub use progress::{percentage, progress_line, DownloadProgress};
pub use tokens::{get_token, TokenSource, CIVITAI_TOKEN_VAR};
