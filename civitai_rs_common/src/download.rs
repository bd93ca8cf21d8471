use std::{
    ffi::OsString,
    fs::{self, File},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use reqwest::{blocking::Client, header::USER_AGENT};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{progress::DownloadProgress, CivitaiModel, ModelSourceError};

/// Size of each chunk read from the response body.
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// CivitAI rejects some requests that do not look like they come from a browser.
pub const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error(transparent)]
    InvalidUrl(#[from] ModelSourceError),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed reading response body: {0}")]
    Body(#[source] io::Error),
    #[error("I/O error on `{}`: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl DownloadError {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A single authenticated checkpoint download.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub token: String,
    pub output_dir: PathBuf,
}

impl DownloadRequest {
    pub fn new<U: ToString, T: ToString, P: Into<PathBuf>>(url: U, token: T, output_dir: P) -> Self {
        Self {
            url: url.to_string(),
            token: token.to_string(),
            output_dir: output_dir.into(),
        }
    }

    /// `<output_dir>/civitai_model_<id>.safetensors`
    pub fn destination(&self) -> Result<PathBuf, ModelSourceError> {
        CivitaiModel::from_url(&self.url).map(|model| model.local_path(&self.output_dir))
    }
}

/// Anything able to turn a [`DownloadRequest`] into a file on disk.
///
/// `None` is the absence signal: no artifact was produced.
pub trait ModelFetcher {
    fn fetch_model(&self, request: &DownloadRequest) -> Option<PathBuf>;
}

/// Blocking, authenticated, chunked HTTP downloader.
pub struct Downloader {
    client: Client,
    chunk_size: usize,
    silent: bool,
}

impl Downloader {
    /// Set `silent` to not show a progress bar.
    pub fn new(silent: bool) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(None)
            .build()?;
        Ok(Self {
            client,
            chunk_size: DEFAULT_CHUNK_SIZE,
            silent,
        })
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Download the checkpoint, returning its path or `None` on any failure.
    ///
    /// Failures are logged. Nothing is left on disk for a failed transfer.
    pub fn fetch(&self, request: &DownloadRequest) -> Option<PathBuf> {
        match self.try_fetch(request) {
            Ok(path) => Some(path),
            Err(e) => {
                error!("Error downloading model: {e}");
                None
            }
        }
    }

    /// Like [`Downloader::fetch`], but reports why the transfer failed.
    pub fn try_fetch(&self, request: &DownloadRequest) -> Result<PathBuf, DownloadError> {
        let destination = request.destination()?;
        fs::create_dir_all(&request.output_dir).map_err(DownloadError::io(&request.output_dir))?;

        info!("Downloading model from CivitAI...");
        info!("URL: {}", request.url);
        info!("Output: {}", destination.display());

        let partial = partial_path(&destination);
        let downloaded = match self.stream_to_file(request, &partial) {
            Ok(downloaded) => downloaded,
            Err(e) => {
                if let Err(cleanup) = fs::remove_file(&partial) {
                    if cleanup.kind() != io::ErrorKind::NotFound {
                        warn!("Could not remove {}: {cleanup}", partial.display());
                    }
                }
                return Err(e);
            }
        };
        fs::rename(&partial, &destination).map_err(DownloadError::io(&destination))?;

        info!("Download completed successfully! ({downloaded} bytes)");
        info!("Model saved to: {}", destination.display());
        Ok(destination)
    }

    fn stream_to_file(&self, request: &DownloadRequest, path: &Path) -> Result<u64, DownloadError> {
        let mut response = self
            .client
            .get(&request.url)
            .bearer_auth(&request.token)
            .header(USER_AGENT, BROWSER_USER_AGENT)
            .send()?
            .error_for_status()?;

        let progress = DownloadProgress::new(response.content_length(), self.silent);
        let mut file = File::create(path).map_err(DownloadError::io(path))?;
        let mut buffer = vec![0u8; self.chunk_size];
        let mut downloaded = 0u64;

        let outcome = loop {
            let read = match response.read(&mut buffer) {
                Ok(0) => break Ok(()),
                Ok(read) => read,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(DownloadError::Body(e)),
            };
            if let Err(e) = file.write_all(&buffer[..read]) {
                break Err(DownloadError::io(path)(e));
            }
            downloaded += read as u64;
            progress.update(downloaded);
        };
        let outcome = outcome.and_then(|()| file.flush().map_err(DownloadError::io(path)));

        match outcome {
            Ok(()) => {
                progress.finish();
                Ok(downloaded)
            }
            Err(e) => {
                progress.abandon();
                Err(e)
            }
        }
    }
}

impl ModelFetcher for Downloader {
    fn fetch_model(&self, request: &DownloadRequest) -> Option<PathBuf> {
        self.fetch(request)
    }
}

/// Download `url` into `output_dir` with a fresh [`Downloader`].
pub fn fetch<P: Into<PathBuf>>(url: &str, token: &str, output_dir: P) -> Option<PathBuf> {
    let downloader = match Downloader::new(false) {
        Ok(downloader) => downloader,
        Err(e) => {
            error!("Could not create HTTP client: {e}");
            return None;
        }
    };
    downloader.fetch(&DownloadRequest::new(url, token, output_dir))
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(OsString::from)
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{partial_path, DownloadRequest};

    #[test]
    fn partial_file_sits_next_to_destination() {
        assert_eq!(
            partial_path(&PathBuf::from("models/civitai_model_1.safetensors")),
            PathBuf::from("models/civitai_model_1.safetensors.part")
        );
    }

    #[test]
    fn request_destination_uses_derived_filename() {
        let request = DownloadRequest::new(
            "https://civitai.com/api/download/models/1199750?type=Model&format=SafeTensor&size=pruned&fp=fp16",
            "token",
            "models",
        );
        assert_eq!(
            request.destination().unwrap(),
            PathBuf::from("models/civitai_model_1199750.safetensors")
        );
    }
}
