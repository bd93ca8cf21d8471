use std::{
    fmt::{self, Display},
    path::{Path, PathBuf},
};

use thiserror::Error;

/// Path marker preceding the model version id in CivitAI download URLs.
const MODELS_MARKER: &str = "/models/";
const DOWNLOAD_ENDPOINT: &str = "https://civitai.com/api/download/models";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ModelSourceError {
    #[error("URL `{0}` has no `/models/<id>` segment")]
    MissingModelId(String),
}

/// A CivitAI model download URL together with the model id extracted from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CivitaiModel {
    url: String,
    model_id: String,
}

impl CivitaiModel {
    /// Parse a download URL such as
    /// `https://civitai.com/api/download/models/1199750?type=Model&format=SafeTensor`.
    pub fn from_url<S: ToString>(url: S) -> Result<Self, ModelSourceError> {
        let url = url.to_string();
        let model_id = url
            .split_once(MODELS_MARKER)
            .map(|(_, rest)| rest)
            .and_then(|rest| rest.split(['?', '#', '/']).next())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ModelSourceError::MissingModelId(url.clone()))?
            .to_string();
        Ok(Self { url, model_id })
    }

    /// The pruned fp16 SafeTensor download of a model version.
    pub fn from_version_id(version_id: u64) -> Self {
        Self {
            url: format!(
                "{DOWNLOAD_ENDPOINT}/{version_id}?type=Model&format=SafeTensor&size=pruned&fp=fp16"
            ),
            model_id: version_id.to_string(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// File name the checkpoint is stored under: `civitai_model_<id>.safetensors`.
    pub fn filename(&self) -> String {
        format!("civitai_model_{}.safetensors", self.model_id)
    }

    pub fn local_path(&self, dir: impl AsRef<Path>) -> PathBuf {
        dir.as_ref().join(self.filename())
    }
}

/// Source from which to obtain the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// Downloaded into the model directory when not already present.
    Civitai(CivitaiModel),
    /// A checkpoint that must already exist on disk.
    LocalFile(PathBuf),
}

impl Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Civitai(model) => write!(f, "civitai model id: {}", model.model_id()),
            Self::LocalFile(path) => write!(f, "local file: {}", path.display()),
        }
    }
}

impl ModelSource {
    pub fn from_url<S: ToString>(url: S) -> Result<Self, ModelSourceError> {
        CivitaiModel::from_url(url).map(Self::Civitai)
    }

    pub fn local<P: Into<PathBuf>>(path: P) -> Self {
        Self::LocalFile(path.into())
    }

    /// Where the checkpoint lives (or will live) for a given model directory.
    pub fn local_path(&self, model_dir: impl AsRef<Path>) -> PathBuf {
        match self {
            Self::Civitai(model) => model.local_path(model_dir),
            Self::LocalFile(path) => path.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{CivitaiModel, ModelSource, ModelSourceError};

    #[test]
    fn derives_filename_from_download_url() {
        let model = CivitaiModel::from_url(
            "https://civitai.com/api/download/models/1199750?type=Model&format=SafeTensor&size=pruned&fp=fp16",
        )
        .unwrap();
        assert_eq!(model.model_id(), "1199750");
        assert_eq!(model.filename(), "civitai_model_1199750.safetensors");
        assert_eq!(
            model.local_path("models"),
            PathBuf::from("models/civitai_model_1199750.safetensors")
        );
    }

    #[test]
    fn derives_filename_for_any_identifier() {
        for (url, id) in [
            ("https://civitai.com/api/download/models/439889", "439889"),
            ("http://127.0.0.1:8080/api/download/models/7?x=1", "7"),
            ("https://civitai.com/api/download/models/abc/extra", "abc"),
            ("https://civitai.com/api/download/models/12#frag", "12"),
        ] {
            let model = CivitaiModel::from_url(url).unwrap();
            assert_eq!(model.filename(), format!("civitai_model_{id}.safetensors"));
        }
    }

    #[test]
    fn version_ids_build_parseable_urls() {
        let model = CivitaiModel::from_version_id(439889);
        assert_eq!(
            model.url(),
            "https://civitai.com/api/download/models/439889?type=Model&format=SafeTensor&size=pruned&fp=fp16"
        );
        assert_eq!(CivitaiModel::from_url(model.url()).unwrap(), model);
    }

    #[test]
    fn rejects_urls_without_model_id() {
        for url in [
            "https://civitai.com/api/download/",
            "https://civitai.com/api/download/models/",
            "https://civitai.com/api/download/models/?type=Model",
        ] {
            assert_eq!(
                CivitaiModel::from_url(url),
                Err(ModelSourceError::MissingModelId(url.to_string()))
            );
        }
    }

    #[test]
    fn local_sources_keep_their_path() {
        let source = ModelSource::local("/tmp/model.safetensors");
        assert_eq!(
            source.local_path("models"),
            PathBuf::from("/tmp/model.safetensors")
        );
        assert_eq!(source.to_string(), "local file: /tmp/model.safetensors");
    }
}
