use std::path::PathBuf;

use civitai_rs_common::{CivitaiModel, ModelSource, TokenSource};

use crate::{pipelines::Offloading, util::ModelDType};

/// Model version downloaded by [`GeneratorConfig::default`].
pub const DEFAULT_MODEL_VERSION: u64 = 439889;
pub const DEFAULT_MODEL_DIR: &str = "models";

/// Everything needed to bring an [`ImageGenerator`](crate::ImageGenerator) up.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub source: ModelSource,
    /// Directory holding downloaded checkpoints and their converted components.
    pub model_dir: PathBuf,
    pub token: TokenSource,
    /// CLIP `tokenizer.json`. Fetched from the Hugging Face hub when unset.
    pub tokenizer: Option<PathBuf>,
    pub dtype: ModelDType,
    pub offloading: Option<Offloading>,
    /// Set to not show progress bars.
    pub silent: bool,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            source: ModelSource::Civitai(CivitaiModel::from_version_id(DEFAULT_MODEL_VERSION)),
            model_dir: PathBuf::from(DEFAULT_MODEL_DIR),
            token: TokenSource::default(),
            tokenizer: None,
            dtype: ModelDType::Auto,
            offloading: None,
            silent: false,
        }
    }
}

impl GeneratorConfig {
    /// Where the checkpoint is expected on disk.
    pub fn checkpoint_path(&self) -> PathBuf {
        self.source.local_path(&self.model_dir)
    }
}
