//! Core crate for generating images from CivitAI checkpoints.
//!
//! An [`ImageGenerator`] is brought up once with [`ImageGenerator::initialize`], which downloads
//! the checkpoint when it is missing and loads the Stable Diffusion pipeline. Every
//! [`ImageGenerator::generate`] call then returns a PNG-encoded image.
//!
//! ```rust,no_run
//! use std::time::Instant;
//!
//! use civitai_rs_core::{GenerationRequest, GeneratorConfig, ImageGenerator};
//! use tracing::level_filters::LevelFilter;
//! use tracing_subscriber::EnvFilter;
//!
//! let filter = EnvFilter::builder()
//!     .with_default_directive(LevelFilter::INFO.into())
//!     .from_env_lossy();
//! tracing_subscriber::fmt().with_env_filter(filter).init();
//!
//! let generator = ImageGenerator::initialize(&GeneratorConfig::default())?;
//!
//! let start = Instant::now();
//!
//! let png = generator.generate(
//!     &GenerationRequest::new("A pony grazing in a meadow at sunrise.")
//!         .with_negative_prompt("blurry, low quality")
//!         .with_num_steps(30),
//! )?;
//!
//! let end = Instant::now();
//! println!("Took: {:.2}s", end.duration_since(start).as_secs_f32());
//!
//! std::fs::write("generated_pony.png", png)?;
//!
//! # Ok::<(), anyhow::Error>(())
//! ```

mod config;
mod error;
mod generator;
mod pipelines;
mod util;

pub use civitai_rs_common::{CivitaiModel, ModelFetcher, ModelSource, TokenSource};
pub use config::{GeneratorConfig, DEFAULT_MODEL_DIR, DEFAULT_MODEL_VERSION};
pub use error::GeneratorError;
pub use generator::{ensure_model, GenerationRequest, ImageGenerator};
pub use pipelines::{encode_png, DiffusionGenerationParams, ModelPipeline, Offloading, Pipeline};
pub use util::{ModelDType, TryIntoDType};
