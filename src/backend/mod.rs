//! The generation backend seam.
//!
//! A backend is synchronous and slow, and may hold expensive state (a loaded
//! pipeline, a GPU context). The worker only ever calls it from one place at a
//! time, on a blocking thread.

use std::path::PathBuf;

use thiserror::Error;

use crate::models::{GeneratedImage, ResolvedLora};

pub mod sd_cli;

pub use sd_cli::SdCliBackend;

/// Everything a backend needs for one image, with prompt prefixes applied and
/// LoRA paths already resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
  pub pos_prompt: String,
  pub neg_prompt: String,
  pub num_inference_steps: u32,
  pub guidance_scale: f32,
  pub height: u32,
  pub width: u32,
  pub base_model: Option<String>,
  pub loras: Vec<ResolvedLora>,
  pub seed: Option<u64>,
}

#[derive(Debug, Error)]
pub enum BackendError {
  #[error("backend initialisation failed: {0}")]
  Init(String),

  #[error("base model not found: {}", .0.display())]
  ModelNotFound(PathBuf),

  #[error("generator exited with {status}: {stderr}")]
  Process { status: String, stderr: String },

  #[error("generator produced no image")]
  NoOutput,

  #[error(transparent)]
  Io(#[from] std::io::Error),
}

pub trait GenerationBackend: Send + Sync {
  /// Produces one image. Must release any per-call state before returning.
  fn generate(&self, request: &GenerationRequest) -> Result<GeneratedImage, BackendError>;
}
