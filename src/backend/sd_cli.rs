//! Backend that shells out to the stable-diffusion.cpp `sd` command line tool.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info, warn};

use super::{BackendError, GenerationBackend, GenerationRequest};
use crate::config::BackendConfig;
use crate::models::{GeneratedImage, ResolvedLora};

const STDERR_TAIL: usize = 512;

pub struct SdCliBackend {
  config: BackendConfig,
  ready: OnceLock<Result<(), String>>,
  call_seq: AtomicU64,
}

/// Scratch output that is removed however the call ends.
struct ScratchFile(PathBuf);

impl Drop for ScratchFile {
  fn drop(&mut self) {
    if self.0.exists() {
      if let Err(e) = fs::remove_file(&self.0) {
        warn!("Failed to remove scratch file {}: {}", self.0.display(), e);
      }
    }
  }
}

impl SdCliBackend {
  pub fn new(config: BackendConfig) -> Self {
    Self { config, ready: OnceLock::new(), call_seq: AtomicU64::new(0) }
  }

  fn initialise(&self) -> Result<(), String> {
    info!("Initialising sd backend ({})", self.config.sd_binary.display());
    let binary = &self.config.sd_binary;
    if binary.components().count() > 1 && !binary.exists() {
      return Err(format!("generator binary not found at {}", binary.display()));
    }
    fs::create_dir_all(&self.config.scratch_dir)
      .map_err(|e| format!("cannot create scratch dir {}: {}", self.config.scratch_dir.display(), e))?;
    if !self.config.base_model_path.exists() {
      warn!(
        "Default base model {} does not exist; only requests naming a model will succeed",
        self.config.base_model_path.display()
      );
    }
    info!("sd backend ready");
    Ok(())
  }

  fn ensure_ready(&self) -> Result<(), BackendError> {
    self.ready
      .get_or_init(|| self.initialise())
      .clone()
      .map_err(BackendError::Init)
  }

  /// Picks the checkpoint for a request: the configured default, an absolute
  /// path, or a name relative to the models directory.
  pub fn model_path(&self, base_model: Option<&str>) -> PathBuf {
    match base_model.map(str::trim).filter(|m| !m.is_empty()) {
      None => self.config.base_model_path.clone(),
      Some(model) if Path::new(model).is_absolute() => PathBuf::from(model),
      Some(model) => self.config.models_dir.join(model),
    }
  }

  /// Command line for one call, minus the executable.
  pub fn build_args(&self, request: &GenerationRequest, model: &Path, output: &Path) -> Vec<OsString> {
    let (lora_dir, prompt) = apply_loras(&request.pos_prompt, &request.loras);

    let mut args: Vec<OsString> = vec![
      "--model".into(),
      model.into(),
      "--prompt".into(),
      prompt.into(),
      "--negative-prompt".into(),
      request.neg_prompt.clone().into(),
      "--steps".into(),
      request.num_inference_steps.to_string().into(),
      "--cfg-scale".into(),
      request.guidance_scale.to_string().into(),
      "--height".into(),
      request.height.to_string().into(),
      "--width".into(),
      request.width.to_string().into(),
      "--output".into(),
      output.into(),
    ];
    if let Some(vae) = &self.config.vae_path {
      args.push("--vae".into());
      args.push(vae.into());
    }
    if let Some(dir) = lora_dir {
      args.push("--lora-model-dir".into());
      args.push(dir.into());
    }
    if let Some(seed) = request.seed {
      args.push("--seed".into());
      args.push(seed.to_string().into());
    }
    args.extend(self.config.extra_args.iter().map(OsString::from));
    args
  }
}

/// Appends `<lora:NAME:SCALE>` tags for every LoRA sharing the first LoRA's
/// directory; the generator takes a single LoRA directory per call.
fn apply_loras(prompt: &str, loras: &[ResolvedLora]) -> (Option<PathBuf>, String) {
  let Some(first) = loras.first() else {
    return (None, prompt.to_string());
  };
  let dir = first.path.parent().map(Path::to_path_buf).unwrap_or_default();

  let mut prompt = prompt.to_string();
  let mut applied = Vec::new();
  for lora in loras {
    if lora.path.parent() != Some(dir.as_path()) {
      warn!(
        "LoRA {} is outside {} and cannot be combined with it, skipping",
        lora.path.display(),
        dir.display()
      );
      continue;
    }
    let adapter = lora.adapter_name();
    prompt.push_str(&format!(" <lora:{}:{}>", adapter, lora.scale));
    applied.push(adapter);
  }
  info!("Applying LoRAs: {:?}", applied);
  (Some(dir), prompt)
}

impl GenerationBackend for SdCliBackend {
  fn generate(&self, request: &GenerationRequest) -> Result<GeneratedImage, BackendError> {
    self.ensure_ready()?;

    let model = self.model_path(request.base_model.as_deref());
    if !model.exists() {
      return Err(BackendError::ModelNotFound(model));
    }

    let seq = self.call_seq.fetch_add(1, Ordering::Relaxed);
    let scratch = ScratchFile(
      self.config.scratch_dir.join(format!("sd-{}-{}.png", std::process::id(), seq)),
    );
    let args = self.build_args(request, &model, &scratch.0);

    info!("Generating image for prompt: '{}'", request.pos_prompt);
    if let Some(seed) = request.seed {
      info!("Using seed: {}", seed);
    }
    debug!("Running {} {:?}", self.config.sd_binary.display(), args);

    let output = Command::new(&self.config.sd_binary).args(&args).output()?;
    if !output.status.success() {
      let stderr = String::from_utf8_lossy(&output.stderr);
      let tail_start = stderr.len().saturating_sub(STDERR_TAIL);
      let tail_start = (tail_start..stderr.len())
        .find(|i| stderr.is_char_boundary(*i))
        .unwrap_or(stderr.len());
      return Err(BackendError::Process {
        status: output.status.to_string(),
        stderr: stderr[tail_start..].trim().to_string(),
      });
    }

    let png = match fs::read(&scratch.0) {
      Ok(bytes) => bytes,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(BackendError::NoOutput),
      Err(e) => return Err(e.into()),
    };
    if png.is_empty() {
      return Err(BackendError::NoOutput);
    }
    info!("Image generated successfully ({} bytes)", png.len());
    Ok(GeneratedImage::new(png))
  }
}
