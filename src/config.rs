use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};

/// Timing and admission knobs shared by the queue, worker and request handler.
#[derive(Debug, Clone)]
pub struct QueueConfig {
  pub max_wait: Duration,
  pub poll_interval: Duration,
  pub idle_delay: Duration,
  /// `None` accepts any number of pending tasks.
  pub max_pending: Option<usize>,
  /// `None` keeps results for the lifetime of the process.
  pub result_ttl: Option<Duration>,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      max_wait: Duration::from_secs(120),
      poll_interval: Duration::from_secs(5),
      idle_delay: Duration::from_secs(2),
      max_pending: None,
      result_ttl: None,
    }
  }
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
  pub sd_binary: PathBuf,
  pub base_model_path: PathBuf,
  pub models_dir: PathBuf,
  pub vae_path: Option<PathBuf>,
  pub scratch_dir: PathBuf,
  pub extra_args: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
  pub server_port: u16,
  pub lora_dir: PathBuf,
  pub pos_prompt_prefix: String,
  pub neg_prompt_prefix: String,
  pub queue: QueueConfig,
  pub backend: BackendConfig,
}

impl Config {
  /// Reads the configuration from the environment, loading `.env` first if present.
  pub fn from_env() -> Result<Self> {
    let _ = dotenvy::dotenv();

    let queue = QueueConfig {
      max_wait: positive_secs("MAX_WAIT_SECS", parse_var("MAX_WAIT_SECS", 120)?)?,
      poll_interval: positive_secs("POLL_INTERVAL_SECS", parse_var("POLL_INTERVAL_SECS", 5)?)?,
      idle_delay: positive_secs("IDLE_DELAY_SECS", parse_var("IDLE_DELAY_SECS", 2)?)?,
      max_pending: Some(parse_var::<usize>("MAX_PENDING_TASKS", 0)?).filter(|n| *n > 0),
      result_ttl: Some(parse_var::<u64>("RESULT_TTL_SECS", 0)?)
        .filter(|n| *n > 0)
        .map(Duration::from_secs),
    };

    let backend = BackendConfig {
      sd_binary: path_var("SD_BINARY", "sd"),
      base_model_path: path_var("BASE_MODEL_PATH", "models/checkpoints/base.safetensors"),
      models_dir: path_var("MODELS_DIR", "models/checkpoints"),
      vae_path: env::var("VAE_PATH").ok().filter(|v| !v.is_empty()).map(PathBuf::from),
      scratch_dir: env::var("SCRATCH_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| env::temp_dir().join("imagegen")),
      extra_args: env::var("SD_EXTRA_ARGS")
        .unwrap_or_default()
        .split_whitespace()
        .map(str::to_string)
        .collect(),
    };

    Ok(Self {
      server_port: parse_var("SERVER_PORT", 8000)?,
      lora_dir: path_var("LORA_DIR", "models/lora"),
      pos_prompt_prefix: env::var("POS_PROMPT_PREFIX").unwrap_or_default(),
      neg_prompt_prefix: env::var("NEG_PROMPT_PREFIX").unwrap_or_default(),
      queue,
      backend,
    })
  }
}

fn path_var(name: &str, default: &str) -> PathBuf {
  env::var(name).map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(default))
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
  T: FromStr,
  T::Err: std::error::Error + Send + Sync + 'static,
{
  match env::var(name) {
    Ok(raw) if !raw.trim().is_empty() => raw
      .trim()
      .parse()
      .with_context(|| format!("{} has an invalid value: {:?}", name, raw)),
    _ => Ok(default),
  }
}

/// Interval variables must be non-zero.
fn positive_secs(name: &str, secs: u64) -> Result<Duration> {
  if secs == 0 {
    bail!("{} must be greater than zero", name);
  }
  Ok(Duration::from_secs(secs))
}
