use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl TaskId {
  /// Allocates the next id. Ids are unique for the lifetime of the process.
  pub fn next() -> Self {
    TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
  }
}

impl fmt::Display for TaskId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
  Pending,
  Running,
  Error,
  Finished,
  TimedOut,
}

impl TaskStatus {
  pub fn is_terminal(self) -> bool {
    matches!(self, TaskStatus::Error | TaskStatus::Finished)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraRef {
  pub name: String,
  pub scale: f32,
}

impl LoraRef {
  /// Scale used when a reference is built without one.
  pub const DEFAULT_SCALE: f32 = 0.8;

  pub fn named(name: impl Into<String>) -> Self {
    Self { name: name.into(), scale: Self::DEFAULT_SCALE }
  }

  /// Joins the name onto `lora_dir` unless the name is already absolute.
  pub fn resolve(&self, lora_dir: &Path) -> ResolvedLora {
    let name_path = Path::new(&self.name);
    let path = if name_path.is_absolute() {
      name_path.to_path_buf()
    } else {
      lora_dir.join(name_path)
    };
    ResolvedLora { name: self.name.clone(), path, scale: self.scale }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedLora {
  pub name: String,
  pub path: PathBuf,
  pub scale: f32,
}

impl ResolvedLora {
  /// Adapter name as the generator knows it: the file stem.
  pub fn adapter_name(&self) -> String {
    self.path
      .file_stem()
      .map(|s| s.to_string_lossy().into_owned())
      .unwrap_or_else(|| self.name.clone())
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
  pub pos_prompt: String,
  pub neg_prompt: String,
  pub num_inference_steps: u32,
  pub guidance_scale: f32,
  pub height: u32,
  pub width: u32,
  pub base_model: Option<String>,
  pub loras: Vec<LoraRef>,
  pub seed: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Task {
  pub id: TaskId,
  pub params: GenerationParams,
  pub status: TaskStatus,
  pub created_at: DateTime<Utc>,
  pub started_at: Option<DateTime<Utc>>,
  pub ended_at: Option<DateTime<Utc>>,
}

impl Task {
  pub fn new(params: GenerationParams) -> Self {
    Self {
      id: TaskId::next(),
      params,
      status: TaskStatus::Pending,
      created_at: Utc::now(),
      started_at: None,
      ended_at: None,
    }
  }
}

/// PNG-encoded image bytes produced by a backend.
#[derive(Clone, PartialEq, Eq)]
pub struct GeneratedImage {
  pub png: Vec<u8>,
}

impl GeneratedImage {
  pub fn new(png: Vec<u8>) -> Self {
    Self { png }
  }

  pub fn is_empty(&self) -> bool {
    self.png.is_empty()
  }

  pub fn to_base64(&self) -> String {
    base64::engine::general_purpose::STANDARD.encode(&self.png)
  }
}

impl fmt::Debug for GeneratedImage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("GeneratedImage").field("bytes", &self.png.len()).finish()
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
  Image(GeneratedImage),
  Failed(String),
}

impl TaskOutcome {
  pub fn status(&self) -> TaskStatus {
    match self {
      TaskOutcome::Image(_) => TaskStatus::Finished,
      TaskOutcome::Failed(_) => TaskStatus::Error,
    }
  }
}

/// What the result store keeps once a task leaves the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedTask {
  pub task_id: TaskId,
  pub status: TaskStatus,
  pub created_at: DateTime<Utc>,
  pub started_at: Option<DateTime<Utc>>,
  pub ended_at: DateTime<Utc>,
  pub outcome: TaskOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSnapshot {
  pub task_id: TaskId,
  pub status: TaskStatus,
  pub created_at: DateTime<Utc>,
  pub started_at: Option<DateTime<Utc>>,
  pub ended_at: Option<DateTime<Utc>>,
  /// 1-based position in the pending queue, only while pending.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub queue_position: Option<usize>,
}
