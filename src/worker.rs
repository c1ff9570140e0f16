use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::backend::{GenerationBackend, GenerationRequest};
use crate::models::{GenerationParams, Task, TaskId, TaskOutcome};
use crate::task_queue::TaskQueue;

/// The single consumer of the task queue.
pub struct Worker {
  queue: Arc<TaskQueue>,
  backend: Arc<dyn GenerationBackend>,
  idle_delay: Duration,
  lora_dir: PathBuf,
  pos_prompt_prefix: String,
  neg_prompt_prefix: String,
}

impl Worker {
  pub fn new(queue: Arc<TaskQueue>, backend: Arc<dyn GenerationBackend>, idle_delay: Duration) -> Self {
    Self {
      queue,
      backend,
      idle_delay,
      lora_dir: PathBuf::new(),
      pos_prompt_prefix: String::new(),
      neg_prompt_prefix: String::new(),
    }
  }

  pub fn with_lora_dir(mut self, lora_dir: impl Into<PathBuf>) -> Self {
    self.lora_dir = lora_dir.into();
    self
  }

  pub fn with_prompt_prefixes(mut self, pos: impl Into<String>, neg: impl Into<String>) -> Self {
    self.pos_prompt_prefix = pos.into();
    self.neg_prompt_prefix = neg.into();
    self
  }

  /// Runs forever. A failing task never stops the loop.
  pub async fn run(self) {
    info!("Worker started (idle delay {:?})", self.idle_delay);
    loop {
      if self.run_once().await.is_none() {
        sleep(self.idle_delay).await;
      }
    }
  }

  /// Processes the next task if the worker slot is free and something is
  /// queued. Returns the id of the task that was processed.
  pub async fn run_once(&self) -> Option<TaskId> {
    let task = self.queue.begin_next().await?;
    let task_id = task.id;
    let outcome = self.process(task).await;
    match &outcome {
      TaskOutcome::Image(image) => info!(%task_id, bytes = image.png.len(), "Task finished"),
      TaskOutcome::Failed(reason) => error!(%task_id, "Task failed: {}", reason),
    }
    self.queue.record_result(task_id, outcome).await;

    let purged = self.queue.purge_expired(Utc::now()).await;
    if purged > 0 {
      info!("Purged {} expired results", purged);
    }
    Some(task_id)
  }

  async fn process(&self, task: Task) -> TaskOutcome {
    info!(task_id = %task.id, "Processing task: '{}'", task.params.pos_prompt);
    let request = self.build_request(&task.params);
    let backend = self.backend.clone();

    match tokio::task::spawn_blocking(move || backend.generate(&request)).await {
      Ok(Ok(image)) if image.is_empty() => TaskOutcome::Failed("backend produced no image".into()),
      Ok(Ok(image)) => TaskOutcome::Image(image),
      Ok(Err(e)) => TaskOutcome::Failed(e.to_string()),
      Err(join_err) if join_err.is_panic() => {
        TaskOutcome::Failed(format!("backend panicked: {}", panic_message(join_err.into_panic())))
      }
      Err(join_err) => TaskOutcome::Failed(format!("backend call aborted: {}", join_err)),
    }
  }

  /// Applies prompt prefixes and resolves LoRAs, dropping any whose file is missing.
  pub fn build_request(&self, params: &GenerationParams) -> GenerationRequest {
    let loras = params
      .loras
      .iter()
      .map(|lora| lora.resolve(&self.lora_dir))
      .filter(|lora| {
        let exists = lora.path.exists();
        if !exists {
          warn!("LoRA not found at {}, skipping", lora.path.display());
        }
        exists
      })
      .collect();

    GenerationRequest {
      pos_prompt: format!("{}{}", self.pos_prompt_prefix, params.pos_prompt),
      neg_prompt: format!("{}{}", self.neg_prompt_prefix, params.neg_prompt),
      num_inference_steps: params.num_inference_steps,
      guidance_scale: params.guidance_scale,
      height: params.height,
      width: params.width,
      base_model: params.base_model.clone(),
      loras,
      seed: params.seed,
    }
  }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "<unknown>".to_string()
  }
}
