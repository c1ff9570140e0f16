use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{info, warn};

use crate::config::QueueConfig;
use crate::error::ServiceError;
use crate::models::{GeneratedImage, GenerationParams, Task, TaskId, TaskOutcome};
use crate::task_queue::TaskQueue;

/// Request-side half of the queue: submit a task, then wait for its result.
#[derive(Clone)]
pub struct GenerationService {
  queue: Arc<TaskQueue>,
  max_wait: Duration,
  poll_interval: Duration,
}

impl GenerationService {
  pub fn new(queue: Arc<TaskQueue>, config: &QueueConfig) -> Self {
    Self { queue, max_wait: config.max_wait, poll_interval: config.poll_interval }
  }

  pub fn queue(&self) -> &Arc<TaskQueue> {
    &self.queue
  }

  pub async fn submit(&self, params: GenerationParams) -> Result<TaskId, ServiceError> {
    let task_id = self.queue.enqueue(Task::new(params)).await?;
    info!(%task_id, "Task submitted");
    Ok(task_id)
  }

  /// Enqueues the task and blocks until it has a result or `max_wait` passes.
  pub async fn generate(&self, params: GenerationParams) -> Result<GeneratedImage, ServiceError> {
    let started = Instant::now();
    let task_id = self.submit(params).await?;
    self.wait_for(task_id, started).await
  }

  /// Polls the result store every `poll_interval`, waking early whenever a
  /// result is recorded. Timing out leaves the task in the queue.
  pub async fn wait_for(&self, task_id: TaskId, started: Instant) -> Result<GeneratedImage, ServiceError> {
    let mut completions = self.queue.subscribe_completions();
    loop {
      completions.mark_unchanged();
      match self.queue.lookup_result(task_id).await {
        Some(TaskOutcome::Image(image)) => return Ok(image),
        Some(TaskOutcome::Failed(reason)) => return Err(ServiceError::GenerationFailed { task_id, reason }),
        None => {}
      }

      let elapsed = started.elapsed();
      if elapsed >= self.max_wait {
        warn!(%task_id, "Gave up waiting after {:?}", elapsed);
        return Err(ServiceError::Timeout { task_id, waited_secs: elapsed.as_secs_f64() });
      }

      let nap = self.poll_interval.min(self.max_wait - elapsed);
      tokio::select! {
        _ = sleep(nap) => {}
        _ = completions.changed() => {}
      }
    }
  }
}
