use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, watch};
use tracing::{debug, warn};

use crate::config::QueueConfig;
use crate::error::ServiceError;
use crate::models::{CompletedTask, Task, TaskId, TaskOutcome, TaskSnapshot, TaskStatus};

#[derive(Default)]
struct QueueState {
  pending: VecDeque<Task>,
  /// The task the worker is running. `Some` is the busy flag.
  in_flight: Option<Task>,
  results: HashMap<TaskId, CompletedTask>,
}

/// FIFO of pending tasks plus the result store. Every piece of shared state
/// sits behind the one lock.
pub struct TaskQueue {
  state: Mutex<QueueState>,
  completions: watch::Sender<u64>,
  max_pending: Option<usize>,
  result_ttl: Option<Duration>,
}

impl TaskQueue {
  pub fn new(config: &QueueConfig) -> Self {
    let (completions, _) = watch::channel(0);
    Self {
      state: Mutex::new(QueueState::default()),
      completions,
      max_pending: config.max_pending,
      result_ttl: config.result_ttl,
    }
  }

  pub async fn enqueue(&self, task: Task) -> Result<TaskId, ServiceError> {
    let mut state = self.state.lock().await;
    if let Some(capacity) = self.max_pending {
      if state.pending.len() >= capacity {
        return Err(ServiceError::QueueFull { capacity });
      }
    }
    let task_id = task.id;
    state.pending.push_back(task);
    debug!(%task_id, pending = state.pending.len(), "Task enqueued");
    Ok(task_id)
  }

  /// Pops the head of the queue without touching the busy flag.
  pub async fn dequeue_next(&self) -> Option<Task> {
    self.state.lock().await.pending.pop_front()
  }

  /// Admits the next task to the worker: nothing if a task is already in
  /// flight or the queue is empty, otherwise the head marked RUNNING.
  pub async fn begin_next(&self) -> Option<Task> {
    let mut state = self.state.lock().await;
    if state.in_flight.is_some() {
      return None;
    }
    let mut task = state.pending.pop_front()?;
    task.status = TaskStatus::Running;
    task.started_at = Some(Utc::now());
    state.in_flight = Some(task.clone());
    Some(task)
  }

  /// Stores the outcome for `task_id` and releases the worker slot if that
  /// task held it. A task still pending is taken off the queue so it never
  /// runs. Returns `false` if a result was already recorded.
  pub async fn record_result(&self, task_id: TaskId, outcome: TaskOutcome) -> bool {
    let mut state = self.state.lock().await;
    let in_flight = state.in_flight.take_if(|t| t.id == task_id);
    if state.results.contains_key(&task_id) {
      warn!(%task_id, "Result already recorded, ignoring second write");
      return false;
    }

    let now = Utc::now();
    let (created_at, started_at) = match in_flight {
      Some(task) => (task.created_at, task.started_at),
      None => match state.pending.iter().position(|t| t.id == task_id) {
        Some(idx) => {
          let task = state.pending.remove(idx);
          (task.map(|t| t.created_at).unwrap_or(now), None)
        }
        None => (now, None),
      },
    };
    let completed = CompletedTask {
      task_id,
      status: outcome.status(),
      created_at,
      started_at,
      ended_at: now,
      outcome,
    };
    state.results.insert(task_id, completed);
    drop(state);

    self.completions.send_modify(|n| *n += 1);
    true
  }

  pub async fn lookup_result(&self, task_id: TaskId) -> Option<TaskOutcome> {
    self.state.lock().await.results.get(&task_id).map(|c| c.outcome.clone())
  }

  pub async fn completed(&self, task_id: TaskId) -> Option<CompletedTask> {
    self.state.lock().await.results.get(&task_id).cloned()
  }

  /// Where a task currently is: pending (with its position), running or done.
  pub async fn snapshot(&self, task_id: TaskId) -> Option<TaskSnapshot> {
    snapshot_locked(&*self.state.lock().await, task_id)
  }

  /// The snapshot together with the stored outcome, read under one lock so
  /// the two always agree.
  pub async fn snapshot_with_outcome(&self, task_id: TaskId) -> Option<(TaskSnapshot, Option<TaskOutcome>)> {
    let state = self.state.lock().await;
    let snapshot = snapshot_locked(&state, task_id)?;
    let outcome = state.results.get(&task_id).map(|done| done.outcome.clone());
    Some((snapshot, outcome))
  }

  pub async fn pending_len(&self) -> usize {
    self.state.lock().await.pending.len()
  }

  pub async fn is_busy(&self) -> bool {
    self.state.lock().await.in_flight.is_some()
  }

  /// Drops results that ended more than the configured TTL before `now`.
  pub async fn purge_expired(&self, now: DateTime<Utc>) -> usize {
    let Some(ttl) = self.result_ttl.and_then(|ttl| chrono::Duration::from_std(ttl).ok()) else {
      return 0;
    };
    let mut state = self.state.lock().await;
    let before = state.results.len();
    state.results.retain(|_, done| now - done.ended_at <= ttl);
    before - state.results.len()
  }

  /// A receiver that changes every time a result is recorded.
  pub fn subscribe_completions(&self) -> watch::Receiver<u64> {
    self.completions.subscribe()
  }
}

fn snapshot_locked(state: &QueueState, task_id: TaskId) -> Option<TaskSnapshot> {
  if let Some(done) = state.results.get(&task_id) {
    return Some(TaskSnapshot {
      task_id,
      status: done.status,
      created_at: done.created_at,
      started_at: done.started_at,
      ended_at: Some(done.ended_at),
      queue_position: None,
    });
  }
  if let Some(task) = state.in_flight.as_ref().filter(|t| t.id == task_id) {
    return Some(snapshot_of(task, None));
  }
  state
    .pending
    .iter()
    .position(|t| t.id == task_id)
    .map(|idx| snapshot_of(&state.pending[idx], Some(idx + 1)))
}

fn snapshot_of(task: &Task, queue_position: Option<usize>) -> TaskSnapshot {
  TaskSnapshot {
    task_id: task.id,
    status: task.status,
    created_at: task.created_at,
    started_at: task.started_at,
    ended_at: task.ended_at,
    queue_position,
  }
}
