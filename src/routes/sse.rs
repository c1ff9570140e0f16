use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::watch;
use tokio::time::sleep;
use warp::Filter;

use crate::error::ServiceError;
use crate::models::{TaskId, TaskStatus};
use crate::service::GenerationService;
use crate::task_queue::TaskQueue;

const STATUS_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
struct SseQuery {
  task_id: u64,
}

struct StatusWatch {
  queue: Arc<TaskQueue>,
  task_id: TaskId,
  completions: watch::Receiver<u64>,
  last: Option<TaskStatus>,
  finished: bool,
}

fn with_service(service: GenerationService) -> impl Filter<Extract = (GenerationService,), Error = Infallible> + Clone {
  warp::any().map(move || service.clone())
}

pub fn sse_route(service: GenerationService) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("sse")
    .and(warp::path::end())
    .and(warp::get())
    .and(warp::query::<SseQuery>())
    .and(with_service(service))
    .and_then(handle_sse)
}

/// Emits a `status` event every time the task changes state and closes the
/// stream once the task has finished or failed.
async fn handle_sse(query: SseQuery, service: GenerationService) -> Result<impl warp::Reply, warp::Rejection> {
  let task_id = TaskId(query.task_id);
  let queue = service.queue().clone();
  if queue.snapshot(task_id).await.is_none() {
    return Err(warp::reject::custom(ServiceError::NotFound(task_id)));
  }

  let state = StatusWatch {
    completions: queue.subscribe_completions(),
    queue,
    task_id,
    last: None,
    finished: false,
  };

  let stream = futures::stream::unfold(state, |mut w| async move {
    if w.finished {
      return None;
    }
    loop {
      w.completions.mark_unchanged();
      // a purged or unknown task ends the stream
      let snapshot = w.queue.snapshot(w.task_id).await?;
      if w.last != Some(snapshot.status) {
        w.last = Some(snapshot.status);
        w.finished = snapshot.status.is_terminal();
        let event = warp::sse::Event::default().event("status").json_data(&snapshot);
        return Some((event, w));
      }
      tokio::select! {
        _ = sleep(STATUS_TICK) => {}
        _ = w.completions.changed() => {}
      }
    }
  });

  Ok(warp::sse::reply(warp::sse::keep_alive().stream(stream)))
}
