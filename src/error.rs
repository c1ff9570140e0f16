use std::convert::Infallible;

use serde::Serialize;
use thiserror::Error;
use tracing::error;
use warp::http::StatusCode;
use warp::{Rejection, Reply};

use crate::models::{TaskId, TaskStatus};

/// Errors surfaced to callers of the generation service.
#[derive(Debug, Error)]
pub enum ServiceError {
  #[error("{0}")]
  Validation(String),

  #[error("queue is full ({capacity} tasks pending)")]
  QueueFull { capacity: usize },

  #[error("image generation failed for task {task_id}: {reason}")]
  GenerationFailed { task_id: TaskId, reason: String },

  /// The task keeps running after this is returned.
  #[error("task {task_id} did not finish within {waited_secs:.1}s")]
  Timeout { task_id: TaskId, waited_secs: f64 },

  #[error("task {0} not found")]
  NotFound(TaskId),
}

impl ServiceError {
  pub fn status_code(&self) -> StatusCode {
    match self {
      ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
      ServiceError::QueueFull { .. } => StatusCode::SERVICE_UNAVAILABLE,
      ServiceError::GenerationFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
      ServiceError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
      ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
    }
  }

  pub fn code(&self) -> &'static str {
    match self {
      ServiceError::Validation(_) => "VALIDATION_ERROR",
      ServiceError::QueueFull { .. } => "QUEUE_FULL",
      ServiceError::GenerationFailed { .. } => "GENERATION_FAILED",
      ServiceError::Timeout { .. } => "TIMEOUT",
      ServiceError::NotFound(_) => "NOT_FOUND",
    }
  }

  fn task_id(&self) -> Option<TaskId> {
    match self {
      ServiceError::GenerationFailed { task_id, .. } | ServiceError::Timeout { task_id, .. } => Some(*task_id),
      ServiceError::NotFound(task_id) => Some(*task_id),
      _ => None,
    }
  }

  fn task_status(&self) -> Option<TaskStatus> {
    match self {
      ServiceError::GenerationFailed { .. } => Some(TaskStatus::Error),
      ServiceError::Timeout { .. } => Some(TaskStatus::TimedOut),
      _ => None,
    }
  }
}

impl warp::reject::Reject for ServiceError {}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
  pub error: String,
  pub code: &'static str,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub task_id: Option<TaskId>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub status: Option<TaskStatus>,
}

fn error_reply(status: StatusCode, body: ErrorBody) -> warp::reply::WithStatus<warp::reply::Json> {
  warp::reply::with_status(warp::reply::json(&body), status)
}

/// Turns every rejection into a JSON error body.
pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
  if let Some(service_err) = err.find::<ServiceError>() {
    let body = ErrorBody {
      error: service_err.to_string(),
      code: service_err.code(),
      task_id: service_err.task_id(),
      status: service_err.task_status(),
    };
    return Ok(error_reply(service_err.status_code(), body));
  }

  let (status, code, message) = if err.is_not_found() {
    (StatusCode::NOT_FOUND, "NOT_FOUND", "Resource not found".to_string())
  } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", e.to_string())
  } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", e.to_string())
  } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
    (StatusCode::METHOD_NOT_ALLOWED, "METHOD_NOT_ALLOWED", "Method not allowed".to_string())
  } else {
    error!("Unhandled rejection: {:?}", err);
    (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", "An internal error occurred".to_string())
  };

  Ok(error_reply(status, ErrorBody { error: message, code, task_id: None, status: None }))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn timeout_and_failure_are_distinct() {
    let timeout = ServiceError::Timeout { task_id: TaskId(3), waited_secs: 1.0 };
    let failed = ServiceError::GenerationFailed { task_id: TaskId(3), reason: "oom".into() };
    assert_ne!(timeout.status_code(), failed.status_code());
    assert_ne!(timeout.code(), failed.code());
    assert_eq!(timeout.task_status(), Some(TaskStatus::TimedOut));
    assert_eq!(failed.task_status(), Some(TaskStatus::Error));
  }
}
