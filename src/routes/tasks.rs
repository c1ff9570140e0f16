use std::convert::Infallible;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};
use warp::Filter;

use crate::error::ServiceError;
use crate::models::{GenerationParams, LoraRef, TaskId, TaskOutcome, TaskSnapshot};
use crate::service::GenerationService;

const STEPS_RANGE: std::ops::RangeInclusive<u32> = 1..=100;
const GUIDANCE_RANGE: std::ops::RangeInclusive<f32> = 1.0..=20.0;
const DIMENSION_RANGE: std::ops::RangeInclusive<u32> = 64..=4096;
const LORA_SCALE_RANGE: std::ops::RangeInclusive<f32> = -10.0..=10.0;

static SAFE_NAME: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"^[\w\s./\\:()\[\]\-]+$").expect("valid name pattern"));

fn default_steps() -> u32 {
  30
}

fn default_guidance() -> f32 {
  7.0
}

fn default_dimension() -> u32 {
  1024
}

fn default_lora_scale() -> f32 {
  1.0
}

#[derive(Debug, Deserialize)]
pub struct LoraInput {
  pub name: String,
  #[serde(default = "default_lora_scale")]
  pub scale: f32,
}

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
  pub pos_prompt: String,
  #[serde(default)]
  pub neg_prompt: Option<String>,
  #[serde(default = "default_steps")]
  pub num_inference_steps: u32,
  #[serde(default = "default_guidance")]
  pub guidance_scale: f32,
  #[serde(default = "default_dimension")]
  pub height: u32,
  #[serde(default = "default_dimension")]
  pub width: u32,
  #[serde(default)]
  pub base_model: Option<String>,
  #[serde(default)]
  pub loras: Option<Vec<LoraInput>>,
  #[serde(default)]
  pub seed: Option<u64>,
}

#[derive(Serialize)]
pub struct GenerateResponse {
  pub image_base64: String,
}

#[derive(Serialize)]
pub struct TaskResponse {
  #[serde(flatten)]
  pub snapshot: TaskSnapshot,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub image_base64: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

fn sanitize_input(input: &str) -> bool {
  SAFE_NAME.is_match(input) && !input.contains("..")
}

fn validate_request(request: &GenerateRequest) -> Result<(), String> {
  if request.pos_prompt.trim().is_empty() {
    return Err("'pos_prompt' must not be empty".into());
  }
  if !STEPS_RANGE.contains(&request.num_inference_steps) {
    return Err(format!(
      "'num_inference_steps' must be between {} and {}",
      STEPS_RANGE.start(),
      STEPS_RANGE.end()
    ));
  }
  if !GUIDANCE_RANGE.contains(&request.guidance_scale) {
    return Err(format!(
      "'guidance_scale' must be between {} and {}",
      GUIDANCE_RANGE.start(),
      GUIDANCE_RANGE.end()
    ));
  }
  for (field, value) in [("height", request.height), ("width", request.width)] {
    if !DIMENSION_RANGE.contains(&value) || value % 8 != 0 {
      return Err(format!(
        "'{}' must be a multiple of 8 between {} and {}",
        field,
        DIMENSION_RANGE.start(),
        DIMENSION_RANGE.end()
      ));
    }
  }
  if let Some(model) = &request.base_model {
    if !model.is_empty() && !sanitize_input(model) {
      return Err("Invalid or unsafe 'base_model'".into());
    }
  }
  for lora in request.loras.iter().flatten() {
    if !sanitize_input(&lora.name) {
      return Err(format!("Invalid or unsafe LoRA name '{}'", lora.name));
    }
    if !LORA_SCALE_RANGE.contains(&lora.scale) {
      return Err(format!("LoRA '{}' has an out-of-range scale", lora.name));
    }
  }
  Ok(())
}

impl From<GenerateRequest> for GenerationParams {
  fn from(request: GenerateRequest) -> Self {
    GenerationParams {
      pos_prompt: request.pos_prompt,
      neg_prompt: request.neg_prompt.unwrap_or_default(),
      num_inference_steps: request.num_inference_steps,
      guidance_scale: request.guidance_scale,
      height: request.height,
      width: request.width,
      base_model: request.base_model.filter(|m| !m.is_empty()),
      loras: request
        .loras
        .unwrap_or_default()
        .into_iter()
        .map(|l| LoraRef { name: l.name, scale: l.scale })
        .collect(),
      seed: request.seed,
    }
  }
}

fn with_service(service: GenerationService) -> impl Filter<Extract = (GenerationService,), Error = Infallible> + Clone {
  warp::any().map(move || service.clone())
}

pub fn health_route(service: GenerationService) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path::end()
    .and(warp::get())
    .and(with_service(service))
    .and_then(handle_health)
}

pub fn generate_route(service: GenerationService) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("generate")
    .and(warp::path::end())
    .and(warp::post())
    .and(warp::body::json())
    .and(with_service(service))
    .and_then(handle_generate)
}

pub fn task_route(service: GenerationService) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("tasks" / u64)
    .and(warp::get())
    .and(with_service(service))
    .and_then(handle_get_task)
}

async fn handle_health(service: GenerationService) -> Result<impl warp::Reply, warp::Rejection> {
  let queue = service.queue();
  Ok(warp::reply::json(&json!({
    "status": "ok",
    "pending": queue.pending_len().await,
    "busy": queue.is_busy().await,
  })))
}

async fn handle_generate(request: GenerateRequest, service: GenerationService) -> Result<impl warp::Reply, warp::Rejection> {
  if let Err(e) = validate_request(&request) {
    error!("Request validation failed: {}", e);
    return Err(warp::reject::custom(ServiceError::Validation(e)));
  }

  let image = service.generate(request.into()).await.map_err(|e| {
    error!("Generate request failed: {}", e);
    warp::reject::custom(e)
  })?;

  info!("Returning generated image ({} bytes)", image.png.len());
  Ok(warp::reply::json(&GenerateResponse { image_base64: image.to_base64() }))
}

async fn handle_get_task(task_id: u64, service: GenerationService) -> Result<impl warp::Reply, warp::Rejection> {
  let task_id = TaskId(task_id);
  let (snapshot, outcome) = service
    .queue()
    .snapshot_with_outcome(task_id)
    .await
    .ok_or_else(|| warp::reject::custom(ServiceError::NotFound(task_id)))?;

  let (image_base64, error) = match outcome {
    Some(TaskOutcome::Image(image)) => (Some(image.to_base64()), None),
    Some(TaskOutcome::Failed(reason)) => (None, Some(reason)),
    None => (None, None),
  };

  Ok(warp::reply::json(&TaskResponse { snapshot, image_base64, error }))
}
