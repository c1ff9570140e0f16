mod common;

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use common::{SlowBackend, params, queue_config, start};
use imagegen_queue::models::{TaskId, TaskOutcome};
use imagegen_queue::routes::routes;
use imagegen_queue::service::GenerationService;
use imagegen_queue::task_queue::TaskQueue;
use serde_json::{Value, json};
use tokio::time::Instant;
use warp::http::StatusCode;

fn body_json(body: &[u8]) -> Value {
  serde_json::from_slice(body).expect("json body")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn generate_returns_base64_png() {
  let backend = Arc::new(SlowBackend::new(Duration::from_millis(10)));
  let config = queue_config(Duration::from_secs(5), Duration::from_millis(10));
  let (service, worker) = start(backend.clone(), &config);
  let api = routes(service);

  let res = warp::test::request()
    .method("POST")
    .path("/generate")
    .json(&json!({ "pos_prompt": "cat", "num_inference_steps": 20 }))
    .reply(&api)
    .await;

  assert_eq!(res.status(), StatusCode::OK);
  let body = body_json(res.body());
  let decoded = base64::engine::general_purpose::STANDARD
    .decode(body["image_base64"].as_str().unwrap())
    .unwrap();
  assert_eq!(decoded, b"cat".to_vec());
  worker.abort();
}

#[tokio::test]
async fn invalid_request_never_reaches_the_queue() {
  let backend = Arc::new(SlowBackend::new(Duration::from_millis(10)));
  let config = queue_config(Duration::from_secs(5), Duration::from_millis(10));
  let (service, worker) = start(backend.clone(), &config);
  let queue = service.queue().clone();
  let api = routes(service);

  let res = warp::test::request()
    .method("POST")
    .path("/generate")
    .json(&json!({ "pos_prompt": "cat", "guidance_scale": 42.0 }))
    .reply(&api)
    .await;

  assert_eq!(res.status(), StatusCode::BAD_REQUEST);
  assert_eq!(body_json(res.body())["code"], "VALIDATION_ERROR");
  assert_eq!(queue.pending_len().await, 0);
  assert!(backend.calls().is_empty());

  let res = warp::test::request()
    .method("POST")
    .path("/generate")
    .json(&json!({ "neg_prompt": "no positive prompt" }))
    .reply(&api)
    .await;
  assert_eq!(res.status(), StatusCode::BAD_REQUEST);
  worker.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timed_out_task_is_retrievable_later() {
  let backend = Arc::new(SlowBackend::new(Duration::from_millis(200)));
  let config = queue_config(Duration::from_millis(20), Duration::from_millis(5));
  let (service, worker) = start(backend, &config);
  let queue = service.queue().clone();
  let api = routes(service);

  let res = warp::test::request()
    .method("POST")
    .path("/generate")
    .json(&json!({ "pos_prompt": "slow" }))
    .reply(&api)
    .await;
  assert_eq!(res.status(), StatusCode::GATEWAY_TIMEOUT);
  let body = body_json(res.body());
  assert_eq!(body["code"], "TIMEOUT");
  assert_eq!(body["status"], "TIMED_OUT");
  let task_id = body["task_id"].as_u64().unwrap();

  // the task keeps running after the caller gave up; a more patient waiter still gets it
  let config_long = queue_config(Duration::from_secs(5), Duration::from_millis(5));
  let patient = GenerationService::new(queue.clone(), &config_long);
  let image = patient.wait_for(TaskId(task_id), Instant::now()).await.unwrap();
  assert_eq!(image.png, b"slow".to_vec());

  let res = warp::test::request().path(&format!("/tasks/{task_id}")).reply(&api).await;
  assert_eq!(res.status(), StatusCode::OK);
  let body = body_json(res.body());
  assert_eq!(body["status"], "FINISHED");
  assert!(body["image_base64"].is_string());
  worker.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn generation_failure_is_a_500_with_reason() {
  let backend = Arc::new(SlowBackend::new(Duration::from_millis(5)).failing_on("broken"));
  let config = queue_config(Duration::from_secs(5), Duration::from_millis(5));
  let (service, worker) = start(backend, &config);
  let api = routes(service);

  let res = warp::test::request()
    .method("POST")
    .path("/generate")
    .json(&json!({ "pos_prompt": "broken" }))
    .reply(&api)
    .await;
  assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
  let body = body_json(res.body());
  assert_eq!(body["code"], "GENERATION_FAILED");
  assert_eq!(body["status"], "ERROR");
  assert!(body["error"].as_str().unwrap().contains("no image"));
  worker.abort();
}

#[tokio::test]
async fn task_lookup_reports_queue_position_and_unknown_ids() {
  // no worker: tasks stay pending
  let config = queue_config(Duration::from_secs(5), Duration::from_millis(5));
  let queue = Arc::new(TaskQueue::new(&config));
  let service = GenerationService::new(queue, &config);
  let first = service.submit(params("a", 20)).await.unwrap();
  let second = service.submit(params("b", 20)).await.unwrap();
  let api = routes(service);

  let res = warp::test::request().path(&format!("/tasks/{second}")).reply(&api).await;
  let body = body_json(res.body());
  assert_eq!(body["status"], "PENDING");
  assert_eq!(body["queue_position"], 2);
  assert_eq!(body["task_id"], second.0);

  let res = warp::test::request().path(&format!("/tasks/{first}")).reply(&api).await;
  assert_eq!(body_json(res.body())["queue_position"], 1);

  let res = warp::test::request().path("/tasks/999999999").reply(&api).await;
  assert_eq!(res.status(), StatusCode::NOT_FOUND);

  let res = warp::test::request().path("/").reply(&api).await;
  let body = body_json(res.body());
  assert_eq!(body["pending"], 2);
  assert_eq!(body["busy"], false);
}

#[tokio::test]
async fn sse_streams_terminal_status_and_closes() {
  let config = queue_config(Duration::from_secs(5), Duration::from_millis(5));
  let queue = Arc::new(TaskQueue::new(&config));
  let service = GenerationService::new(queue.clone(), &config);
  let task_id = service.submit(params("a", 20)).await.unwrap();
  queue.begin_next().await.unwrap();
  queue.record_result(task_id, TaskOutcome::Failed("vae missing".into())).await;
  let api = routes(service);

  let res = warp::test::request()
    .path(&format!("/sse?task_id={task_id}"))
    .reply(&api)
    .await;
  assert_eq!(res.status(), StatusCode::OK);
  let body = String::from_utf8_lossy(res.body()).into_owned();
  assert!(body.contains("event:status") || body.contains("event: status"), "body: {body}");
  assert!(body.contains("\"ERROR\""), "body: {body}");

  let res = warp::test::request().path("/sse?task_id=999999999").reply(&api).await;
  assert_eq!(res.status(), StatusCode::NOT_FOUND);
}
