#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use imagegen_queue::backend::{BackendError, GenerationBackend, GenerationRequest};
use imagegen_queue::config::QueueConfig;
use imagegen_queue::models::{GeneratedImage, GenerationParams, LoraRef};
use imagegen_queue::service::GenerationService;
use imagegen_queue::task_queue::TaskQueue;
use imagegen_queue::worker::Worker;

/// One backend call as observed by [`SlowBackend`].
#[derive(Debug, Clone)]
pub struct Call {
  pub prompt: String,
  pub started: Instant,
  pub ended: Instant,
}

/// Sleeps for a fixed latency per call, records call intervals and fails on
/// prompts it is told to fail on.
pub struct SlowBackend {
  latency: Duration,
  fail_on: Vec<String>,
  panic_on: Vec<String>,
  in_flight: AtomicUsize,
  pub max_in_flight: AtomicUsize,
  pub calls: Mutex<Vec<Call>>,
}

impl SlowBackend {
  pub fn new(latency: Duration) -> Self {
    Self {
      latency,
      fail_on: Vec::new(),
      panic_on: Vec::new(),
      in_flight: AtomicUsize::new(0),
      max_in_flight: AtomicUsize::new(0),
      calls: Mutex::new(Vec::new()),
    }
  }

  pub fn failing_on(mut self, prompt: &str) -> Self {
    self.fail_on.push(prompt.to_string());
    self
  }

  pub fn panicking_on(mut self, prompt: &str) -> Self {
    self.panic_on.push(prompt.to_string());
    self
  }

  pub fn calls(&self) -> Vec<Call> {
    self.calls.lock().unwrap().clone()
  }
}

impl GenerationBackend for SlowBackend {
  fn generate(&self, request: &GenerationRequest) -> Result<GeneratedImage, BackendError> {
    let now_running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    self.max_in_flight.fetch_max(now_running, Ordering::SeqCst);
    let started = Instant::now();
    std::thread::sleep(self.latency);
    let ended = Instant::now();
    self.calls.lock().unwrap().push(Call { prompt: request.pos_prompt.clone(), started, ended });
    self.in_flight.fetch_sub(1, Ordering::SeqCst);

    if self.panic_on.contains(&request.pos_prompt) {
      panic!("pipeline fault on '{}'", request.pos_prompt);
    }
    if self.fail_on.contains(&request.pos_prompt) {
      return Err(BackendError::NoOutput);
    }
    Ok(GeneratedImage::new(request.pos_prompt.as_bytes().to_vec()))
  }
}

pub fn params(prompt: &str, steps: u32) -> GenerationParams {
  GenerationParams {
    pos_prompt: prompt.into(),
    neg_prompt: String::new(),
    num_inference_steps: steps,
    guidance_scale: 7.0,
    height: 1024,
    width: 1024,
    base_model: None,
    loras: Vec::<LoraRef>::new(),
    seed: None,
  }
}

pub fn queue_config(max_wait: Duration, poll_interval: Duration) -> QueueConfig {
  QueueConfig {
    max_wait,
    poll_interval,
    idle_delay: Duration::from_millis(5),
    ..QueueConfig::default()
  }
}

/// Queue, service and a running worker around `backend`.
pub fn start(backend: Arc<SlowBackend>, config: &QueueConfig) -> (GenerationService, tokio::task::JoinHandle<()>) {
  let queue = Arc::new(TaskQueue::new(config));
  let worker = Worker::new(queue.clone(), backend, config.idle_delay);
  let handle = tokio::spawn(worker.run());
  (GenerationService::new(queue, config), handle)
}
