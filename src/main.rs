use std::sync::Arc;

use anyhow::Result;
use imagegen_queue::{
  backend::SdCliBackend, config::Config, routes::routes, service::GenerationService, task_queue::TaskQueue,
  worker::Worker,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();
  let config = Config::from_env()?;

  let queue = Arc::new(TaskQueue::new(&config.queue));
  let backend = Arc::new(SdCliBackend::new(config.backend.clone()));
  let worker = Worker::new(queue.clone(), backend, config.queue.idle_delay)
    .with_lora_dir(config.lora_dir.clone())
    .with_prompt_prefixes(config.pos_prompt_prefix.clone(), config.neg_prompt_prefix.clone());
  tokio::spawn(worker.run());

  let api = routes(GenerationService::new(queue, &config.queue));

  info!("Listening on port {}", config.server_port);
  warp::serve(api)
    .run(([0, 0, 0, 0], config.server_port))
    .await;
  Ok(())
}
