use std::convert::Infallible;

use warp::Filter;

use crate::error::handle_rejection;
use crate::service::GenerationService;

pub mod tasks;
pub mod sse;

pub fn routes(
  service: GenerationService,
) -> impl Filter<Extract = impl warp::Reply, Error = Infallible> + Clone {
  tasks::health_route(service.clone())
    .or(tasks::generate_route(service.clone()))
    .or(tasks::task_route(service.clone()))
    .or(sse::sse_route(service))
    .recover(handle_rejection)
}
