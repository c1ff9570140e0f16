pub mod backend;
pub mod config;
pub mod error;
pub mod models;
pub mod routes;
pub mod service;
pub mod task_queue;
pub mod worker;
