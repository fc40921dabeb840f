mod routes;
mod server;
#[cfg(test)]
mod testing;

pub mod app;
pub mod camera;
pub mod classifier;
pub mod config;
pub mod connection;
pub mod domain;
pub mod model;
pub mod orchestrator;
pub mod store;
pub mod telemetry;

pub use app::start_app;
