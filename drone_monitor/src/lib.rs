mod routes;
mod server;

pub mod app;
pub mod classifier;
pub mod config;
pub mod coordinator;
pub mod detection;
pub mod events;
pub mod fallback;
pub mod frame;
pub mod frame_source;
pub mod handoff;
pub mod identity;
pub mod scheduler;
pub mod settings;
pub mod telemetry;

pub use app::start_app;
