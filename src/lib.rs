pub mod config;
pub mod errors;
pub mod gate;
pub mod llm;
pub mod orchestrator;
pub mod phase;
pub mod pool;
pub mod progress;
pub mod server;
pub mod session;
pub mod telemetry;
pub mod ui;
