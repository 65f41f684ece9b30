pub mod backoff;
pub mod bootstrap;
pub mod bus;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod workers;

pub use bootstrap::{Engine, Factories};
pub use bus::BusClient;
pub use config::UnsConfig;
pub use error::EngineError;
