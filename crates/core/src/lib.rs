// Core types and functionality for the jobchain saga engine

pub mod config;
pub mod error;
pub mod events;
pub mod handler;
pub mod manager;
pub mod queue;
pub mod saga;
pub mod storage;
pub mod types;

pub use config::{EngineConfig, SubmitOptions};
pub use error::{JobError, Result};
pub use handler::{Handler, HandlerRegistry};
pub use manager::{JobLane, JobManager, SubmittedJob};
pub use types::*;
