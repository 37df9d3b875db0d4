//! Stack composition
//!
//! Parsing, validation and orchestration of multi-service stack files.

pub mod config;
pub mod env;
pub mod orchestrator;
pub mod parser;

pub use config::{ServiceConfig, StackConfig};
pub use orchestrator::StackOrchestrator;
pub use parser::StackParser;
