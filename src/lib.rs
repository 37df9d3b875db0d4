//! Convoy - a lightweight service-stack composer
//!
//! Convoy reads Compose-format stack files and Dockerfile-format build
//! files and turns them into something checkable and runnable:
//!
//! - Typed stack model with validation and variable interpolation
//! - Build-file parsing into an effective image plan
//! - Deployment audits (port coherence, environment surface, dependencies,
//!   secrets baked into build artifacts)
//! - Stack orchestration with readiness-gated start ordering
//! - Service supervision as host processes

pub mod audit;
pub mod compose;
pub mod error;
pub mod image;
pub mod probe;
pub mod service;

pub use error::{ConvoyError, Result};
