//! Image build descriptions
//!
//! This module parses build files and resolves them into image plans:
//! the effective configuration a built image would carry.

pub mod buildfile;
pub mod spec;

pub use buildfile::{BuildInstruction, ParsedBuildFile, DEFAULT_BUILD_FILE};
pub use spec::{BuildContext, ImagePlan};
