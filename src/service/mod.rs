//! Service supervision module
//!
//! Composed services run as supervised host processes with their resolved
//! environment injected at spawn time and output captured to log files.

pub mod config;
pub mod process;
pub mod supervisor;

pub use config::{PortMapping, ProcessConfig, Protocol, ServiceStatus};
pub use process::ServiceProcess;
pub use supervisor::ServiceSupervisor;
