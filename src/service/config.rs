//! Service instance configuration

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

/// Service instance status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// Instance is created but not running
    Created,
    /// Instance process is running
    Running,
    /// Instance was stopped
    Stopped,
    /// Instance process exited on its own
    Exited,
    /// Instance is in an error state
    Dead,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceStatus::Created => write!(f, "created"),
            ServiceStatus::Running => write!(f, "running"),
            ServiceStatus::Stopped => write!(f, "stopped"),
            ServiceStatus::Exited => write!(f, "exited"),
            ServiceStatus::Dead => write!(f, "dead"),
        }
    }
}

/// Network protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// Parse from a stack-file protocol string
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("udp") {
            Protocol::Udp
        } else {
            Protocol::Tcp
        }
    }
}

/// Port mapping declared for a service instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMapping {
    /// Host IP, when pinned
    pub host_ip: Option<String>,
    /// Published host port; absent when the port is not published
    pub host_port: Option<u16>,
    /// Port the service binds inside its own view
    pub container_port: u16,
    /// Protocol
    pub protocol: Protocol,
}

/// Configuration of one runnable service instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Unique instance ID
    pub id: String,
    /// Instance name
    pub name: String,
    /// Image the instance was resolved from, when any
    pub image: Option<String>,
    /// Command argv
    pub command: Vec<String>,
    /// Resolved environment variables
    pub env: HashMap<String, String>,
    /// Working directory
    pub working_dir: Option<PathBuf>,
    /// Port mappings
    pub ports: Vec<PortMapping>,
    /// Labels
    pub labels: HashMap<String, String>,
    /// Current status
    pub status: ServiceStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Start time
    pub started_at: Option<DateTime<Utc>>,
    /// Stop time
    pub finished_at: Option<DateTime<Utc>>,
    /// Exit code
    pub exit_code: Option<i32>,
    /// Process ID
    pub pid: Option<u32>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4().to_string().replace("-", "")[..12].to_string(),
            name: String::new(),
            image: None,
            command: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            ports: Vec::new(),
            labels: HashMap::new(),
            status: ServiceStatus::Created,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            exit_code: None,
            pid: None,
        }
    }
}

impl ProcessConfig {
    /// Create a new instance configuration
    pub fn new(name: &str, command: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            command,
            ..Self::default()
        }
    }

    /// Add an environment variable
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    /// Set the working directory
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add a published port
    pub fn port(mut self, host_port: u16, container_port: u16) -> Self {
        self.ports.push(PortMapping {
            host_ip: None,
            host_port: Some(host_port),
            container_port,
            protocol: Protocol::Tcp,
        });
        self
    }

    /// Add a label
    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_short_and_unique() {
        let first = ProcessConfig::new("web-1", vec!["true".to_string()]);
        let second = ProcessConfig::new("web-2", vec!["true".to_string()]);

        assert_eq!(first.id.len(), 12);
        assert_ne!(first.id, second.id);
        assert_eq!(first.status, ServiceStatus::Created);
    }

    #[test]
    fn test_builder_methods() {
        let config = ProcessConfig::new("db-1", vec!["postgres".to_string()])
            .env("POSTGRES_DB", "app")
            .port(5432, 5432)
            .label("stack.service", "db");

        assert_eq!(config.env["POSTGRES_DB"], "app");
        assert_eq!(config.ports[0].host_port, Some(5432));
        assert_eq!(config.labels["stack.service"], "db");
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ServiceStatus::Running.to_string(), "running");
        assert_eq!(ServiceStatus::Exited.to_string(), "exited");
    }
}
