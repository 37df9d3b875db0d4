//! Stack file configuration types
//!
//! The model follows the Compose file format: most fields accept the two
//! YAML shapes the format allows (array or map, short or long syntax),
//! expressed as untagged enums.

use crate::error::{ConvoyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Stack file configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackConfig {
    /// Compose file version
    #[serde(default)]
    pub version: Option<String>,
    /// Project name
    #[serde(default)]
    pub name: Option<String>,
    /// Services
    #[serde(default)]
    pub services: HashMap<String, ServiceConfig>,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            version: Some("3.8".to_string()),
            name: None,
            services: HashMap::new(),
        }
    }
}

/// Service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Image name
    #[serde(default)]
    pub image: Option<String>,
    /// Build configuration
    #[serde(default)]
    pub build: Option<BuildConfig>,
    /// Command to run
    #[serde(default)]
    pub command: Option<CommandConfig>,
    /// Entrypoint
    #[serde(default)]
    pub entrypoint: Option<CommandConfig>,
    /// Environment variables
    #[serde(default)]
    pub environment: Option<EnvironmentConfig>,
    /// Ports exposed to linked services without publishing
    #[serde(default)]
    pub expose: Option<Vec<String>>,
    /// Port mappings
    #[serde(default)]
    pub ports: Option<Vec<PortConfig>>,
    /// Service dependencies
    #[serde(default)]
    pub depends_on: Option<DependsOnConfig>,
    /// Healthcheck configuration
    #[serde(default)]
    pub healthcheck: Option<HealthcheckConfig>,
    /// Deploy configuration
    #[serde(default)]
    pub deploy: Option<DeployConfig>,
    /// Restart policy
    #[serde(default)]
    pub restart: Option<String>,
    /// Working directory
    #[serde(default)]
    pub working_dir: Option<String>,
    /// User
    #[serde(default)]
    pub user: Option<String>,
    /// Labels
    #[serde(default)]
    pub labels: Option<HashMap<String, String>>,
}

impl ServiceConfig {
    /// Names of the services this service depends on
    pub fn dependency_names(&self) -> Vec<String> {
        match &self.depends_on {
            Some(DependsOnConfig::Array(arr)) => arr.clone(),
            Some(DependsOnConfig::Map(map)) => map.keys().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Start condition declared for a dependency, if the map form was used
    pub fn dependency_condition(&self, dep: &str) -> Option<StartCondition> {
        match &self.depends_on {
            Some(DependsOnConfig::Map(map)) => map.get(dep).map(|c| c.condition),
            _ => None,
        }
    }

    /// Desired replica count (defaults to 1)
    pub fn replicas(&self) -> u32 {
        self.deploy.as_ref().and_then(|d| d.replicas).unwrap_or(1)
    }

    /// Normalized environment entries in declaration order
    pub fn env_entries(&self) -> Vec<EnvEntry> {
        match &self.environment {
            Some(env) => env.entries(),
            None => Vec::new(),
        }
    }

    /// Published ports, parsed from either syntax
    pub fn published_ports(&self) -> Result<Vec<PublishedPort>> {
        self.ports
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .map(PortConfig::resolve)
            .collect()
    }
}

/// Build configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BuildConfig {
    /// Simple context path
    Simple(String),
    /// Full build configuration
    Full(BuildConfigFull),
}

impl BuildConfig {
    /// Build context path
    pub fn context(&self) -> Option<&str> {
        match self {
            BuildConfig::Simple(path) => Some(path),
            BuildConfig::Full(full) => full.context.as_deref(),
        }
    }

    /// Build file path relative to the context, if overridden
    pub fn dockerfile(&self) -> Option<&str> {
        match self {
            BuildConfig::Simple(_) => None,
            BuildConfig::Full(full) => full.dockerfile.as_deref(),
        }
    }

    /// Target stage, if any
    pub fn target(&self) -> Option<&str> {
        match self {
            BuildConfig::Simple(_) => None,
            BuildConfig::Full(full) => full.target.as_deref(),
        }
    }
}

/// Full build configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildConfigFull {
    /// Build context
    pub context: Option<String>,
    /// Build file path
    pub dockerfile: Option<String>,
    /// Build arguments
    #[serde(default)]
    pub args: Option<HashMap<String, String>>,
    /// Target stage
    pub target: Option<String>,
}

/// Command configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandConfig {
    /// Shell command string
    Shell(String),
    /// Exec form array
    Exec(Vec<String>),
}

impl CommandConfig {
    /// Argv form, wrapping shell strings in `sh -c`
    pub fn to_argv(&self) -> Vec<String> {
        match self {
            CommandConfig::Shell(s) => {
                vec!["/bin/sh".to_string(), "-c".to_string(), s.clone()]
            }
            CommandConfig::Exec(arr) => arr.clone(),
        }
    }
}

/// One normalized environment entry
///
/// A `None` value marks a passthrough variable: its value is supplied by
/// the host environment at service-start time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvEntry {
    pub key: String,
    pub value: Option<String>,
}

/// Environment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvironmentConfig {
    /// Array of KEY=value strings (bare KEY means passthrough)
    Array(Vec<String>),
    /// Map of key to value (null value means passthrough)
    Map(HashMap<String, Option<String>>),
}

impl EnvironmentConfig {
    /// Normalized entries. Map form is sorted by key for determinism.
    pub fn entries(&self) -> Vec<EnvEntry> {
        match self {
            EnvironmentConfig::Array(arr) => arr
                .iter()
                .map(|item| match item.split_once('=') {
                    Some((key, value)) => EnvEntry {
                        key: key.to_string(),
                        value: Some(value.to_string()),
                    },
                    None => EnvEntry {
                        key: item.trim().to_string(),
                        value: None,
                    },
                })
                .collect(),
            EnvironmentConfig::Map(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                keys.into_iter()
                    .map(|key| EnvEntry {
                        key: key.clone(),
                        value: map[key].clone(),
                    })
                    .collect()
            }
        }
    }
}

/// Port configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortConfig {
    /// Short syntax: "8000:8000", "127.0.0.1:8000:8000", "8000/udp"
    Short(String),
    /// Long syntax
    Long(PortConfigLong),
}

/// Long port configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfigLong {
    /// Target port in the service
    pub target: u16,
    /// Published port on the host
    pub published: Option<String>,
    /// Host IP to bind to
    pub host_ip: Option<String>,
    /// Protocol (tcp/udp)
    pub protocol: Option<String>,
}

/// A parsed port mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedPort {
    /// Host IP, when pinned
    pub host_ip: Option<String>,
    /// Host port; absent means the port is container-visible only
    pub host_port: Option<u16>,
    /// Port inside the service
    pub container_port: u16,
    /// Protocol, "tcp" unless stated otherwise
    pub protocol: String,
}

impl PortConfig {
    /// Parse either syntax into a [`PublishedPort`]
    pub fn resolve(&self) -> Result<PublishedPort> {
        match self {
            PortConfig::Short(s) => {
                let (spec, protocol) = match s.split_once('/') {
                    Some((spec, proto)) => (spec, proto.to_string()),
                    None => (s.as_str(), "tcp".to_string()),
                };

                let parts: Vec<&str> = spec.split(':').collect();
                let parse = |p: &str| -> Result<u16> {
                    p.parse().map_err(|_| {
                        ConvoyError::InvalidConfig(format!("Invalid port number: {}", p))
                    })
                };

                match parts.as_slice() {
                    [container] => Ok(PublishedPort {
                        host_ip: None,
                        host_port: None,
                        container_port: parse(container)?,
                        protocol,
                    }),
                    [host, container] => Ok(PublishedPort {
                        host_ip: None,
                        host_port: Some(parse(host)?),
                        container_port: parse(container)?,
                        protocol,
                    }),
                    [ip, host, container] => Ok(PublishedPort {
                        host_ip: Some(ip.to_string()),
                        host_port: Some(parse(host)?),
                        container_port: parse(container)?,
                        protocol,
                    }),
                    _ => Err(ConvoyError::InvalidConfig(format!(
                        "Invalid port mapping: {}",
                        s
                    ))),
                }
            }
            PortConfig::Long(long) => {
                let host_port = match &long.published {
                    Some(p) => Some(p.parse().map_err(|_| {
                        ConvoyError::InvalidConfig(format!("Invalid published port: {}", p))
                    })?),
                    None => None,
                };
                Ok(PublishedPort {
                    host_ip: long.host_ip.clone(),
                    host_port,
                    container_port: long.target,
                    protocol: long.protocol.clone().unwrap_or_else(|| "tcp".to_string()),
                })
            }
        }
    }
}

/// Depends on configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependsOnConfig {
    /// Array of service names
    Array(Vec<String>),
    /// Map of service to condition
    Map(HashMap<String, DependsOnCondition>),
}

/// Depends on condition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependsOnCondition {
    /// Condition to wait for
    pub condition: StartCondition,
}

/// When a dependency is considered satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartCondition {
    /// Dependency process has started
    ServiceStarted,
    /// Dependency passed its readiness probe
    ServiceHealthy,
    /// Dependency exited with status 0
    ServiceCompletedSuccessfully,
}

/// Deploy configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Number of replicas
    pub replicas: Option<u32>,
}

/// Healthcheck configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthcheckConfig {
    /// Test command
    pub test: Option<HealthcheckTest>,
    /// Time between probe attempts
    #[serde(default, with = "humantime_serde::option")]
    pub interval: Option<Duration>,
    /// Per-attempt timeout
    #[serde(default, with = "humantime_serde::option")]
    pub timeout: Option<Duration>,
    /// Consecutive failures before the service is unhealthy
    pub retries: Option<u32>,
    /// Grace period before failures count
    #[serde(default, with = "humantime_serde::option")]
    pub start_period: Option<Duration>,
    /// Disable healthcheck
    pub disable: Option<bool>,
}

/// Healthcheck test
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HealthcheckTest {
    /// Command string, run through the shell
    Command(String),
    /// Command array: ["CMD", ...] or ["CMD-SHELL", "..."] or ["NONE"]
    Array(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_entries_array_passthrough() {
        let env = EnvironmentConfig::Array(vec![
            "DATABASE_URL=postgres://localhost/app".to_string(),
            "SECRET_KEY".to_string(),
        ]);

        let entries = env.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[0].value.as_deref(),
            Some("postgres://localhost/app")
        );
        assert_eq!(entries[1].key, "SECRET_KEY");
        assert!(entries[1].value.is_none());
    }

    #[test]
    fn test_env_entries_map_sorted() {
        let mut map = HashMap::new();
        map.insert("B".to_string(), Some("2".to_string()));
        map.insert("A".to_string(), None);
        let env = EnvironmentConfig::Map(map);

        let entries = env.entries();
        assert_eq!(entries[0].key, "A");
        assert!(entries[0].value.is_none());
        assert_eq!(entries[1].key, "B");
    }

    #[test]
    fn test_port_short_syntax() {
        let port = PortConfig::Short("8000:8000".to_string()).resolve().unwrap();
        assert_eq!(port.host_port, Some(8000));
        assert_eq!(port.container_port, 8000);
        assert_eq!(port.protocol, "tcp");

        let port = PortConfig::Short("127.0.0.1:5432:5432".to_string())
            .resolve()
            .unwrap();
        assert_eq!(port.host_ip.as_deref(), Some("127.0.0.1"));

        let port = PortConfig::Short("53/udp".to_string()).resolve().unwrap();
        assert_eq!(port.host_port, None);
        assert_eq!(port.protocol, "udp");
    }

    #[test]
    fn test_port_invalid() {
        assert!(PortConfig::Short("http".to_string()).resolve().is_err());
        assert!(PortConfig::Short("1:2:3:4".to_string()).resolve().is_err());
    }

    #[test]
    fn test_start_condition_parsing() {
        let yaml = r#"
depends_on:
  db:
    condition: service_healthy
"#;
        let service: ServiceConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            service.dependency_condition("db"),
            Some(StartCondition::ServiceHealthy)
        );
        assert_eq!(service.dependency_names(), vec!["db".to_string()]);
    }

    #[test]
    fn test_healthcheck_durations() {
        let yaml = r#"
test: ["CMD-SHELL", "pg_isready"]
interval: 5s
timeout: 3s
retries: 5
"#;
        let hc: HealthcheckConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(hc.interval, Some(Duration::from_secs(5)));
        assert_eq!(hc.timeout, Some(Duration::from_secs(3)));
        assert_eq!(hc.retries, Some(5));
    }
}
