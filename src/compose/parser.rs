//! Stack file parser

use super::config::{EnvironmentConfig, StackConfig};
use crate::error::{ConvoyError, Result};
use std::collections::HashMap;
use std::path::Path;

/// Default stack file names, checked in order
pub const DEFAULT_STACK_FILES: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

/// Stack file parser
pub struct StackParser;

impl StackParser {
    /// Find a stack file in a directory
    pub fn find_stack_file(dir: &Path) -> Option<std::path::PathBuf> {
        for name in DEFAULT_STACK_FILES {
            let path = dir.join(name);
            if path.exists() {
                return Some(path);
            }
        }
        None
    }

    /// Parse a stack file from a path
    pub fn parse_file(path: &Path) -> Result<StackConfig> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConvoyError::StackParse(format!("Failed to read file: {}", e)))?;

        Self::parse_str(&content)
    }

    /// Parse stack file content
    pub fn parse_str(content: &str) -> Result<StackConfig> {
        serde_yaml::from_str(content)
            .map_err(|e| ConvoyError::StackParse(format!("Failed to parse YAML: {}", e)))
    }

    /// Parse multiple stack files, later files overlaying earlier ones
    pub fn parse_files(paths: &[&Path]) -> Result<StackConfig> {
        let mut config = StackConfig::default();

        for path in paths {
            let file_config = Self::parse_file(path)?;
            config = Self::merge_configs(config, file_config);
        }

        Ok(config)
    }

    /// Merge two stack configurations (overlay wins)
    pub fn merge_configs(base: StackConfig, overlay: StackConfig) -> StackConfig {
        let mut result = base;

        if overlay.version.is_some() {
            result.version = overlay.version;
        }

        if overlay.name.is_some() {
            result.name = overlay.name;
        }

        for (name, service) in overlay.services {
            if let Some(existing) = result.services.get_mut(&name) {
                if service.image.is_some() {
                    existing.image = service.image;
                }
                if service.build.is_some() {
                    existing.build = service.build;
                }
                if service.command.is_some() {
                    existing.command = service.command;
                }
                if service.entrypoint.is_some() {
                    existing.entrypoint = service.entrypoint;
                }
                if service.environment.is_some() {
                    existing.environment = service.environment;
                }
                if service.ports.is_some() {
                    existing.ports = service.ports;
                }
                if service.depends_on.is_some() {
                    existing.depends_on = service.depends_on;
                }
                if service.healthcheck.is_some() {
                    existing.healthcheck = service.healthcheck;
                }
                if service.deploy.is_some() {
                    existing.deploy = service.deploy;
                }
                if service.restart.is_some() {
                    existing.restart = service.restart;
                }
            } else {
                result.services.insert(name, service);
            }
        }

        result
    }

    /// Validate a stack configuration
    ///
    /// Hard errors fail the parse; soft issues come back as warnings.
    pub fn validate(config: &StackConfig) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        for (name, service) in &config.services {
            if service.image.is_none() && service.build.is_none() {
                return Err(ConvoyError::StackParse(format!(
                    "Service '{}' must have either 'image' or 'build' specified",
                    name
                )));
            }

            for dep in service.dependency_names() {
                if !config.services.contains_key(&dep) {
                    return Err(ConvoyError::StackParse(format!(
                        "Service '{}' depends on unknown service '{}'",
                        name, dep
                    )));
                }
                if dep == *name {
                    return Err(ConvoyError::StackParse(format!(
                        "Service '{}' depends on itself",
                        name
                    )));
                }
            }

            // Port syntax is checked here so `up` never sees a malformed mapping
            let ports = service.published_ports()?;

            if service.replicas() > 1 && ports.iter().any(|p| p.host_port.is_some()) {
                warnings.push(format!(
                    "Service '{}' publishes a host port with {} replicas; only one replica can bind it",
                    name,
                    service.replicas()
                ));
            }
        }

        Ok(warnings)
    }

    /// Interpolate host environment variables into a config
    ///
    /// Supports `${VAR}`, `$VAR` and `${VAR:-default}` in service images,
    /// environment values and shell commands.
    pub fn interpolate(config: &mut StackConfig, env: &HashMap<String, String>) {
        for service in config.services.values_mut() {
            if let Some(ref mut image) = service.image {
                *image = interpolate_string(image, env);
            }

            if let Some(ref mut environment) = service.environment {
                match environment {
                    EnvironmentConfig::Map(map) => {
                        for value in map.values_mut().flatten() {
                            *value = interpolate_string(value, env);
                        }
                    }
                    EnvironmentConfig::Array(arr) => {
                        for item in arr.iter_mut() {
                            *item = interpolate_string(item, env);
                        }
                    }
                }
            }

            if let Some(super::config::CommandConfig::Shell(ref mut s)) = service.command {
                *s = interpolate_string(s, env);
            }
        }
    }
}

/// Interpolate environment variables in a string
fn interpolate_string(s: &str, env: &HashMap<String, String>) -> String {
    let re = regex::Regex::new(
        r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}|\$([A-Za-z_][A-Za-z0-9_]*)",
    )
    .expect("static pattern");

    re.replace_all(s, |caps: &regex::Captures| {
        let var = caps
            .get(1)
            .or_else(|| caps.get(3))
            .map(|m| m.as_str())
            .unwrap_or("");
        match env.get(var) {
            Some(value) => value.clone(),
            None => caps
                .get(2)
                .map(|m| m.as_str().to_string())
                .unwrap_or_default(),
        }
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_stack() {
        let yaml = r#"
version: "3.8"
services:
  app:
    build: .
    ports:
      - "8000:8000"
    depends_on:
      - db
  db:
    image: postgres:16
    environment:
      POSTGRES_PASSWORD: secret
"#;

        let config = StackParser::parse_str(yaml).unwrap();
        assert_eq!(config.services.len(), 2);
        assert!(config.services.contains_key("app"));
        assert!(config.services.contains_key("db"));
        assert_eq!(
            config.services["app"].dependency_names(),
            vec!["db".to_string()]
        );
    }

    #[test]
    fn test_validate_missing_image_and_build() {
        let yaml = r#"
services:
  app:
    ports:
      - "8000:8000"
"#;

        let config = StackParser::parse_str(yaml).unwrap();
        assert!(StackParser::validate(&config).is_err());
    }

    #[test]
    fn test_validate_unknown_dependency() {
        let yaml = r#"
services:
  app:
    image: app:latest
    depends_on:
      - db
"#;

        let config = StackParser::parse_str(yaml).unwrap();
        let err = StackParser::validate(&config).unwrap_err();
        assert!(err.to_string().contains("unknown service 'db'"));
    }

    #[test]
    fn test_validate_replica_port_warning() {
        let yaml = r#"
services:
  app:
    image: app:latest
    ports:
      - "8000:8000"
    deploy:
      replicas: 3
"#;

        let config = StackParser::parse_str(yaml).unwrap();
        let warnings = StackParser::validate(&config).unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("replicas"));
    }

    #[test]
    fn test_merge_overlay_wins() {
        let base = StackParser::parse_str("services:\n  app:\n    image: app:1\n").unwrap();
        let overlay = StackParser::parse_str("services:\n  app:\n    image: app:2\n").unwrap();

        let merged = StackParser::merge_configs(base, overlay);
        assert_eq!(merged.services["app"].image.as_deref(), Some("app:2"));
    }

    #[test]
    fn test_interpolate() {
        let mut env = HashMap::new();
        env.insert("TAG".to_string(), "1.0.0".to_string());

        assert_eq!(interpolate_string("app:${TAG}", &env), "app:1.0.0");
        assert_eq!(interpolate_string("app:$TAG", &env), "app:1.0.0");
        assert_eq!(
            interpolate_string("app:${MISSING:-latest}", &env),
            "app:latest"
        );
        assert_eq!(interpolate_string("app:${MISSING}", &env), "app:");
    }

    #[test]
    fn test_find_stack_file() {
        let temp = tempfile::tempdir().unwrap();
        assert!(StackParser::find_stack_file(temp.path()).is_none());

        std::fs::write(temp.path().join("docker-compose.yml"), "services: {}").unwrap();
        let found = StackParser::find_stack_file(temp.path()).unwrap();
        assert!(found.ends_with("docker-compose.yml"));
    }
}
