//! Start-time environment resolution
//!
//! Literal entries are taken as declared. Passthrough entries (no value in
//! the stack file) are read from the host environment when the service
//! starts, never earlier; a missing passthrough variable aborts the start
//! of that service before its process is spawned.

use super::config::ServiceConfig;
use crate::error::{ConvoyError, Result};
use std::collections::HashMap;

/// Snapshot of the host environment
pub fn host_environment() -> HashMap<String, String> {
    std::env::vars().collect()
}

/// Resolve a service's environment against the host environment
pub fn resolve_environment(
    service_name: &str,
    service: &ServiceConfig,
    host: &HashMap<String, String>,
) -> Result<HashMap<String, String>> {
    let mut resolved = HashMap::new();

    for entry in service.env_entries() {
        match entry.value {
            Some(value) => {
                resolved.insert(entry.key, value);
            }
            None => match host.get(&entry.key) {
                Some(value) => {
                    resolved.insert(entry.key, value.clone());
                }
                None => {
                    return Err(ConvoyError::MissingEnvironment {
                        variable: entry.key,
                        service: service_name.to_string(),
                    });
                }
            },
        }
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::parser::StackParser;

    fn service(yaml: &str) -> ServiceConfig {
        let config = StackParser::parse_str(yaml).unwrap();
        config.services.into_values().next().unwrap()
    }

    #[test]
    fn test_literal_and_passthrough() {
        let svc = service(
            r#"
services:
  app:
    image: app:latest
    environment:
      - DATABASE_URL=postgres://db:5432/app
      - SECRET_KEY
"#,
        );

        let mut host = HashMap::new();
        host.insert("SECRET_KEY".to_string(), "s3cr3t".to_string());

        let env = resolve_environment("app", &svc, &host).unwrap();
        assert_eq!(env["DATABASE_URL"], "postgres://db:5432/app");
        assert_eq!(env["SECRET_KEY"], "s3cr3t");
    }

    #[test]
    fn test_missing_passthrough_fails_fast() {
        let svc = service(
            r#"
services:
  app:
    image: app:latest
    environment:
      SMTP_PASSWORD:
"#,
        );

        let err = resolve_environment("app", &svc, &HashMap::new()).unwrap_err();
        match err {
            ConvoyError::MissingEnvironment { variable, service } => {
                assert_eq!(variable, "SMTP_PASSWORD");
                assert_eq!(service, "app");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_literal_never_consults_host() {
        let svc = service(
            r#"
services:
  app:
    image: app:latest
    environment:
      SECRET_KEY: from-stack-file
"#,
        );

        let mut host = HashMap::new();
        host.insert("SECRET_KEY".to_string(), "from-host".to_string());

        let env = resolve_environment("app", &svc, &host).unwrap();
        assert_eq!(env["SECRET_KEY"], "from-stack-file");
    }
}
