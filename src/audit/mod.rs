//! Deployment audits
//!
//! Checks a stack file against the image plans of its buildable services:
//! port coherence, environment surface, dependency resolution, secrets
//! baked into build artifacts, and ungated start-order dependencies.

use crate::compose::config::StackConfig;
use crate::error::Result;
use crate::image::spec::ImagePlan;
use crate::probe::ProbeSpec;
use serde::Serialize;
use std::collections::HashMap;

/// Finding severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
        }
    }
}

/// One audit finding
#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    /// Severity
    pub severity: Severity,
    /// Stable check code
    pub code: &'static str,
    /// Service the finding concerns, when one
    pub service: Option<String>,
    /// Human-readable message
    pub message: String,
}

impl Finding {
    fn error(code: &'static str, service: &str, message: String) -> Self {
        Self {
            severity: Severity::Error,
            code,
            service: Some(service.to_string()),
            message,
        }
    }

    fn warning(code: &'static str, service: &str, message: String) -> Self {
        Self {
            severity: Severity::Warning,
            code,
            service: Some(service.to_string()),
            message,
        }
    }
}

/// Audit result
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditReport {
    /// All findings, in check order
    pub findings: Vec<Finding>,
}

impl AuditReport {
    /// Whether any finding is an error
    pub fn has_errors(&self) -> bool {
        self.findings
            .iter()
            .any(|f| f.severity == Severity::Error)
    }

    /// Error count
    pub fn error_count(&self) -> usize {
        self.findings
            .iter()
            .filter(|f| f.severity == Severity::Error)
            .count()
    }

    /// Warning count
    pub fn warning_count(&self) -> usize {
        self.findings
            .iter()
            .filter(|f| f.severity == Severity::Warning)
            .count()
    }
}

/// Audit a stack against the image plans of its buildable services
pub fn audit_stack(
    config: &StackConfig,
    plans: &HashMap<String, ImagePlan>,
) -> Result<AuditReport> {
    let mut findings = Vec::new();

    let mut names: Vec<&String> = config.services.keys().collect();
    names.sort();

    let mut host_ports: HashMap<u16, String> = HashMap::new();

    for name in &names {
        let service = &config.services[*name];

        check_dependencies(config, name, &mut findings)?;

        if let Some(plan) = plans.get(*name) {
            check_environment_surface(name, service, plan, &mut findings);
            check_ports(name, service, plan, &mut findings)?;
            check_secret_defaults(name, plan, &mut findings);
        }

        for port in service.published_ports()? {
            if let Some(host_port) = port.host_port {
                if let Some(holder) = host_ports.get(&host_port) {
                    findings.push(Finding::error(
                        "duplicate-host-port",
                        name,
                        format!(
                            "Service '{}' publishes host port {} already taken by service '{}'",
                            name, host_port, holder
                        ),
                    ));
                } else {
                    host_ports.insert(host_port, (*name).clone());
                }
            }
        }
    }

    Ok(AuditReport { findings })
}

/// Every depends_on target must name a defined service, and gating on a
/// dependency with no readiness signal is a latent race
fn check_dependencies(
    config: &StackConfig,
    name: &str,
    findings: &mut Vec<Finding>,
) -> Result<()> {
    use crate::compose::config::StartCondition;

    let service = &config.services[name];
    let mut deps = service.dependency_names();
    deps.sort();

    for dep in deps {
        let Some(dep_config) = config.services.get(&dep) else {
            findings.push(Finding::error(
                "unresolved-dependency",
                name,
                format!("Service '{}' depends on unknown service '{}'", name, dep),
            ));
            continue;
        };

        // service_started is an explicit opt-out of readiness gating
        if service.dependency_condition(&dep) == Some(StartCondition::ServiceStarted) {
            continue;
        }

        if ProbeSpec::derive(dep_config)?.is_none() {
            findings.push(Finding::warning(
                "ungated-dependency",
                name,
                format!(
                    "Service '{}' depends on '{}' which offers no readiness signal (no healthcheck, no published TCP port); start order alone does not guarantee '{}' is accepting connections",
                    name, dep, dep
                ),
            ));
        }
    }

    Ok(())
}

/// The image's configuration surface and the stack's environment must
/// match exactly
fn check_environment_surface(
    name: &str,
    service: &crate::compose::config::ServiceConfig,
    plan: &ImagePlan,
    findings: &mut Vec<Finding>,
) {
    let declared: Vec<String> = service.env_entries().into_iter().map(|e| e.key).collect();
    let surface = plan.configuration_surface();

    for variable in &surface {
        if !declared.contains(variable) {
            findings.push(Finding::error(
                "environment-surface",
                name,
                format!(
                    "Service '{}' does not supply '{}', part of its image's configuration surface",
                    name, variable
                ),
            ));
        }
    }

    for variable in &declared {
        if !surface.contains(variable) {
            findings.push(Finding::warning(
                "environment-surface",
                name,
                format!(
                    "Service '{}' supplies '{}' which its image does not declare",
                    name, variable
                ),
            ));
        }
    }
}

/// Published ports must be exposed by the image and cover the port the
/// startup command binds
fn check_ports(
    name: &str,
    service: &crate::compose::config::ServiceConfig,
    plan: &ImagePlan,
    findings: &mut Vec<Finding>,
) -> Result<()> {
    let published = service.published_ports()?;

    for port in &published {
        if port.protocol == "tcp" && !plan.exposes_tcp_port(port.container_port) {
            findings.push(Finding::error(
                "port-exposure",
                name,
                format!(
                    "Service '{}' publishes container port {} which its image does not expose",
                    name, port.container_port
                ),
            ));
        }
    }

    if let Some(bound) = plan.bound_port() {
        if !plan.exposes_tcp_port(bound) {
            findings.push(Finding::error(
                "port-exposure",
                name,
                format!(
                    "Image for service '{}' binds port {} in its startup command but does not expose it",
                    name, bound
                ),
            ));
        }

        if published.is_empty() {
            findings.push(Finding::warning(
                "port-binding",
                name,
                format!(
                    "Service '{}' binds port {} but publishes no port mapping",
                    name, bound
                ),
            ));
        } else if !published.iter().any(|p| p.container_port == bound) {
            findings.push(Finding::error(
                "port-binding",
                name,
                format!(
                    "Service '{}' publishes no mapping for port {}, the port its startup command binds",
                    name, bound
                ),
            ));
        }
    }

    Ok(())
}

/// A secret baked into a build artifact persists in every image layer;
/// secrets belong in start-time environment only
fn check_secret_defaults(name: &str, plan: &ImagePlan, findings: &mut Vec<Finding>) {
    let secret_key = regex::Regex::new(
        r"(?i)(password|passwd|secret|token|api_key|apikey|access_key|private_key|credential)",
    )
    .expect("static pattern");
    let credential_url = regex::Regex::new(r"://[^/\s:@]+:[^@\s]+@").expect("static pattern");

    for (key, value) in &plan.env {
        if value.is_empty() {
            continue;
        }

        if secret_key.is_match(key) {
            findings.push(Finding::error(
                "secret-default",
                name,
                format!(
                    "Image for service '{}' bakes a default for secret-looking variable '{}'; inject it at start time instead",
                    name, key
                ),
            ));
        } else if credential_url.is_match(value) {
            findings.push(Finding::error(
                "secret-default",
                name,
                format!(
                    "Image for service '{}' bakes credentials into the default of '{}'; inject the connection string at start time instead",
                    name, key
                ),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::parser::StackParser;
    use crate::image::buildfile::ParsedBuildFile;

    fn plan(content: &str) -> ImagePlan {
        let parsed = ParsedBuildFile::parse(content).unwrap();
        ImagePlan::resolve(&parsed, None, None).unwrap()
    }

    fn audit(yaml: &str, plans: Vec<(&str, ImagePlan)>) -> AuditReport {
        let config = StackParser::parse_str(yaml).unwrap();
        let plans = plans
            .into_iter()
            .map(|(name, plan)| (name.to_string(), plan))
            .collect();
        audit_stack(&config, &plans).unwrap()
    }

    fn codes(report: &AuditReport, severity: Severity) -> Vec<&'static str> {
        report
            .findings
            .iter()
            .filter(|f| f.severity == severity)
            .map(|f| f.code)
            .collect()
    }

    const APP_IMAGE: &str = r#"
FROM python:3.11-slim
ENV DATABASE_URL=
ENV SECRET_KEY=
EXPOSE 8000
CMD ["uvicorn", "main:app", "--host", "0.0.0.0", "--port", "8000"]
"#;

    #[test]
    fn test_clean_stack() {
        let yaml = r#"
services:
  app:
    build: .
    ports:
      - "8000:8000"
    environment:
      - DATABASE_URL
      - SECRET_KEY
    depends_on:
      db:
        condition: service_started
  db:
    image: postgres:16
"#;

        let report = audit(yaml, vec![("app", plan(APP_IMAGE))]);
        assert!(!report.has_errors());
        assert_eq!(report.findings.len(), 0);
    }

    #[test]
    fn test_environment_surface_diff() {
        let yaml = r#"
services:
  app:
    build: .
    ports:
      - "8000:8000"
    environment:
      - DATABASE_URL
      - SMTP_SERVER
"#;

        let report = audit(yaml, vec![("app", plan(APP_IMAGE))]);
        assert!(report.has_errors());

        // SECRET_KEY missing is an error, SMTP_SERVER extra is a warning
        assert!(codes(&report, Severity::Error).contains(&"environment-surface"));
        assert!(codes(&report, Severity::Warning).contains(&"environment-surface"));

        let missing = report
            .findings
            .iter()
            .find(|f| f.severity == Severity::Error && f.code == "environment-surface")
            .unwrap();
        assert!(missing.message.contains("SECRET_KEY"));
    }

    #[test]
    fn test_published_port_must_match_bound_port() {
        let yaml = r#"
services:
  app:
    build: .
    ports:
      - "9000:9000"
    environment:
      - DATABASE_URL
      - SECRET_KEY
"#;

        let report = audit(yaml, vec![("app", plan(APP_IMAGE))]);
        let errors = codes(&report, Severity::Error);
        assert!(errors.contains(&"port-exposure"));
        assert!(errors.contains(&"port-binding"));
    }

    #[test]
    fn test_secret_default_in_image() {
        let leaky = plan(
            r#"
FROM python:3.11-slim
ENV SECRET_KEY=changeme
ENV DATABASE_URL=postgresql+psycopg2://app:hunter2@db:5432/app
EXPOSE 8000
"#,
        );

        let yaml = r#"
services:
  app:
    build: .
    ports:
      - "8000:8000"
    environment:
      - SECRET_KEY
      - DATABASE_URL
"#;

        let report = audit(yaml, vec![("app", leaky)]);
        let secret_findings: Vec<&Finding> = report
            .findings
            .iter()
            .filter(|f| f.code == "secret-default")
            .collect();
        assert_eq!(secret_findings.len(), 2);
        assert!(report.has_errors());
    }

    #[test]
    fn test_empty_defaults_are_not_secrets() {
        let report = audit(
            r#"
services:
  app:
    build: .
    ports:
      - "8000:8000"
    environment:
      - DATABASE_URL
      - SECRET_KEY
"#,
            vec![("app", plan(APP_IMAGE))],
        );
        assert!(codes(&report, Severity::Error).is_empty());
    }

    #[test]
    fn test_ungated_dependency() {
        let yaml = r#"
services:
  app:
    image: app:latest
    depends_on:
      - db
  db:
    image: postgres:16
"#;

        let report = audit(yaml, vec![]);
        assert!(codes(&report, Severity::Warning).contains(&"ungated-dependency"));
        assert!(!report.has_errors());
    }

    #[test]
    fn test_gated_dependency_is_clean() {
        let yaml = r#"
services:
  app:
    image: app:latest
    depends_on:
      - db
  db:
    image: postgres:16
    ports:
      - "5432:5432"
"#;

        let report = audit(yaml, vec![]);
        assert!(!codes(&report, Severity::Warning).contains(&"ungated-dependency"));
    }

    #[test]
    fn test_unresolved_dependency() {
        let yaml = r#"
services:
  app:
    image: app:latest
    depends_on:
      - db
"#;

        let report = audit(yaml, vec![]);
        assert!(codes(&report, Severity::Error).contains(&"unresolved-dependency"));
    }

    #[test]
    fn test_duplicate_host_port() {
        let yaml = r#"
services:
  app:
    image: app:latest
    ports:
      - "8000:8000"
  admin:
    image: admin:latest
    ports:
      - "8000:8080"
"#;

        let report = audit(yaml, vec![]);
        assert!(codes(&report, Severity::Error).contains(&"duplicate-host-port"));
    }
}
