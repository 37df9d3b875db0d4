//! Stack orchestrator
//!
//! Starts services in dependency order and gates each dependent on its
//! dependencies' readiness probes. A dependency with no derivable probe
//! falls back to bare start order, with a warning.

use super::config::{CommandConfig, ServiceConfig, StackConfig, StartCondition};
use super::env::{host_environment, resolve_environment};
use crate::error::{ConvoyError, Result};
use crate::image::spec::{BuildContext, ImagePlan};
use crate::probe::ProbeSpec;
use crate::service::config::{PortMapping, ProcessConfig, Protocol, ServiceStatus};
use crate::service::ServiceSupervisor;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// How long `service_completed_successfully` waits for a dependency to exit
const COMPLETION_DEADLINE: Duration = Duration::from_secs(60);

/// Service state
#[derive(Debug, Clone)]
pub struct ServiceState {
    /// Service name
    pub name: String,
    /// Instance IDs for this service
    pub instance_ids: Vec<String>,
    /// Desired replica count
    pub replicas: u32,
    /// Current state
    pub state: ServiceStatus,
}

/// Stack orchestrator
pub struct StackOrchestrator {
    /// Project name
    project_name: String,
    /// Stack configuration
    config: StackConfig,
    /// Service supervisor
    supervisor: Arc<ServiceSupervisor>,
    /// Service states
    service_states: HashMap<String, ServiceState>,
    /// Project working directory
    working_dir: PathBuf,
    /// Host environment used for passthrough resolution
    host_env: HashMap<String, String>,
    /// Image plans for services with a build context
    image_plans: HashMap<String, ImagePlan>,
}

impl StackOrchestrator {
    /// Create a new orchestrator
    pub fn new(
        project_name: &str,
        config: StackConfig,
        supervisor: Arc<ServiceSupervisor>,
        working_dir: PathBuf,
    ) -> Self {
        Self {
            project_name: project_name.to_string(),
            config,
            supervisor,
            service_states: HashMap::new(),
            working_dir,
            host_env: host_environment(),
            image_plans: HashMap::new(),
        }
    }

    /// Replace the host environment used for passthrough resolution
    pub fn with_host_env(mut self, host_env: HashMap<String, String>) -> Self {
        self.host_env = host_env;
        self
    }

    /// Image plans resolved during the build phase
    pub fn image_plans(&self) -> &HashMap<String, ImagePlan> {
        &self.image_plans
    }

    /// Start the stack
    pub async fn up(&mut self, build: bool) -> Result<()> {
        tracing::info!("Starting stack project: {}", self.project_name);

        if build {
            self.build_services()?;
        }

        let order = self.start_order()?;

        for service_name in order {
            self.await_dependencies(&service_name).await?;
            self.start_service(&service_name).await?;
        }

        Ok(())
    }

    /// Stop the stack, reverse start order
    pub async fn down(&mut self) -> Result<()> {
        tracing::info!("Stopping stack project: {}", self.project_name);

        let order = self.start_order()?;
        for service_name in order.into_iter().rev() {
            self.stop_service(&service_name).await?;
        }

        for state in self.service_states.values() {
            for id in &state.instance_ids {
                if let Err(e) = self.supervisor.remove(id, true).await {
                    tracing::warn!("Failed to remove instance {}: {}", id, e);
                }
            }
        }
        self.service_states.clear();

        Ok(())
    }

    /// Resolve image plans for every service with a build context
    pub fn build_services(&mut self) -> Result<()> {
        let mut buildable: Vec<(String, PathBuf, Option<String>, Option<String>)> = self
            .config
            .services
            .iter()
            .filter_map(|(name, service)| {
                service.build.as_ref().map(|build| {
                    let context_path = build
                        .context()
                        .map(|p| self.working_dir.join(p))
                        .unwrap_or_else(|| self.working_dir.clone());
                    (
                        name.clone(),
                        context_path,
                        build.dockerfile().map(|s| s.to_string()),
                        build.target().map(|s| s.to_string()),
                    )
                })
            })
            .collect();
        buildable.sort_by(|a, b| a.0.cmp(&b.0));

        for (name, context_path, dockerfile, target) in buildable {
            let mut context = BuildContext::new(context_path.clone())
                .tag(&format!("{}-{}:latest", self.project_name, name));
            if let Some(file) = dockerfile {
                context = context.file(context_path.join(file));
            }
            if let Some(target) = target {
                context = context.target(&target);
            }

            let plan = context.plan()?;
            tracing::info!("Planned image {} for service {}", plan.id, name);
            self.image_plans.insert(name, plan);
        }

        Ok(())
    }

    /// Start a specific service
    pub async fn start_service(&mut self, service_name: &str) -> Result<()> {
        let service = self
            .config
            .services
            .get(service_name)
            .ok_or_else(|| ConvoyError::ServiceNotFound(service_name.to_string()))?
            .clone();

        let replicas = service.replicas();
        let command = self.resolve_command(service_name, &service)?;
        // Passthrough resolution happens here, before any process spawns
        let env = resolve_environment(service_name, &service, &self.host_env)?;
        let ports = service.published_ports()?;

        tracing::info!(
            "Starting service {} with {} replica(s)",
            service_name,
            replicas
        );

        let mut instance_ids = Vec::new();

        for i in 0..replicas {
            let instance_name = format!("{}-{}-{}", self.project_name, service_name, i + 1);
            let config = self.instance_config(
                service_name,
                &service,
                &instance_name,
                command.clone(),
                env.clone(),
                &ports,
            );

            let id = self.supervisor.create(config).await?;
            self.supervisor.start(&id).await?;
            instance_ids.push(id);
        }

        self.service_states.insert(
            service_name.to_string(),
            ServiceState {
                name: service_name.to_string(),
                instance_ids,
                replicas,
                state: ServiceStatus::Running,
            },
        );

        Ok(())
    }

    /// Stop a specific service
    pub async fn stop_service(&mut self, service_name: &str) -> Result<()> {
        if let Some(state) = self.service_states.get(service_name) {
            for id in &state.instance_ids {
                if let Err(e) = self.supervisor.stop(id).await {
                    tracing::warn!("Failed to stop instance {}: {}", id, e);
                }
            }
        }

        if let Some(state) = self.service_states.get_mut(service_name) {
            state.state = ServiceStatus::Stopped;
        }

        Ok(())
    }

    /// Restart a service
    pub async fn restart_service(&mut self, service_name: &str) -> Result<()> {
        self.stop_service(service_name).await?;
        if let Some(state) = self.service_states.remove(service_name) {
            for id in &state.instance_ids {
                self.supervisor.remove(id, true).await?;
            }
        }
        self.start_service(service_name).await?;
        Ok(())
    }

    /// Scale a service to a replica count
    pub async fn scale(&mut self, service_name: &str, replicas: u32) -> Result<()> {
        let current = self
            .service_states
            .get(service_name)
            .map(|s| s.replicas)
            .unwrap_or(0);

        if replicas > current {
            let service = self
                .config
                .services
                .get(service_name)
                .ok_or_else(|| ConvoyError::ServiceNotFound(service_name.to_string()))?
                .clone();

            let command = self.resolve_command(service_name, &service)?;
            let env = resolve_environment(service_name, &service, &self.host_env)?;
            let ports = service.published_ports()?;

            let mut new_ids = Vec::new();
            for i in current..replicas {
                let instance_name = format!("{}-{}-{}", self.project_name, service_name, i + 1);
                let config = self.instance_config(
                    service_name,
                    &service,
                    &instance_name,
                    command.clone(),
                    env.clone(),
                    &ports,
                );
                let id = self.supervisor.create(config).await?;
                self.supervisor.start(&id).await?;
                new_ids.push(id);
            }

            let state = self
                .service_states
                .entry(service_name.to_string())
                .or_insert_with(|| ServiceState {
                    name: service_name.to_string(),
                    instance_ids: Vec::new(),
                    replicas: 0,
                    state: ServiceStatus::Running,
                });
            state.instance_ids.extend(new_ids);
            state.replicas = replicas;
        } else if replicas < current {
            let mut removed = Vec::new();
            if let Some(state) = self.service_states.get_mut(service_name) {
                while state.instance_ids.len() > replicas as usize {
                    if let Some(id) = state.instance_ids.pop() {
                        removed.push(id);
                    }
                }
                state.replicas = replicas;
            }
            for id in removed {
                self.supervisor.remove(&id, true).await?;
            }
        }

        Ok(())
    }

    /// Get service logs, prefixed with instance names
    pub async fn logs(
        &self,
        service_name: Option<&str>,
        tail: Option<usize>,
    ) -> Result<Vec<String>> {
        let mut names: Vec<&str> = match service_name {
            Some(name) => vec![name],
            None => self.service_states.keys().map(|s| s.as_str()).collect(),
        };
        names.sort();

        let mut lines = Vec::new();
        for name in names {
            let state = self
                .service_states
                .get(name)
                .ok_or_else(|| ConvoyError::ServiceNotFound(name.to_string()))?;

            for id in &state.instance_ids {
                let config = self.supervisor.get(id).await?;
                for line in self.supervisor.logs(id, tail).await? {
                    lines.push(format!("[{}] {}", config.name, line));
                }
            }
        }

        Ok(lines)
    }

    /// Get project status
    pub fn status(&self) -> HashMap<String, ServiceState> {
        self.service_states.clone()
    }

    /// Get service start order based on dependencies
    pub fn start_order(&self) -> Result<Vec<String>> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        let mut visiting = HashSet::new();

        let mut names: Vec<&String> = self.config.services.keys().collect();
        names.sort();

        for service_name in names {
            self.topological_sort(service_name, &mut visited, &mut visiting, &mut order)?;
        }

        Ok(order)
    }

    /// Topological sort for dependency resolution
    fn topological_sort(
        &self,
        service: &str,
        visited: &mut HashSet<String>,
        visiting: &mut HashSet<String>,
        order: &mut Vec<String>,
    ) -> Result<()> {
        if visited.contains(service) {
            return Ok(());
        }

        if visiting.contains(service) {
            return Err(ConvoyError::Stack(format!(
                "Circular dependency detected for service: {}",
                service
            )));
        }

        visiting.insert(service.to_string());

        if let Some(service_config) = self.config.services.get(service) {
            let mut deps = service_config.dependency_names();
            deps.sort();

            for dep in deps {
                self.topological_sort(&dep, visited, visiting, order)?;
            }
        }

        visiting.remove(service);
        visited.insert(service.to_string());
        order.push(service.to_string());

        Ok(())
    }

    /// Gate on every dependency of a service before it starts
    async fn await_dependencies(&self, service_name: &str) -> Result<()> {
        let Some(service) = self.config.services.get(service_name) else {
            return Ok(());
        };

        let mut deps = service.dependency_names();
        deps.sort();

        for dep in deps {
            let condition = service.dependency_condition(&dep);
            self.await_dependency(service_name, &dep, condition).await?;
        }

        Ok(())
    }

    async fn await_dependency(
        &self,
        dependent: &str,
        dep: &str,
        condition: Option<StartCondition>,
    ) -> Result<()> {
        let dep_config = self
            .config
            .services
            .get(dep)
            .ok_or_else(|| ConvoyError::ServiceNotFound(dep.to_string()))?;

        match condition {
            // Start order already guarantees the dependency was spawned
            Some(StartCondition::ServiceStarted) => Ok(()),
            Some(StartCondition::ServiceCompletedSuccessfully) => self.wait_completed(dep).await,
            Some(StartCondition::ServiceHealthy) => match ProbeSpec::derive(dep_config)? {
                Some(probe) => {
                    tracing::info!(
                        "Waiting for '{}' to become ready before starting '{}'",
                        dep,
                        dependent
                    );
                    probe.wait_ready(dep).await
                }
                None => Err(ConvoyError::Probe(format!(
                    "Service '{}' requires '{}' to be healthy but no readiness probe is derivable",
                    dependent, dep
                ))),
            },
            None => match ProbeSpec::derive(dep_config)? {
                Some(probe) => {
                    tracing::info!(
                        "Waiting for '{}' to become ready before starting '{}'",
                        dep,
                        dependent
                    );
                    probe.wait_ready(dep).await
                }
                None => {
                    tracing::warn!(
                        "No readiness probe derivable for '{}'; '{}' starts on bare start order",
                        dep,
                        dependent
                    );
                    Ok(())
                }
            },
        }
    }

    /// Wait for every instance of a dependency to exit with status 0
    async fn wait_completed(&self, dep: &str) -> Result<()> {
        let state = self
            .service_states
            .get(dep)
            .ok_or_else(|| ConvoyError::ServiceNotFound(dep.to_string()))?;

        let deadline = tokio::time::Instant::now() + COMPLETION_DEADLINE;

        loop {
            let mut done = true;
            for id in &state.instance_ids {
                let config = self.supervisor.get(id).await?;
                match (config.status, config.exit_code) {
                    (ServiceStatus::Exited, Some(0)) => {}
                    (ServiceStatus::Exited | ServiceStatus::Stopped | ServiceStatus::Dead, code) => {
                        return Err(ConvoyError::Stack(format!(
                            "Service '{}' exited with code {} instead of completing successfully",
                            dep,
                            code.unwrap_or(-1)
                        )));
                    }
                    _ => done = false,
                }
            }

            if done {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ConvoyError::Timeout(format!(
                    "Service '{}' did not complete within {:?}",
                    dep, COMPLETION_DEADLINE
                )));
            }

            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    /// Resolve the command a service runs: explicit entrypoint/command win,
    /// else the built image's startup command
    fn resolve_command(&self, service_name: &str, service: &ServiceConfig) -> Result<Vec<String>> {
        let mut argv = Vec::new();

        if let Some(entrypoint) = &service.entrypoint {
            argv.extend(match entrypoint {
                CommandConfig::Shell(s) => vec![s.clone()],
                CommandConfig::Exec(arr) => arr.clone(),
            });
        }

        if let Some(command) = &service.command {
            if argv.is_empty() {
                argv = command.to_argv();
            } else {
                argv.extend(match command {
                    CommandConfig::Shell(s) => vec![s.clone()],
                    CommandConfig::Exec(arr) => arr.clone(),
                });
            }
        }

        if argv.is_empty() {
            if let Some(plan) = self.image_plans.get(service_name) {
                argv = plan.startup_command();
            }
        }

        if argv.is_empty() {
            return Err(ConvoyError::InvalidConfig(format!(
                "Service '{}' resolves to no runnable command (no 'command' and no built image startup command)",
                service_name
            )));
        }

        Ok(argv)
    }

    /// Convert a service config to a runnable instance config
    fn instance_config(
        &self,
        service_name: &str,
        service: &ServiceConfig,
        instance_name: &str,
        command: Vec<String>,
        env: HashMap<String, String>,
        ports: &[super::config::PublishedPort],
    ) -> ProcessConfig {
        let image = service.image.clone().or_else(|| {
            self.image_plans
                .get(service_name)
                .and_then(|plan| plan.tag.clone())
        });

        let mut config = ProcessConfig::new(instance_name, command);
        config.image = image;
        config.env = env;

        if let Some(dir) = &service.working_dir {
            config.working_dir = Some(self.working_dir.join(dir));
        }

        config.ports = ports
            .iter()
            .map(|p| PortMapping {
                host_ip: p.host_ip.clone(),
                host_port: p.host_port,
                container_port: p.container_port,
                protocol: Protocol::parse(&p.protocol),
            })
            .collect();

        if let Some(labels) = &service.labels {
            config.labels.extend(labels.clone());
        }
        config
            .labels
            .insert("convoy.project".to_string(), self.project_name.clone());
        config
            .labels
            .insert("convoy.service".to_string(), service_name.to_string());

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::parser::StackParser;
    use tempfile::tempdir;

    fn orchestrator(yaml: &str) -> (tempfile::TempDir, StackOrchestrator) {
        let config = StackParser::parse_str(yaml).unwrap();
        let temp = tempdir().unwrap();
        let supervisor = Arc::new(ServiceSupervisor::new(temp.path().to_path_buf()).unwrap());
        let orchestrator = StackOrchestrator::new(
            "test",
            config,
            supervisor,
            temp.path().to_path_buf(),
        )
        .with_host_env(HashMap::new());
        (temp, orchestrator)
    }

    #[test]
    fn test_start_order() {
        let yaml = r#"
services:
  web:
    image: nginx
    depends_on:
      - api
  api:
    image: node
    depends_on:
      - db
  db:
    image: postgres
"#;

        let (_temp, orchestrator) = orchestrator(yaml);
        let order = orchestrator.start_order().unwrap();

        let db_pos = order.iter().position(|s| s == "db").unwrap();
        let api_pos = order.iter().position(|s| s == "api").unwrap();
        let web_pos = order.iter().position(|s| s == "web").unwrap();

        assert!(db_pos < api_pos);
        assert!(api_pos < web_pos);
    }

    #[test]
    fn test_circular_dependency_detection() {
        let yaml = r#"
services:
  a:
    image: nginx
    depends_on:
      - b
  b:
    image: nginx
    depends_on:
      - a
"#;

        let (_temp, orchestrator) = orchestrator(yaml);
        assert!(orchestrator.start_order().is_err());
    }

    #[tokio::test]
    async fn test_up_and_down() {
        let yaml = r#"
services:
  app:
    image: app:latest
    command: ["/bin/sh", "-c", "sleep 30"]
    depends_on:
      - db
  db:
    image: postgres:16
    command: ["/bin/sh", "-c", "sleep 30"]
"#;

        let (_temp, mut orchestrator) = orchestrator(yaml);
        orchestrator.up(false).await.unwrap();

        let status = orchestrator.status();
        assert_eq!(status.len(), 2);
        assert_eq!(status["app"].state, ServiceStatus::Running);
        assert_eq!(status["db"].state, ServiceStatus::Running);

        orchestrator.down().await.unwrap();
        assert!(orchestrator.status().is_empty());
    }

    #[tokio::test]
    async fn test_readiness_gate_passes_with_listener() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let yaml = format!(
            r#"
services:
  app:
    image: app:latest
    command: ["/bin/sh", "-c", "sleep 30"]
    depends_on:
      - db
  db:
    image: postgres:16
    command: ["/bin/sh", "-c", "sleep 30"]
    ports:
      - "{}:5432"
"#,
            port
        );

        let (_temp, mut orchestrator) = orchestrator(&yaml);
        orchestrator.up(false).await.unwrap();
        assert_eq!(orchestrator.status().len(), 2);
        orchestrator.down().await.unwrap();
    }

    #[tokio::test]
    async fn test_readiness_gate_fails_on_unhealthy_dependency() {
        let yaml = r#"
services:
  app:
    image: app:latest
    command: ["/bin/sh", "-c", "sleep 30"]
    depends_on:
      - db
  db:
    image: postgres:16
    command: ["/bin/sh", "-c", "sleep 30"]
    healthcheck:
      test: ["CMD", "false"]
      interval: 1s
      timeout: 1s
      retries: 2
"#;

        let (_temp, mut orchestrator) = orchestrator(yaml);
        let err = orchestrator.up(false).await.unwrap_err();
        assert!(matches!(err, ConvoyError::Timeout(_)));

        // The dependency started; the dependent never did
        let status = orchestrator.status();
        assert!(status.contains_key("db"));
        assert!(!status.contains_key("app"));

        orchestrator.down().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_passthrough_aborts_before_spawn() {
        let yaml = r#"
services:
  app:
    image: app:latest
    command: ["/bin/sh", "-c", "sleep 30"]
    environment:
      - SECRET_KEY
"#;

        let (_temp, mut orchestrator) = orchestrator(yaml);
        let err = orchestrator.up(false).await.unwrap_err();

        match err {
            ConvoyError::MissingEnvironment { variable, service } => {
                assert_eq!(variable, "SECRET_KEY");
                assert_eq!(service, "app");
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(orchestrator.status().is_empty());
    }

    #[tokio::test]
    async fn test_image_only_service_needs_command() {
        let yaml = r#"
services:
  db:
    image: postgres:16
"#;

        let (_temp, mut orchestrator) = orchestrator(yaml);
        let err = orchestrator.up(false).await.unwrap_err();
        assert!(matches!(err, ConvoyError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_replicas_and_scale() {
        let yaml = r#"
services:
  worker:
    image: worker:latest
    command: ["/bin/sh", "-c", "sleep 30"]
    deploy:
      replicas: 2
"#;

        let (_temp, mut orchestrator) = orchestrator(yaml);
        orchestrator.up(false).await.unwrap();
        assert_eq!(orchestrator.status()["worker"].instance_ids.len(), 2);

        orchestrator.scale("worker", 3).await.unwrap();
        assert_eq!(orchestrator.status()["worker"].instance_ids.len(), 3);

        orchestrator.scale("worker", 1).await.unwrap();
        assert_eq!(orchestrator.status()["worker"].instance_ids.len(), 1);

        orchestrator.down().await.unwrap();
    }

    #[tokio::test]
    async fn test_build_resolves_image_command() {
        let temp = tempdir().unwrap();
        std::fs::write(
            temp.path().join("Dockerfile"),
            "FROM alpine\nCMD [\"/bin/sh\", \"-c\", \"sleep 30\"]\n",
        )
        .unwrap();

        let yaml = r#"
services:
  app:
    build: .
"#;
        let config = StackParser::parse_str(yaml).unwrap();
        let supervisor = Arc::new(ServiceSupervisor::new(temp.path().join("data")).unwrap());
        let mut orchestrator = StackOrchestrator::new(
            "test",
            config,
            supervisor,
            temp.path().to_path_buf(),
        )
        .with_host_env(HashMap::new());

        orchestrator.up(true).await.unwrap();
        assert!(orchestrator.image_plans().contains_key("app"));
        assert_eq!(orchestrator.status()["app"].state, ServiceStatus::Running);

        orchestrator.down().await.unwrap();
    }
}
