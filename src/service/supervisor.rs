//! Service supervision
//!
//! The supervisor owns every running service instance, indexed by ID.

use super::config::{ProcessConfig, ServiceStatus};
use super::process::ServiceProcess;
use crate::error::{ConvoyError, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;

/// Supervisor for service instance lifecycle
pub struct ServiceSupervisor {
    /// All instances indexed by ID
    services: RwLock<HashMap<String, ServiceProcess>>,
    /// Directory for instance log files
    log_dir: PathBuf,
}

impl ServiceSupervisor {
    /// Create a new supervisor storing logs under `base_path`
    pub fn new(base_path: PathBuf) -> Result<Self> {
        let log_dir = base_path.join("logs");
        std::fs::create_dir_all(&log_dir)?;

        Ok(Self {
            services: RwLock::new(HashMap::new()),
            log_dir,
        })
    }

    /// Create a new instance
    pub async fn create(&self, config: ProcessConfig) -> Result<String> {
        let mut services = self.services.write().await;

        if services.values().any(|p| p.name() == config.name) {
            return Err(ConvoyError::ServiceExists(config.name));
        }

        let process = ServiceProcess::new(config, &self.log_dir)?;
        let id = process.id().to_string();
        services.insert(id.clone(), process);

        Ok(id)
    }

    /// Start an instance
    pub async fn start(&self, id: &str) -> Result<()> {
        let mut services = self.services.write().await;
        let process = services
            .get_mut(id)
            .ok_or_else(|| ConvoyError::ServiceNotFound(id.to_string()))?;

        process.start()
    }

    /// Stop an instance
    pub async fn stop(&self, id: &str) -> Result<()> {
        let mut services = self.services.write().await;
        let process = services
            .get_mut(id)
            .ok_or_else(|| ConvoyError::ServiceNotFound(id.to_string()))?;

        process.stop().await
    }

    /// Remove an instance, stopping it first when `force` is set
    pub async fn remove(&self, id: &str, force: bool) -> Result<()> {
        let mut services = self.services.write().await;
        let process = services
            .get_mut(id)
            .ok_or_else(|| ConvoyError::ServiceNotFound(id.to_string()))?;

        process.reap()?;
        if process.is_running() {
            if !force {
                return Err(ConvoyError::Service(format!(
                    "Cannot remove running instance '{}'",
                    process.name()
                )));
            }
            process.stop().await?;
        }

        process.remove()?;
        services.remove(id);

        Ok(())
    }

    /// Get an instance's configuration by ID
    pub async fn get(&self, id: &str) -> Result<ProcessConfig> {
        let mut services = self.services.write().await;
        let process = services
            .get_mut(id)
            .ok_or_else(|| ConvoyError::ServiceNotFound(id.to_string()))?;

        process.reap()?;
        Ok(process.config.clone())
    }

    /// List instances, running only unless `all` is set
    pub async fn list(&self, all: bool) -> Result<Vec<ProcessConfig>> {
        let mut services = self.services.write().await;

        for process in services.values_mut() {
            process.reap()?;
        }

        let mut result: Vec<ProcessConfig> = services
            .values()
            .filter(|p| all || p.config.status == ServiceStatus::Running)
            .map(|p| p.config.clone())
            .collect();
        result.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(result)
    }

    /// Find an instance by name
    pub async fn find_by_name(&self, name: &str) -> Result<Option<ProcessConfig>> {
        let services = self.services.read().await;

        Ok(services
            .values()
            .find(|p| p.name() == name)
            .map(|p| p.config.clone()))
    }

    /// Read an instance's log
    pub async fn logs(&self, id: &str, tail: Option<usize>) -> Result<Vec<String>> {
        let services = self.services.read().await;
        let process = services
            .get(id)
            .ok_or_else(|| ConvoyError::ServiceNotFound(id.to_string()))?;

        process.logs(tail)
    }

    /// Number of instances
    pub async fn count(&self) -> usize {
        self.services.read().await.len()
    }

    /// Number of running instances
    pub async fn running_count(&self) -> usize {
        self.services
            .read()
            .await
            .values()
            .filter(|p| p.config.status == ServiceStatus::Running)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor() -> (tempfile::TempDir, ServiceSupervisor) {
        let temp = tempfile::tempdir().unwrap();
        let supervisor = ServiceSupervisor::new(temp.path().to_path_buf()).unwrap();
        (temp, supervisor)
    }

    fn shell(name: &str, command: &str) -> ProcessConfig {
        ProcessConfig::new(
            name,
            vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                command.to_string(),
            ],
        )
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let (_temp, supervisor) = supervisor();

        let id = supervisor.create(shell("app-1", "sleep 30")).await.unwrap();
        assert_eq!(supervisor.count().await, 1);
        assert_eq!(supervisor.running_count().await, 0);

        supervisor.start(&id).await.unwrap();
        assert_eq!(supervisor.running_count().await, 1);
        assert_eq!(
            supervisor.get(&id).await.unwrap().status,
            ServiceStatus::Running
        );

        supervisor.stop(&id).await.unwrap();
        assert_eq!(supervisor.running_count().await, 0);

        supervisor.remove(&id, false).await.unwrap();
        assert_eq!(supervisor.count().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let (_temp, supervisor) = supervisor();

        supervisor.create(shell("app-1", "true")).await.unwrap();
        let err = supervisor.create(shell("app-1", "true")).await.unwrap_err();
        assert!(matches!(err, ConvoyError::ServiceExists(_)));
    }

    #[tokio::test]
    async fn test_unknown_id() {
        let (_temp, supervisor) = supervisor();
        assert!(matches!(
            supervisor.start("missing").await,
            Err(ConvoyError::ServiceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_running_requires_force() {
        let (_temp, supervisor) = supervisor();

        let id = supervisor.create(shell("app-1", "sleep 30")).await.unwrap();
        supervisor.start(&id).await.unwrap();

        assert!(supervisor.remove(&id, false).await.is_err());
        supervisor.remove(&id, true).await.unwrap();
        assert_eq!(supervisor.count().await, 0);
    }

    #[tokio::test]
    async fn test_find_by_name() {
        let (_temp, supervisor) = supervisor();

        supervisor.create(shell("db-1", "true")).await.unwrap();
        assert!(supervisor.find_by_name("db-1").await.unwrap().is_some());
        assert!(supervisor.find_by_name("web-1").await.unwrap().is_none());
    }
}
