//! Service process execution
//!
//! Each service instance is one supervised host process. Its resolved
//! environment is injected at spawn time and stdout/stderr are appended
//! to a per-instance log file.

use super::config::{ProcessConfig, ServiceStatus};
use crate::error::{ConvoyError, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};

/// Exit code recorded when a process is killed before exiting
const KILLED_EXIT_CODE: i32 = 137;

/// A supervised service instance
#[derive(Debug)]
pub struct ServiceProcess {
    /// Instance configuration
    pub config: ProcessConfig,
    /// Log file for stdout and stderr
    log_path: PathBuf,
    /// Running child, when started
    child: Option<Child>,
}

impl ServiceProcess {
    /// Create a new instance with its log file under `log_dir`
    pub fn new(config: ProcessConfig, log_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(log_dir)?;
        let log_path = log_dir.join(format!("{}.log", config.id));

        Ok(Self {
            config,
            log_path,
            child: None,
        })
    }

    /// Instance ID
    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Instance name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Log file path
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Whether the instance is running
    pub fn is_running(&self) -> bool {
        self.config.status == ServiceStatus::Running
    }

    /// Spawn the instance process
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(ConvoyError::ServiceAlreadyRunning(self.config.name.clone()));
        }

        let Some((program, args)) = self.config.command.split_first() else {
            return Err(ConvoyError::InvalidConfig(format!(
                "Service instance '{}' has no command",
                self.config.name
            )));
        };

        let stdout_log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        let stderr_log = stdout_log.try_clone()?;

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_log))
            .stderr(Stdio::from(stderr_log))
            .kill_on_drop(true);

        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|e| {
            ConvoyError::Service(format!(
                "Failed to spawn '{}' for instance '{}': {}",
                program, self.config.name, e
            ))
        })?;

        self.config.pid = child.id();
        self.config.status = ServiceStatus::Running;
        self.config.started_at = Some(Utc::now());
        self.child = Some(child);

        Ok(())
    }

    /// Record the exit of a process that finished on its own
    pub fn reap(&mut self) -> Result<()> {
        if let Some(child) = &mut self.child {
            if let Some(status) = child.try_wait()? {
                self.config.status = ServiceStatus::Exited;
                self.config.finished_at = Some(Utc::now());
                self.config.exit_code = Some(status.code().unwrap_or(KILLED_EXIT_CODE));
                self.config.pid = None;
                self.child = None;
            }
        }
        Ok(())
    }

    /// Stop the instance process and record its exit code
    pub async fn stop(&mut self) -> Result<()> {
        self.reap()?;

        if self.config.status != ServiceStatus::Running {
            return Err(ConvoyError::ServiceNotRunning(self.config.name.clone()));
        }

        if let Some(mut child) = self.child.take() {
            child.start_kill().ok();
            let status = child.wait().await?;
            self.config.exit_code = Some(status.code().unwrap_or(KILLED_EXIT_CODE));
        }

        self.config.status = ServiceStatus::Stopped;
        self.config.finished_at = Some(Utc::now());
        self.config.pid = None;

        Ok(())
    }

    /// Remove the instance's log file
    pub fn remove(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(ConvoyError::Service(format!(
                "Cannot remove running instance '{}'",
                self.config.name
            )));
        }

        if self.log_path.exists() {
            std::fs::remove_file(&self.log_path)?;
        }

        Ok(())
    }

    /// Read the instance log, optionally only the last `tail` lines
    pub fn logs(&self, tail: Option<usize>) -> Result<Vec<String>> {
        if !self.log_path.exists() {
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&self.log_path)?;
        let lines: Vec<String> = content.lines().map(|l| l.to_string()).collect();

        match tail {
            Some(n) if n < lines.len() => Ok(lines[lines.len() - n..].to_vec()),
            _ => Ok(lines),
        }
    }
}
