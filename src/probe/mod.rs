//! Readiness probes
//!
//! A start-order dependency alone only guarantees that the dependency's
//! process was spawned first, not that it is accepting connections. Probes
//! close that gap: before a dependent service starts, its dependencies are
//! probed until they answer or the retry budget runs out.

use crate::compose::config::{HealthcheckTest, ServiceConfig};
use crate::error::{ConvoyError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RETRIES: u32 = 3;

/// What a probe attempt does
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProbeKind {
    /// TCP connect to host:port
    Tcp { host: String, port: u16 },
    /// Spawn a command; exit status 0 means ready
    Command { argv: Vec<String> },
}

/// Readiness probe specification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSpec {
    /// Probe kind
    pub kind: ProbeKind,
    /// Upper bound on the delay between attempts
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,
    /// Per-attempt timeout
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Attempt budget
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Grace period before the first attempt
    #[serde(default, with = "humantime_serde")]
    pub start_period: Duration,
}

const fn default_interval() -> Duration {
    DEFAULT_INTERVAL
}

const fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

const fn default_retries() -> u32 {
    DEFAULT_RETRIES
}

/// Exponential backoff between probe attempts
#[derive(Debug, Clone)]
pub struct Backoff {
    /// First delay
    pub initial: Duration,
    /// Delay cap
    pub max: Duration,
    /// Growth factor per attempt
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl Backoff {
    /// Delay before the next attempt, for a 1-based attempt number
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        Duration::from_secs_f64(secs).min(self.max)
    }
}

impl ProbeSpec {
    /// TCP probe with default timings
    pub fn tcp(host: &str, port: u16) -> Self {
        Self {
            kind: ProbeKind::Tcp {
                host: host.to_string(),
                port,
            },
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
            start_period: Duration::ZERO,
        }
    }

    /// Command probe with default timings
    pub fn command(argv: Vec<String>) -> Self {
        Self {
            kind: ProbeKind::Command { argv },
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
            start_period: Duration::ZERO,
        }
    }

    /// Derive a probe for a service
    ///
    /// The service's healthcheck wins when declared; otherwise its first
    /// published TCP port is probed. `None` means the service offers no
    /// readiness signal and dependents fall back to start order.
    pub fn derive(service: &ServiceConfig) -> Result<Option<Self>> {
        if let Some(healthcheck) = &service.healthcheck {
            if healthcheck.disable == Some(true) {
                return Ok(None);
            }
            if let Some(test) = &healthcheck.test {
                let argv = match test {
                    HealthcheckTest::Command(command) => shell_argv(command),
                    HealthcheckTest::Array(parts) => match parts.split_first() {
                        Some((form, rest)) if form == "CMD" => rest.to_vec(),
                        Some((form, rest)) if form == "CMD-SHELL" => shell_argv(&rest.join(" ")),
                        Some((form, _)) if form == "NONE" => return Ok(None),
                        _ => {
                            return Err(ConvoyError::Probe(
                                "Healthcheck test must start with CMD, CMD-SHELL or NONE"
                                    .to_string(),
                            ))
                        }
                    },
                };

                let mut probe = Self::command(argv);
                if let Some(interval) = healthcheck.interval {
                    probe.interval = interval;
                }
                if let Some(timeout) = healthcheck.timeout {
                    probe.timeout = timeout;
                }
                if let Some(retries) = healthcheck.retries {
                    probe.retries = retries;
                }
                if let Some(start_period) = healthcheck.start_period {
                    probe.start_period = start_period;
                }
                return Ok(Some(probe));
            }
        }

        for port in service.published_ports()? {
            if port.protocol != "tcp" {
                continue;
            }
            // Host-process model: probe the published side of the mapping
            let host = port.host_ip.clone().unwrap_or_else(|| "127.0.0.1".to_string());
            let target = port.host_port.unwrap_or(port.container_port);
            return Ok(Some(Self::tcp(&host, target)));
        }

        Ok(None)
    }

    /// One probe attempt, bounded by the per-attempt timeout
    pub async fn attempt(&self) -> bool {
        match &self.kind {
            ProbeKind::Tcp { host, port } => {
                matches!(
                    tokio::time::timeout(self.timeout, TcpStream::connect((host.as_str(), *port)))
                        .await,
                    Ok(Ok(_))
                )
            }
            ProbeKind::Command { argv } => {
                let Some((program, args)) = argv.split_first() else {
                    return false;
                };
                let status = Command::new(program)
                    .args(args)
                    .stdout(std::process::Stdio::null())
                    .stderr(std::process::Stdio::null())
                    .kill_on_drop(true)
                    .status();
                matches!(tokio::time::timeout(self.timeout, status).await, Ok(Ok(s)) if s.success())
            }
        }
    }

    /// Retry until the probe passes or the attempt budget is spent
    ///
    /// Honors the start period, then backs off exponentially between
    /// attempts, capped by the probe interval.
    pub async fn wait_ready(&self, service_name: &str) -> Result<()> {
        if !self.start_period.is_zero() {
            tokio::time::sleep(self.start_period).await;
        }

        let backoff = Backoff::default();
        let attempts = self.retries.max(1);

        for attempt in 1..=attempts {
            if self.attempt().await {
                tracing::debug!(
                    "Service '{}' ready after {} attempt(s)",
                    service_name,
                    attempt
                );
                return Ok(());
            }

            if attempt < attempts {
                let delay = backoff.delay_for_attempt(attempt).min(self.interval);
                tracing::debug!(
                    "Service '{}' not ready (attempt {}/{}), retrying in {:?}",
                    service_name,
                    attempt,
                    attempts,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }

        Err(ConvoyError::Timeout(format!(
            "Service '{}' failed its readiness probe after {} attempts",
            service_name, attempts
        )))
    }
}

fn shell_argv(command: &str) -> Vec<String> {
    vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        command.to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::parser::StackParser;

    fn service(yaml: &str) -> ServiceConfig {
        let config = StackParser::parse_str(yaml).unwrap();
        config.services.into_values().next().unwrap()
    }

    fn quick(mut probe: ProbeSpec) -> ProbeSpec {
        probe.interval = Duration::from_millis(10);
        probe.timeout = Duration::from_millis(200);
        probe.retries = 2;
        probe
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        let backoff = Backoff {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(5),
            multiplier: 2.0,
        };
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(backoff.delay_for_attempt(4), Duration::from_secs(5));
    }

    #[test]
    fn test_derive_prefers_healthcheck() {
        let svc = service(
            r#"
services:
  db:
    image: postgres:16
    ports:
      - "5432:5432"
    healthcheck:
      test: ["CMD-SHELL", "pg_isready -U app"]
      interval: 5s
      retries: 5
"#,
        );

        let probe = ProbeSpec::derive(&svc).unwrap().unwrap();
        match &probe.kind {
            ProbeKind::Command { argv } => assert_eq!(argv[0], "/bin/sh"),
            other => panic!("unexpected probe kind: {:?}", other),
        }
        assert_eq!(probe.interval, Duration::from_secs(5));
        assert_eq!(probe.retries, 5);
    }

    #[test]
    fn test_derive_falls_back_to_published_port() {
        let svc = service(
            r#"
services:
  db:
    image: postgres:16
    ports:
      - "5433:5432"
"#,
        );

        let probe = ProbeSpec::derive(&svc).unwrap().unwrap();
        assert_eq!(
            probe.kind,
            ProbeKind::Tcp {
                host: "127.0.0.1".to_string(),
                port: 5433
            }
        );
    }

    #[test]
    fn test_derive_none_without_signal() {
        let svc = service("services:\n  worker:\n    image: worker:latest\n");
        assert!(ProbeSpec::derive(&svc).unwrap().is_none());

        let disabled = service(
            r#"
services:
  db:
    image: postgres:16
    ports:
      - "5432:5432"
    healthcheck:
      disable: true
"#,
        );
        assert!(ProbeSpec::derive(&disabled).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tcp_probe_against_listener() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let probe = quick(ProbeSpec::tcp("127.0.0.1", port));
        assert!(probe.attempt().await);
        probe.wait_ready("db").await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_probe_times_out() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let probe = quick(ProbeSpec::tcp("127.0.0.1", port));
        let err = probe.wait_ready("db").await.unwrap_err();
        assert!(err.to_string().contains("db"));
    }

    #[tokio::test]
    async fn test_command_probe() {
        let pass = quick(ProbeSpec::command(vec!["true".to_string()]));
        assert!(pass.attempt().await);

        let fail = quick(ProbeSpec::command(vec!["false".to_string()]));
        assert!(!fail.attempt().await);
    }
}
