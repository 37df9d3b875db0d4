//! Convoy - a lightweight service-stack composer
//!
//! This is the main CLI entry point for Convoy.

use clap::{Parser, Subcommand};
use convoy::audit::audit_stack;
use convoy::compose::env::host_environment;
use convoy::compose::{StackConfig, StackOrchestrator, StackParser};
use convoy::error::{ConvoyError, Result};
use convoy::image::spec::BuildContext;
use convoy::service::ServiceSupervisor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Convoy - service-stack composer
#[derive(Parser)]
#[command(name = "convoy")]
#[command(version)]
#[command(about = "A lightweight service-stack composer with readiness gating and deployment audits", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the stack
    Up {
        /// Stack file
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Return after starting instead of holding the stack in the foreground
        #[arg(short, long)]
        detach: bool,
        /// Resolve image plans before starting
        #[arg(long)]
        build: bool,
        /// Overall startup deadline in seconds
        #[arg(long, default_value = "120")]
        timeout: u64,
    },

    /// Stop the stack, reverse start order
    Down {
        /// Stack file
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// List service instances
    Ps {
        /// Show all instances, not only running ones
        #[arg(short, long)]
        all: bool,
        /// Only show instance IDs
        #[arg(short, long)]
        quiet: bool,
    },

    /// Show service instance logs
    Logs {
        /// Instance name
        service: String,
        /// Number of lines to show
        #[arg(short = 'n', long)]
        tail: Option<usize>,
    },

    /// Resolve an image plan from a build file
    Build {
        /// Build context path
        #[arg(default_value = ".")]
        path: PathBuf,
        /// Build file path
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Name and optionally tag
        #[arg(short, long)]
        tag: Option<String>,
        /// Target build stage
        #[arg(long)]
        target: Option<String>,
    },

    /// Audit the stack against its image plans
    Check {
        /// Stack file
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Validate the stack file and print its normalized form
    Config {
        /// Stack file
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Get base path for convoy data
    let base_path = dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/var/lib"))
        .join("convoy");

    let supervisor = Arc::new(ServiceSupervisor::new(base_path)?);

    match cli.command {
        Commands::Up {
            file,
            detach,
            build,
            timeout,
        } => {
            let (stack_file, config) = load_stack(file)?;
            let working_dir = stack_dir(&stack_file);
            let project_name = project_name(&config, &working_dir);

            for warning in StackParser::validate(&config)? {
                eprintln!("Warning: {}", warning);
            }

            let mut orchestrator =
                StackOrchestrator::new(&project_name, config, supervisor.clone(), working_dir);

            let deadline = Duration::from_secs(timeout);
            let started = tokio::time::timeout(deadline, orchestrator.up(build)).await;
            match started {
                Ok(result) => result?,
                Err(_) => {
                    orchestrator.down().await?;
                    return Err(ConvoyError::Timeout(format!(
                        "Stack '{}' did not start within {}s",
                        project_name, timeout
                    )));
                }
            }

            println!("Started project {}", project_name);

            if !detach {
                tokio::signal::ctrl_c().await?;
                orchestrator.down().await?;
                println!("Stopped project {}", project_name);
            }
        }

        Commands::Down { file } => {
            let (stack_file, config) = load_stack(file)?;
            let working_dir = stack_dir(&stack_file);
            let project_name = project_name(&config, &working_dir);

            let mut orchestrator =
                StackOrchestrator::new(&project_name, config, supervisor.clone(), working_dir);
            orchestrator.down().await?;
            println!("Stopped project {}", project_name);
        }

        Commands::Ps { all, quiet } => {
            let instances = supervisor.list(all).await?;

            if quiet {
                for instance in instances {
                    println!("{}", instance.id);
                }
            } else {
                println!(
                    "{:<14} {:<24} {:<25} {:<10} {:<20}",
                    "INSTANCE ID", "NAME", "IMAGE", "STATUS", "CREATED"
                );
                for instance in instances {
                    println!(
                        "{:<14} {:<24} {:<25} {:<10} {:<20}",
                        instance.id,
                        instance.name,
                        instance.image.as_deref().unwrap_or("<none>"),
                        instance.status.to_string(),
                        instance.created_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
            }
        }

        Commands::Logs { service, tail } => {
            let instance = supervisor
                .find_by_name(&service)
                .await?
                .ok_or_else(|| ConvoyError::ServiceNotFound(service.clone()))?;

            for line in supervisor.logs(&instance.id, tail).await? {
                println!("{}", line);
            }
        }

        Commands::Build {
            path,
            file,
            tag,
            target,
        } => {
            let mut context = BuildContext::new(path);

            if let Some(f) = file {
                context = context.file(f);
            }
            if let Some(t) = &tag {
                context = context.tag(t);
            }
            if let Some(t) = &target {
                context = context.target(t);
            }

            let plan = context.plan()?;

            println!("Successfully planned {}", plan.id);
            println!(
                "Base image: {}{}",
                plan.base_image,
                plan.base_tag
                    .as_deref()
                    .map(|t| format!(":{}", t))
                    .unwrap_or_default()
            );
            if !plan.exposed_ports.is_empty() {
                let ports: Vec<String> = plan
                    .exposed_ports
                    .iter()
                    .map(|p| format!("{}/{}", p.port, p.protocol))
                    .collect();
                println!("Exposed ports: {}", ports.join(", "));
            }
            if !plan.env.is_empty() {
                println!(
                    "Configuration surface: {}",
                    plan.configuration_surface().join(", ")
                );
            }
            if !plan.startup_command().is_empty() {
                println!("Startup command: {}", plan.startup_command().join(" "));
            }
        }

        Commands::Check { file } => {
            let (stack_file, config) = load_stack(file)?;
            let working_dir = stack_dir(&stack_file);
            let project_name = project_name(&config, &working_dir);

            for warning in StackParser::validate(&config)? {
                eprintln!("Warning: {}", warning);
            }

            let mut orchestrator = StackOrchestrator::new(
                &project_name,
                config.clone(),
                supervisor.clone(),
                working_dir,
            );
            orchestrator.build_services()?;

            let report = audit_stack(&config, orchestrator.image_plans())?;

            for finding in &report.findings {
                let scope = finding.service.as_deref().unwrap_or("-");
                println!(
                    "{}: [{}] {}: {}",
                    finding.severity, finding.code, scope, finding.message
                );
            }
            println!(
                "{} error(s), {} warning(s)",
                report.error_count(),
                report.warning_count()
            );

            if report.has_errors() {
                std::process::exit(1);
            }
        }

        Commands::Config { file } => {
            let (_, config) = load_stack(file)?;

            for warning in StackParser::validate(&config)? {
                eprintln!("Warning: {}", warning);
            }

            let normalized = serde_yaml::to_string(&config)
                .map_err(|e| ConvoyError::Yaml(e.to_string()))?;
            println!("{}", normalized);
        }
    }

    Ok(())
}

/// Locate and parse the stack file, interpolating host variables
fn load_stack(file: Option<PathBuf>) -> Result<(PathBuf, StackConfig)> {
    let working_dir = std::env::current_dir()?;
    let stack_file = match file {
        Some(path) => path,
        None => StackParser::find_stack_file(&working_dir).ok_or_else(|| {
            ConvoyError::StackParse(format!(
                "No stack file found in {}",
                working_dir.display()
            ))
        })?,
    };

    let mut config = StackParser::parse_file(&stack_file)?;
    StackParser::interpolate(&mut config, &host_environment());

    Ok((stack_file, config))
}

/// Directory the stack file lives in, the base for build contexts
fn stack_dir(stack_file: &Path) -> PathBuf {
    stack_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Project name: stack file's `name` or its directory name
fn project_name(config: &StackConfig, working_dir: &Path) -> String {
    config.name.clone().unwrap_or_else(|| {
        working_dir
            .canonicalize()
            .ok()
            .as_deref()
            .unwrap_or(working_dir)
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("default")
            .to_string()
    })
}
