//! scompose - orchestration for groups of Singularity instances
//!
//! This is the main CLI entry point for scompose.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use scompose::compose::{
    ComposeParser, DependencyPolicy, ProjectOrchestrator, ProjectSettings, SchemaValidator,
    UpOptions,
};
use scompose::network::DEFAULT_BRIDGE;
use scompose::ComposeError;
use scompose::runtime::SingularityCli;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// scompose - compose for Singularity instances
#[derive(Parser)]
#[command(name = "scompose")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "Orchestrate groups of Singularity instances", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Log level
    #[arg(
        long,
        global = true,
        default_value = "info",
        value_parser = ["debug", "info", "warn", "error"]
    )]
    log_level: String,

    /// Compose file, may be given more than once
    #[arg(short, long = "file", global = true)]
    files: Vec<PathBuf>,

    /// Project name
    #[arg(short, long, global = true)]
    project_name: Option<String>,

    /// Project working directory
    #[arg(long, global = true)]
    project_directory: Option<PathBuf>,

    /// File with variables for interpolation
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// Container runtime program
    #[arg(long, global = true, env = "SCOMPOSE_RUNTIME", default_value = "singularity")]
    runtime: String,

    #[command(subcommand)]
    command: Commands,
}

/// Options for commands that start instances
#[derive(Args)]
struct UpArgs {
    /// Instance names
    names: Vec<String>,
    /// Start instances without a writable tmpfs
    #[arg(long = "read_only")]
    read_only: bool,
    /// Do not bind the generated hosts and resolv.conf files
    #[arg(long)]
    no_resolv: bool,
    /// Bridge network addresses are allocated from
    #[arg(long, default_value = DEFAULT_BRIDGE)]
    bridge: String,
    /// Dependencies outside the requested instances: require, include or ignore
    #[arg(long, default_value_t = DependencyPolicy::Require)]
    deps: DependencyPolicy,
}

impl UpArgs {
    fn options(&self) -> UpOptions {
        UpOptions {
            writable_tmpfs: !self.read_only,
            bridge: self.bridge.clone(),
            no_resolv: self.no_resolv,
            dependencies: self.deps,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Build or pull instance images
    Build {
        /// Instance names
        names: Vec<String>,
    },

    /// Create instances from existing images
    Create(UpArgs),

    /// Build missing images and create instances
    Up(UpArgs),

    /// Stop and recreate instances
    Restart {
        #[command(flatten)]
        up: UpArgs,
        /// Seconds before a stopping instance is killed
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Stop instances
    Down {
        /// Instance names
        names: Vec<String>,
        /// Seconds before an instance is killed
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Stop instances
    Stop {
        /// Instance names
        names: Vec<String>,
        /// Seconds before an instance is killed
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Execute a command in a running instance
    Exec {
        /// Instance name
        name: String,
        /// Command to execute
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },

    /// Run the runscript of a running instance
    Run {
        /// Instance name
        name: String,
    },

    /// Open a shell in a running instance
    Shell {
        /// Instance name
        name: String,
    },

    /// Show instance logs
    Logs {
        /// Instance names
        names: Vec<String>,
        /// Number of lines to show
        #[arg(long)]
        tail: Option<usize>,
        /// Truncate the logs instead of showing them
        #[arg(long)]
        clear: bool,
    },

    /// List running instances of the project
    Ps,

    /// Print the merged configuration as JSON
    Config,

    /// Validate compose files
    Check {
        /// Print the merged configuration
        #[arg(long)]
        preview: bool,
    },

    /// Print the version
    Version,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // RUST_LOG wins over the command line
    let level = if cli.debug { "debug" } else { cli.log_level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tokio::select! {
        result = run(cli) => match result {
            Ok(code) => code,
            Err(e) => {
                tracing::error!("{:#}", e);
                if e.chain().any(|cause| {
                    cause
                        .downcast_ref::<ComposeError>()
                        .is_some_and(ComposeError::is_config_error)
                }) {
                    tracing::info!("Run `scompose check` to validate the compose file");
                }
                ExitCode::FAILURE
            }
        },
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, instances already created are left running");
            ExitCode::from(130)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let settings = ProjectSettings {
        files: cli.files,
        project_name: cli.project_name,
        project_directory: cli.project_directory,
        env_file: cli.env_file,
    };

    match cli.command {
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Check { preview } => return check(&settings, preview),
        _ => {}
    }

    let config = settings
        .load_config()
        .context("Failed to load compose configuration")?;
    let working_dir = settings.working_dir()?;
    let name = settings.project_name()?;
    let runtime = Arc::new(SingularityCli::new(cli.runtime));

    let mut project = ProjectOrchestrator::new(&name, config, &working_dir, runtime)?;
    tracing::debug!("Project {} in {}", project.name(), project.working_dir().display());

    match cli.command {
        Commands::Build { names } => {
            project.build(&names).await?;
        }

        Commands::Create(args) => {
            project.create(&args.names, &args.options()).await?;
        }

        Commands::Up(args) => {
            project.up(&args.names, &args.options()).await?;
        }

        Commands::Restart { up, timeout } => {
            project
                .restart(&up.names, timeout.map(Duration::from_secs), &up.options())
                .await?;
        }

        Commands::Down { names, timeout } | Commands::Stop { names, timeout } => {
            project.down(&names, timeout.map(Duration::from_secs)).await?;
        }

        Commands::Exec { name, command } => {
            project.execute(&name, &command).await?;
        }

        Commands::Run { name } => {
            project.run(&name).await?;
        }

        Commands::Shell { name } => {
            let status = project.shell(&name).await?;
            return Ok(ExitCode::from(u8::try_from(status).unwrap_or(1)));
        }

        Commands::Logs { names, tail, clear } => {
            if clear {
                project.clear_logs(&names).await?;
            } else {
                for (instance, streams) in project.logs(&names, tail).await? {
                    for (stream, content) in streams {
                        println!("{} {}", instance, stream);
                        println!("{}", content);
                        println!();
                    }
                }
            }
        }

        Commands::Ps => {
            println!("{:<16} {:<8} {:<16} {:<30}", "NAME", "PID", "IP", "IMAGE");
            for info in project.ps().await? {
                let image = info
                    .image
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                println!(
                    "{:<16} {:<8} {:<16} {:<30}",
                    info.name,
                    info.pid.map(|p| p.to_string()).unwrap_or_default(),
                    info.ip.map(|ip| ip.to_string()).unwrap_or_default(),
                    image
                );
            }
        }

        Commands::Config => {
            println!("{}", project.view_config()?);
        }

        Commands::Version | Commands::Check { .. } => {}
    }

    Ok(ExitCode::SUCCESS)
}

/// Validate every compose file against the schema
fn check(settings: &ProjectSettings, preview: bool) -> anyhow::Result<ExitCode> {
    let mut valid = true;

    for file in settings.files() {
        let document = ComposeParser::read_file(&file)?;
        let violations = SchemaValidator::validate(&document);

        if violations.is_empty() {
            tracing::info!("{} is valid.", display_path(&file));
        } else {
            valid = false;
            for violation in &violations {
                tracing::error!("{}: {}", display_path(&file), violation);
            }
            tracing::error!("{} is not valid.", display_path(&file));
        }
    }

    if preview {
        let merged = settings.load_document()?;
        print!(
            "{}",
            serde_yaml::to_string(&merged).context("Failed to render merged configuration")?
        );
    }

    Ok(if valid { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn display_path(path: &Path) -> String {
    path.display().to_string()
}
