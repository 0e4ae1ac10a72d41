mod config;
mod dispatch_cmd;
mod plan_cmd;
mod project_cmd;
mod runtime;
mod serve_cmd;
mod task_cmd;
mod worker_cmd;

use anyhow::Result;
use clap::{Parser, Subcommand};
use orc_store::config::StoreConfig;
use orc_store::document::Store;

#[derive(Parser)]
#[command(name = "orc", about = "Orchestrates a fixed pool of CLI coding agents across two engines")]
struct Cli {
    /// Path to the config file (overrides the default XDG location).
    #[arg(long, global = true)]
    config: Option<String>,

    /// Data root override (takes precedence over config file and env).
    #[arg(long, global = true)]
    data_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a config file with a freshly generated secret.
    Init {
        #[arg(long)]
        force: bool,
    },
    /// Project registry administration.
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },
    /// Create tasks from a TOML plan file, or drive plan-mode approval.
    Plan {
        #[command(subcommand)]
        command: PlanCommands,
    },
    /// Task inspection and manual recovery.
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Worker pool inspection.
    Worker {
        #[command(subcommand)]
        command: WorkerCommands,
    },
    /// Run a single dispatch cycle and exit.
    Dispatch {
        #[arg(long)]
        once: bool,
    },
    /// Start the persistent process: dispatch and health loops.
    Serve,
}

#[derive(Subcommand)]
enum ProjectCommands {
    Create {
        name: String,
        #[arg(long, default_value = "")]
        description: String,
        repo_path: String,
    },
    List,
    Show {
        project_id: String,
    },
    SetStatus {
        project_id: String,
        status: String,
    },
}

#[derive(Subcommand)]
enum PlanCommands {
    Create {
        project_id: String,
        /// Materialize a batch of tasks from a validated TOML plan file.
        #[arg(long)]
        from_toml: Option<String>,
        /// Mint a single plan-mode task instead (ignored with --from-toml).
        #[arg(long)]
        title: Option<String>,
        #[arg(long, default_value = "")]
        description: String,
    },
    Show {
        project_id: String,
        task_id: String,
    },
    Approve {
        project_id: String,
        task_id: String,
    },
    Reject {
        project_id: String,
        task_id: String,
        #[arg(long, default_value = "")]
        feedback: String,
    },
}

#[derive(Subcommand)]
enum TaskCommands {
    List { project_id: String },
    Show { project_id: String, task_id: String },
    Retry { project_id: String, task_id: String },
    Cancel { project_id: String, task_id: String },
}

#[derive(Subcommand)]
enum WorkerCommands {
    List,
    Show { worker_id: String },
}

fn workers_toml_path(config_path: &std::path::Path) -> std::path::PathBuf {
    config_path
        .parent()
        .unwrap_or_else(|| std::path::Path::new("."))
        .join("workers.toml")
}

fn store_from(cli: &Cli) -> Result<Store> {
    let kernel_config = config::resolve(cli.config.as_deref(), cli.data_dir.as_deref())?;
    Ok(Store::new(StoreConfig::new(kernel_config.data_root)))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Init { force } => {
            let path = config::config_path(cli.config.as_deref());
            config::init(&path, cli.data_dir.as_deref(), *force)?;
        }
        Commands::Project { command } => {
            let store = store_from(&cli)?;
            match command {
                ProjectCommands::Create { name, description, repo_path } => {
                    project_cmd::create(&store, name, description, std::path::Path::new(repo_path))?;
                }
                ProjectCommands::List => project_cmd::list(&store)?,
                ProjectCommands::Show { project_id } => project_cmd::show(&store, project_id)?,
                ProjectCommands::SetStatus { project_id, status } => {
                    project_cmd::set_status(&store, project_id, status)?;
                }
            }
        }
        Commands::Plan { command } => {
            let store = store_from(&cli)?;
            match command {
                PlanCommands::Create { project_id, from_toml, title, description } => {
                    if let Some(file) = from_toml {
                        plan_cmd::create_from_toml(&store, project_id, std::path::Path::new(file))?;
                    } else {
                        let title = title
                            .as_deref()
                            .ok_or_else(|| anyhow::anyhow!("either --from-toml or --title is required"))?;
                        plan_cmd::create(&store, project_id, title, description)?;
                    }
                }
                PlanCommands::Show { project_id, task_id } => plan_cmd::show(&store, project_id, task_id)?,
                PlanCommands::Approve { project_id, task_id } => plan_cmd::approve(&store, project_id, task_id)?,
                PlanCommands::Reject { project_id, task_id, feedback } => {
                    plan_cmd::reject(&store, project_id, task_id, feedback)?;
                }
            }
        }
        Commands::Task { command } => {
            let store = store_from(&cli)?;
            match command {
                TaskCommands::List { project_id } => task_cmd::list(&store, project_id)?,
                TaskCommands::Show { project_id, task_id } => task_cmd::show(&store, project_id, task_id)?,
                TaskCommands::Retry { project_id, task_id } => task_cmd::retry(&store, project_id, task_id)?,
                TaskCommands::Cancel { project_id, task_id } => task_cmd::cancel(&store, project_id, task_id)?,
            }
        }
        Commands::Worker { command } => {
            let config_path = config::config_path(cli.config.as_deref());
            let workers_toml = workers_toml_path(&config_path);
            match command {
                WorkerCommands::List => worker_cmd::list(&workers_toml)?,
                WorkerCommands::Show { worker_id } => worker_cmd::show(&workers_toml, worker_id)?,
            }
        }
        Commands::Dispatch { once } => {
            if !*once {
                anyhow::bail!("`orc dispatch` requires --once; for continuous dispatch run `orc serve`");
            }
            let kernel_config = config::resolve(cli.config.as_deref(), cli.data_dir.as_deref())?;
            let config_path = config::config_path(cli.config.as_deref());
            let workers_toml = workers_toml_path(&config_path);
            let kernel = runtime::build_kernel(kernel_config, &workers_toml)?;
            dispatch_cmd::run_once(&kernel).await?;
        }
        Commands::Serve => {
            let kernel_config = config::resolve(cli.config.as_deref(), cli.data_dir.as_deref())?;
            let config_path = config::config_path(cli.config.as_deref());
            let workers_toml = workers_toml_path(&config_path);
            let kernel = runtime::build_kernel(kernel_config, &workers_toml)?;
            serve_cmd::run(kernel).await?;
        }
    }

    Ok(())
}
