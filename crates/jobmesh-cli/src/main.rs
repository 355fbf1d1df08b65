//! jobmesh CLI tool.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod logging;
mod shutdown;

#[derive(Parser)]
#[command(name = "jobmesh")]
#[command(about = "Shared job store with claim coordination", long_about = None)]
struct Cli {
    /// Node configuration file
    #[arg(long, env = "JOBMESH_CONFIG")]
    config: Option<PathBuf>,

    /// PostgreSQL connection URL
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node that claims and executes jobs
    Node {
        /// Identifier written to claimed jobs
        #[arg(long, env = "JOBMESH_INSTANCE_ID")]
        instance_id: Option<String>,
        /// Use a process-local store instead of PostgreSQL
        #[arg(long)]
        in_memory: bool,
    },
    /// Manage job definitions
    Jobs {
        #[command(subcommand)]
        command: JobCommands,
    },
    /// Inspect pipeline runs
    Runs {
        #[command(subcommand)]
        command: RunCommands,
    },
    /// Inspect and dismiss job errors
    Errors {
        #[command(subcommand)]
        command: ErrorCommands,
    },
    /// Validate a job definition or node configuration
    Validate {
        /// Path to the configuration file
        #[arg(default_value = "job.kdl")]
        path: PathBuf,
        /// Treat the file as node configuration
        #[arg(long)]
        node: bool,
    },
}

#[derive(Subcommand)]
enum JobCommands {
    /// Create a job from a KDL definition
    Create {
        /// Path to the job definition
        path: PathBuf,
    },
    /// Show a job
    Show {
        /// Job ID
        id: String,
    },
    /// List jobs in creation order
    List {
        #[arg(long, default_value = "0")]
        offset: i64,
        #[arg(long, default_value = "20")]
        limit: i64,
    },
    /// Delete a job
    Delete {
        /// Job ID
        id: String,
    },
    /// List jobs whose pipeline uses a bridge
    Bridge {
        /// Bridge name
        name: String,
    },
}

#[derive(Subcommand)]
enum RunCommands {
    /// List recent runs
    List {
        /// Only runs of this job
        #[arg(long)]
        job: Option<String>,
        #[arg(long, default_value = "0")]
        offset: i64,
        #[arg(long, default_value = "10")]
        limit: i64,
    },
}

#[derive(Subcommand)]
enum ErrorCommands {
    /// List undismissed errors of a job
    List {
        /// Job ID
        job: String,
    },
    /// Dismiss an error
    Dismiss {
        /// Error ID
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = commands::load_config(cli.config.as_deref())?;
    if let Some(url) = cli.database_url {
        config.database_url = Some(url);
    }

    match cli.command {
        Commands::Node {
            instance_id,
            in_memory,
        } => {
            if instance_id.is_some() {
                config.instance_id = instance_id;
            }
            commands::node::run(config, in_memory).await?;
        }
        Commands::Jobs { command } => {
            logging::init(&config, &[]);
            let store = commands::connect(&config).await?;
            match command {
                JobCommands::Create { path } => commands::jobs::create(&store, &path).await?,
                JobCommands::Show { id } => commands::jobs::show(&store, &id).await?,
                JobCommands::List { offset, limit } => {
                    commands::jobs::list(&store, offset, limit).await?
                }
                JobCommands::Delete { id } => commands::jobs::delete(&store, &id).await?,
                JobCommands::Bridge { name } => commands::jobs::bridge(&store, &name).await?,
            }
        }
        Commands::Runs { command } => {
            logging::init(&config, &[]);
            let store = commands::connect(&config).await?;
            match command {
                RunCommands::List { job, offset, limit } => {
                    commands::runs::list(&store, job.as_deref(), offset, limit).await?
                }
            }
        }
        Commands::Errors { command } => {
            logging::init(&config, &[]);
            let store = commands::connect(&config).await?;
            match command {
                ErrorCommands::List { job } => commands::errors::list(&store, &job).await?,
                ErrorCommands::Dismiss { id } => commands::errors::dismiss(&store, &id).await?,
            }
        }
        Commands::Validate { path, node } => {
            commands::validate(&path, node)?;
        }
    }

    Ok(())
}
