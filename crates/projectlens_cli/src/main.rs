//! ProjectLens CLI - command-line driver for the staged Backlog sync.

mod commands;
mod config;
mod progress;
mod shutdown;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::commands::shared::OutputFormat;

#[derive(Parser)]
#[command(name = "projectlens")]
#[command(version)]
#[command(about = "Staged, rate-limit aware sync of Backlog workspaces")]
#[command(
    long_about = "ProjectLens mirrors Backlog projects and issues into a local database. \
Stage 1 fetches what matters now, Stage 2 keeps it fresh in the background and Stage 3 \
backfills history, all while adapting concurrency to each workspace's API budget."
)]
#[command(after_long_help = r#"EXAMPLES
    Register a workspace tracking two projects:
        $ projectlens workspace add acme --domain acme.backlog.com --api-key KEY -p PROJ -p OPS

    Fetch the important issues now:
        $ projectlens sync stage1

    Keep everything in sync until Ctrl+C:
        $ projectlens run

    Show the most relevant issues:
        $ projectlens issues acme --limit 10

CONFIGURATION
    ProjectLens reads configuration from:
      1. ~/.config/projectlens/config.toml (or $XDG_CONFIG_HOME/projectlens/config.toml)
      2. ./projectlens.toml
      3. Environment variables (PROJECTLENS_* prefix, `__` for nesting)
      4. .env file in current directory

ENVIRONMENT VARIABLES
    PROJECTLENS_DATABASE_URL                 Database connection string (default: ~/.local/state/projectlens/projectlens.db)
    PROJECTLENS_HTTP__REQUEST_TIMEOUT_SECS   HTTP timeout per request (default: 30)
    PROJECTLENS_SYNC__STAGE2_INTERVAL_MS     Background stage 2 interval
    PROJECTLENS_SYNC__MAX_RETRIES            Retries per failed request
"#)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },
    /// Manage Backlog workspaces
    Workspace {
        #[command(subcommand)]
        action: WorkspaceAction,
    },
    /// Run one sync stage and exit
    Sync {
        #[command(subcommand)]
        action: SyncAction,
    },
    /// Stage 1 now, then background stages 2 and 3 until Ctrl+C
    Run {
        /// Workspaces to sync (default: all enabled)
        workspaces: Vec<String>,
    },
    /// Show API rate limit utilization per workspace
    Limits {
        /// Workspaces to check (default: all enabled)
        workspaces: Vec<String>,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },
    /// Show the highest scored stored issues of a workspace
    Issues {
        workspace: String,

        /// Maximum number of issues to show
        #[arg(short, long, default_value_t = 20)]
        limit: u64,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },
    /// Show stored counts and sync watermarks
    Stats {
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },
}

#[derive(Subcommand)]
enum MigrateAction {
    /// Apply all pending migrations
    Up,
    /// Rollback the last migration
    Down,
    /// Show migration status
    Status,
    /// Fresh install - drop all tables and reapply migrations
    Fresh,
}

#[derive(Subcommand)]
enum WorkspaceAction {
    /// Register a workspace
    Add {
        /// Local identifier for the workspace
        id: String,

        /// Backlog space domain, e.g. acme.backlog.com
        #[arg(short, long)]
        domain: String,

        /// Backlog API key
        #[arg(short = 'k', long, env = "PROJECTLENS_API_KEY", hide_env_values = true)]
        api_key: String,

        /// Project keys to track (repeatable; default: all)
        #[arg(short, long = "project")]
        projects: Vec<String>,
    },
    /// List registered workspaces
    List {
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },
    /// Remove a workspace and its synced data
    Remove { id: String },
    /// Include a workspace in syncs
    Enable { id: String },
    /// Exclude a workspace from syncs
    Disable { id: String },
}

#[derive(Subcommand)]
enum SyncAction {
    /// User, projects and recently updated issues
    Stage1 {
        workspaces: Vec<String>,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,

        /// Bypass the response cache
        #[arg(short, long)]
        force: bool,
    },
    /// Issue delta since the last watermark
    Stage2 {
        workspaces: Vec<String>,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,

        /// Fetch every issue and remove ones no longer present
        #[arg(long)]
        full: bool,
    },
    /// Backfill older issues when the API budget allows
    Stage3 {
        workspaces: Vec<String>,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,

        /// How far back to backfill
        #[arg(short, long)]
        days: Option<u32>,
    },
    /// Stages 1, 2 and 3 in order
    All {
        workspaces: Vec<String>,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("projectlens=info,projectlens_cli=info"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Load configuration (config file -> env vars -> defaults)
    let config = config::Config::load();

    let cli = Cli::parse();

    let database_url = config
        .database_url()
        .ok_or("Could not determine a state directory; set PROJECTLENS_DATABASE_URL")?;

    // Ensure the database directory exists for SQLite
    if database_url.starts_with("sqlite://") {
        let db_path = database_url.trim_start_matches("sqlite://");
        // Strip query parameters (e.g., ?mode=rwc) before path operations
        let db_path = db_path.split('?').next().unwrap_or(db_path);
        let db_path = std::path::Path::new(db_path);

        if db_path.is_relative() && !db_path.as_os_str().is_empty() {
            tracing::warn!(
                "Database path '{}' is relative - behavior depends on current directory. \
                 Consider using an absolute path.",
                db_path.display()
            );
        }

        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
    }

    if let Commands::Migrate { action } = cli.command {
        commands::migrate::handle_migrate(action, &database_url).await?;
        return Ok(());
    }

    let db = Arc::new(projectlens::connect_and_migrate(&database_url).await?);

    match cli.command {
        Commands::Migrate { .. } => {}
        Commands::Workspace { action } => {
            commands::workspace::handle_workspace(action, &db).await?;
        }
        Commands::Sync { action } => {
            commands::sync::handle_sync(action, &config, &db).await?;
        }
        Commands::Run { workspaces } => {
            commands::sync::handle_run(workspaces, &config, &db).await?;
        }
        Commands::Limits { workspaces, output } => {
            commands::limits::handle_limits(workspaces, output, &config, &db).await?;
        }
        Commands::Issues {
            workspace,
            limit,
            output,
        } => {
            commands::issues::handle_issues(&workspace, limit, output, &db).await?;
        }
        Commands::Stats { output } => {
            commands::sync::handle_stats(&db, output).await?;
        }
    }

    Ok(())
}
