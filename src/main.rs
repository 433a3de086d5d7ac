use anyhow::{bail, Context, Result};
use boardstack::auth::{TokenService, UserStore};
use boardstack::config::Config;
use boardstack::gateway;
use boardstack::security::PasswordHasher;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// boardstack - authentication gate for the bulletin-board backend
#[derive(Parser, Debug)]
#[command(name = "boardstack")]
#[command(version, about = "Bearer-token authentication gate", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP gateway
    Serve {
        /// Path to config.toml (default: platform config dir)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Bind address, overrides server.host
        #[arg(long)]
        host: Option<String>,

        /// Port, overrides server.port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Print a credential record for a plaintext password
    HashPassword {
        plaintext: String,
    },

    /// Print a token signed with the configured secret
    IssueToken {
        username: String,

        /// Path to config.toml (default: platform config dir)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Issue a refresh token instead of an access token
        #[arg(long)]
        refresh: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, host, port } => {
            let mut config = Config::load(config.as_deref())?;
            init_logging(&config.logging.level);

            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            tracing::info!(config = %config.config_path.display(), "Starting boardstack");
            gateway::run_gateway(config).await
        }
        Commands::HashPassword { plaintext } => {
            println!("{}", PasswordHasher::new().encode(&plaintext));
            Ok(())
        }
        Commands::IssueToken {
            username,
            config,
            refresh,
        } => {
            let config = Config::load(config.as_deref())?;
            init_logging(&config.logging.level);
            config.validate()?;

            let tokens = TokenService::from_config(&config.jwt);
            let token = if refresh {
                tokens.issue_refresh_token(&username)?
            } else {
                let roles = roles_for(&config, &username)?;
                tokens.issue_access_token(&username, &roles)?
            };
            println!("{token}");
            Ok(())
        }
    }
}

/// Roles of an existing user, read from the configured store.
fn roles_for(config: &Config, username: &str) -> Result<Vec<String>> {
    let path = &config.database.path;
    if !path.exists() {
        bail!("User store {} does not exist; run `serve` once first", path.display());
    }
    let store = UserStore::open(path)
        .with_context(|| format!("Failed to open user store at {}", path.display()))?;
    if store.find_by_username(username)?.is_none() {
        bail!("User '{username}' not found");
    }
    Ok(store.roles_of(username)?)
}

/// `RUST_LOG` wins over the configured level. Logs go to stderr so that
/// command output on stdout stays clean.
fn init_logging(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
