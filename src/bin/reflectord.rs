use std::fs;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use reflector::{Config, ReflectorServer};

const DEFAULT_CONFIG_PATH: &str = "reflector.toml";

#[derive(Parser)]
#[command(name = "reflectord", version, about = "Talkgroup audio reflector daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the reflector using a TOML configuration file.
    Serve {
        /// Path to the configuration file.
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
    /// Inspect or initialize the configuration.
    Config {
        /// Path to the configuration file.
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        path: PathBuf,
        /// Write a commented sample configuration.
        #[arg(long)]
        init: bool,
        /// Overwrite an existing file when used with --init.
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config } => serve(&config).await?,
        Command::Config { path, init, force } => {
            if init {
                init_config(&path, force)?;
            } else {
                show_config(&path)?;
            }
        }
    }
    Ok(())
}

async fn serve(config_path: &Path) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();
    let config_str = fs::read_to_string(config_path)
        .map_err(|err| format!("failed to read config at {}: {err}", config_path.display()))?;
    let cfg = Config::from_toml_str(&config_str)?;

    tracing::info!(config = %config_path.display(), "starting reflectord");

    let server = ReflectorServer::new(cfg);
    let mut handle = tokio::spawn(async move { server.serve().await });

    tokio::select! {
        result = &mut handle => {
            match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(Box::new(err) as Box<dyn std::error::Error + Send + Sync>),
                Err(err) => Err(Box::new(err) as Box<dyn std::error::Error + Send + Sync>),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
            handle.abort();
            Ok(())
        }
    }
}

fn show_config(path: &Path) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    println!("Config path: {}", path.display());
    if path.exists() {
        let contents = fs::read_to_string(path)?;
        println!("{contents}");
    } else {
        println!("Config file not found. Use `reflectord config --init` to create one.");
    }
    Ok(())
}

fn init_config(path: &Path, force: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if path.exists() && !force {
        return Err(format!(
            "config already exists at {} (use --force to overwrite)",
            path.display()
        )
        .into());
    }

    let sample = "\
# Talkgroup audio reflector configuration.

bind_host = \"0.0.0.0\"
# TCP control and UDP audio share this port.
listen_port = 5300

# Seconds of talker silence before a forced release; 0 disables.
sql_timeout = 0
# Block applied to a talker cleared by the squelch timeout, in seconds.
sql_timeout_blocktime = 60

# Fixed talkgroup for legacy protocol-version-1 clients.
tg_for_v1_clients = 1

# Random QSY pool as \"lo:count\", e.g. \"1000:100\" for TGs 1000-1099.
#random_qsy_range = \"1000:100\"

# Uncomment to enable the HTTP status endpoint.
#http_srv_port = 8080

# Shared authentication keys, one per callsign.
[users]
SM0ABC = \"change-me\"
";
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, sample)?;
    println!("Wrote config to {}", path.display());
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
