//! Command-line interface for the Hearth extension host.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hearth_api::{token_digest, Host, HostConfig};
use hearth_core::extension::ExtensionConfig;

/// Hearth - an extension host for HTTP services.
#[derive(Parser, Debug)]
#[command(name = "hearth")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Configuration file (defaults to $HEARTH_CONFIG, then hearth.toml).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the host server.
    Serve {
        /// Host to bind to.
        #[arg(long)]
        host: Option<String>,
        /// Port to bind to.
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Inspect built-in extensions.
    Extensions {
        #[command(subcommand)]
        cmd: ExtensionsCommand,
    },
    /// Print the effective configuration as TOML.
    ShowConfig,
    /// Print the SHA-256 digest of an API token for the `[[auth.tokens]]` table.
    TokenDigest {
        /// The raw token.
        token: String,
    },
}

#[derive(Subcommand, Debug)]
enum ExtensionsCommand {
    /// List the catalog with stored enabled flags.
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    match args.command {
        Command::Serve { host, port } => run_server(args.config.as_deref(), host, port).await,
        Command::Extensions {
            cmd: ExtensionsCommand::List,
        } => list_extensions(args.config.as_deref()),
        Command::ShowConfig => show_config(args.config.as_deref()),
        Command::TokenDigest { token } => {
            println!("{}", token_digest(&token));
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    // JSON logs for container environments
    let json_logging = std::env::var("HEARTH_LOG_JSON")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let default_directive = if verbose { "hearth=debug" } else { "hearth=info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(default_directive)
                .add_directive(tracing::Level::WARN.into())
        });

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .init();
    }
}

async fn run_server(config_path: Option<&Path>, host: Option<String>, port: Option<u16>) -> Result<()> {
    let mut config = HostConfig::resolve(config_path)?;
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    let (host, report) = Host::build(config, hearth_extensions::catalog()).await?;
    if !report.failed.is_empty() {
        tracing::warn!(
            failed = report.failed.len(),
            "Some extensions failed to start, see /api/extensions"
        );
    }
    hearth_api::run(host, hearth_api::shutdown_signal()).await
}

fn list_extensions(config_path: Option<&Path>) -> Result<()> {
    let config = HostConfig::resolve(config_path)?;
    let settings = match config.settings_path() {
        Some(path) => ExtensionConfig::load(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => ExtensionConfig::default(),
    };

    println!("{:<16} {:<10} {:<8} DESCRIPTION", "NAME", "VERSION", "ENABLED");
    for extension in hearth_extensions::catalog() {
        let metadata = extension.metadata();
        let enabled = settings.is_enabled(&metadata.name);
        println!(
            "{:<16} {:<10} {:<8} {}",
            metadata.name,
            metadata.version.to_string(),
            if enabled { "yes" } else { "no" },
            metadata.description
        );
    }
    Ok(())
}

fn show_config(config_path: Option<&Path>) -> Result<()> {
    let mut config = HostConfig::resolve(config_path)?;
    if !config.storage.signing_secret.is_empty() {
        config.storage.signing_secret = "<redacted>".to_string();
    }
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}
