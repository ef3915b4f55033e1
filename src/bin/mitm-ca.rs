use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mitm_ca::{CaConfig, IssuanceCoordinator, PasswordConfig, RootAuthority};
use rand::RngCore;
use rand::rngs::OsRng;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// On-demand certificate authority for TLS interception.
///
/// Creates the root authority and issues per-hostname leaf certificates
/// into the storage directory.
#[derive(Parser, Debug)]
#[command(name = "mitm-ca")]
#[command(version, about)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Storage directory. Overrides `root_dir` from the configuration.
    #[arg(long)]
    root_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the root authority. Existing files are never overwritten.
    Init,
    /// Print the certificate and private key for a hostname, issuing them if needed.
    Issue { hostname: String },
    /// Print the path of the root certificate.
    RootPath,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let args = Args::parse();

    let mut config = if let Some(config_path) = &args.config {
        CaConfig::load(config_path)
            .with_context(|| format!("failed to load config from {:?}", config_path))?
    } else {
        CaConfig::default()
    };
    if let Some(root_dir) = args.root_dir {
        config.root_dir = root_dir;
    }

    match args.command {
        Command::Init => init(&config),
        Command::Issue { hostname } => {
            let coordinator = load(&config)?;
            let issued = coordinator
                .request_certificate(&hostname)
                .await
                .with_context(|| format!("failed to issue certificate for {hostname}"))?;
            print!("{}{}", issued.certificate_pem(), issued.private_key_pem());
            Ok(())
        }
        Command::RootPath => {
            let coordinator = load(&config)?;
            println!("{}", coordinator.root_certificate_path().display());
            Ok(())
        }
    }
}

fn load(config: &CaConfig) -> Result<IssuanceCoordinator> {
    IssuanceCoordinator::from_config(config).with_context(|| {
        format!(
            "failed to load root authority from {}",
            config.root_dir.display()
        )
    })
}

fn init(config: &CaConfig) -> Result<()> {
    let layout = config.layout();
    layout
        .ensure_dirs()
        .with_context(|| format!("failed to create {}", layout.root().display()))?;

    if let PasswordConfig::File { path } = &config.password {
        let path = path.clone().unwrap_or_else(|| layout.ca_password());
        if !path.exists() {
            write_password_file(&path)?;
            info!("generated root key password in {}", path.display());
        }
    }

    let password = config
        .password
        .source(&layout)
        .root_key_password()
        .context("failed to read root key password")?;
    RootAuthority::bootstrap(&layout, &password).context("failed to create root authority")?;

    println!("{}", layout.ca_certificate().display());
    Ok(())
}

fn write_password_file(path: &Path) -> Result<()> {
    let mut secret = [0u8; 32];
    OsRng.fill_bytes(&mut secret);
    let password: String = secret.iter().map(|b| format!("{b:02x}")).collect();

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    writeln!(file, "{password}").with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
