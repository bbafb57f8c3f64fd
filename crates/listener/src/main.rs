//! Certmesh - Main entry point
//!
//! Serves a self-renewing, cluster-synchronized TLS certificate behind a
//! status endpoint.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use certmesh_common::observability::init_tracing;
use certmesh_common::types::LogFormat;
use certmesh_config::{validate_ca_files, Config};
use certmesh_listener::{
    spawn_signal_handler, AccessLog, CertificateAuthority, CertificateCoordinator,
    CertificateFactory, CoordinatorPolicy, DirectoryBackend, DynamicListener, FileTier,
    RequiredIdentity, ServerLifecycle, SlotKey, SniFilter, StatusHandler, TieredCertStore,
    TlsOptions,
};

/// Certmesh - self-renewing TLS serving certificates for clusters
#[derive(Parser, Debug)]
#[command(name = "certmesh")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "CERTMESH_CONFIG")]
    config: Option<String>,

    /// Test configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose")]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate configuration file and exit
    Test {
        #[arg(short = 'c', long = "config")]
        config: Option<String>,
    },
    /// Run the listener (default)
    Run {
        #[arg(short = 'c', long = "config")]
        config: Option<String>,
    },
    /// Create a self-signed CA for development clusters
    InitCa {
        /// Certificate output path (defaults to the configured CA path)
        #[arg(long)]
        cert: Option<PathBuf>,
        /// Key output path (defaults to the configured CA path)
        #[arg(long)]
        key: Option<PathBuf>,
        #[arg(long, default_value = "certmesh server CA")]
        common_name: String,
        /// Overwrite existing files
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.test {
        return test_config(cli.config.as_deref());
    }

    match cli.command {
        Some(Commands::Test { config }) => test_config(config.as_deref().or(cli.config.as_deref())),
        Some(Commands::Run { config }) => run_server(config.or(cli.config), cli.verbose),
        Some(Commands::InitCa {
            cert,
            key,
            common_name,
            force,
        }) => init_ca(cli.config.as_deref(), cert, key, &common_name, force),
        None => run_server(cli.config, cli.verbose),
    }
}

fn load_config(config_path: Option<&str>) -> Result<Config> {
    match config_path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load configuration file {}", path)),
        None => Config::default_embedded().context("Failed to load embedded configuration"),
    }
}

/// Test configuration file and exit
fn test_config(config_path: Option<&str>) -> Result<()> {
    init_tracing("info", LogFormat::Pretty);

    match config_path {
        Some(path) => info!("Testing configuration file: {}", path),
        None => info!("Testing embedded default configuration"),
    }

    let config = load_config(config_path)?;
    let warnings = config.validate().context("Configuration validation failed")?;
    for warning in &warnings {
        warn!("{}", warning.message);
    }

    let runtime = tokio::runtime::Runtime::new()?;
    let ca_result = runtime.block_on(validate_ca_files(&config));
    for warning in &ca_result.warnings {
        warn!("{}", warning.message);
    }
    if !ca_result.is_ok() {
        let errors: Vec<String> = ca_result.errors.iter().map(ToString::to_string).collect();
        anyhow::bail!("CA validation failed: {}", errors.join("; "));
    }

    info!("Configuration test successful:");
    info!("  - listener {}", config.listener.socket_address());
    info!("  - {} SAN(s)", config.identity.effective_sans().len());
    info!("  - durable slot '{}' in {}", config.storage.slot, config.storage.durable_dir.display());

    println!(
        "certmesh: configuration file {} test is successful",
        config_path.unwrap_or("(embedded)")
    );
    Ok(())
}

/// Create a development CA at the configured (or given) paths
fn init_ca(
    config_path: Option<&str>,
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
    common_name: &str,
    force: bool,
) -> Result<()> {
    init_tracing("info", LogFormat::Pretty);

    let config = load_config(config_path)?;
    let cert = cert.unwrap_or(config.ca.cert_file);
    let key = key.unwrap_or(config.ca.key_file);

    if !force && (cert.exists() || key.exists()) {
        anyhow::bail!(
            "CA files already exist ({}, {}); pass --force to overwrite",
            cert.display(),
            key.display()
        );
    }

    let ca = CertificateAuthority::generate_self_signed(common_name)
        .context("Failed to generate CA")?;
    ca.write_pem_files(&cert, &key)
        .context("Failed to write CA files")?;

    println!("certmesh: wrote CA certificate {} and key {}", cert.display(), key.display());
    Ok(())
}

/// Run the listener until SIGTERM/SIGINT
fn run_server(config_path: Option<String>, verbose: bool) -> Result<()> {
    let config = load_config(config_path.as_deref())?;

    let log_level = if verbose { "debug" } else { "info" };
    init_tracing(log_level, config.server.log_format);

    match &config_path {
        Some(path) => info!("Loaded configuration from: {}", path),
        None => info!("No configuration specified, using embedded default configuration"),
    }

    for warning in config.validate().context("Configuration validation failed")? {
        warn!("{}", warning.message);
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(serve(config))
}

async fn serve(config: Config) -> Result<()> {
    let ca = Arc::new(
        CertificateAuthority::from_pem_files(&config.ca.cert_file, &config.ca.key_file)
            .context("Failed to load certificate authority")?,
    );

    let durable = Arc::new(DirectoryBackend::new(
        &config.storage.durable_dir,
        Duration::from_secs(config.storage.poll_interval_secs),
    ));
    let store = TieredCertStore::builder(durable)
        .file_cache(FileTier::new(config.storage.file_cache_dir()))
        .build();

    let validity = Duration::from_secs(u64::from(config.renewal.validity_days) * 86400);
    let coordinator = Arc::new(
        CertificateCoordinator::new(
            SlotKey::new(config.storage.slot.as_str()),
            store,
            CertificateFactory::new(Arc::clone(&ca), validity),
            RequiredIdentity::from_config(&config.identity, &config.listener),
            CoordinatorPolicy::from_config(&config.renewal),
        )
        .with_sni_learning(SniFilter::from_config(&config.identity.sni_learning)),
    );

    let options = TlsOptions {
        client_auth: config.listener.client_auth,
        alpn_protocols: config.listener.alpn_protocols.clone(),
        client_ca: Some(ca.cert_der().clone()),
    };

    let listener = DynamicListener::bind(
        &config.listener.socket_address(),
        Arc::clone(&coordinator),
        options,
        Duration::from_secs(config.server.handshake_timeout_secs),
    )
    .await
    .context("Failed to start TLS listener")?;

    let server = ServerLifecycle::new(
        listener,
        StatusHandler::new(Arc::clone(&coordinator)),
        Duration::from_secs(config.server.drain_timeout_secs),
    )
    .wrap(AccessLog::new);

    let signals = spawn_signal_handler(Arc::clone(&coordinator), server.shutdown_token())
        .context("Failed to register signal handlers")?;

    info!("Certmesh started successfully");
    server.run().await?;

    signals.abort();
    info!("Certmesh stopped");
    Ok(())
}
