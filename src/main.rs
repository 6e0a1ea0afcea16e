//! Trellis - control-plane bootstrap for a single Kubernetes cluster

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use trellis::bundle::BundleStore;
use trellis::config::{Config, ConfigError, DEFAULT_CONFIG_PATH};
use trellis::fsutil::{AccountResolver, Owner, SystemAccounts};
use trellis::provision::{ConfiguredIssuer, ProvisionReport, Provisioner};
use trellis::rbac::{DesiredState, KubeAuthorizationApi, ReconciliationError, Reconciler};
use trellis::readiness::ReadinessGate;
use trellis::token::TokenDeriver;
use trellis::units::UnitGraph;
use trellis::Error;

/// Trellis - control-plane bootstrap for a single Kubernetes cluster
#[derive(Parser, Debug)]
#[command(name = "trellis", version, about, long_about = None)]
struct Cli {
    /// Path to the trellis configuration file
    #[arg(long, env = "TRELLIS_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Derive the token, issue every certificate, then write every bundle
    Provision,

    /// Derive the CA bootstrap token and write it to the token file
    Token,

    /// Issue certificates (all identities unless one is named)
    Issue {
        /// Issue a single identity
        #[arg(long)]
        identity: Option<String>,
    },

    /// Write connection bundles from the issued certificates
    Bundles,

    /// Block until a service's identities have usable material
    Gate {
        /// Gated service
        #[arg(long)]
        service: String,
    },

    /// Print the unit graph the supervisor should install
    Units {
        /// Binary path used in unit command lines
        #[arg(long)]
        binary: Option<PathBuf>,

        /// Print the start order instead of the graph
        #[arg(long)]
        order: bool,
    },

    /// Create the configured service accounts and role bindings
    Reconcile,

    /// Print the bundle path for the calling user
    Kubeconfig,

    /// List the identities in the registry
    Identities,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Install crypto provider - FIPS-validated aws-lc-rs
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install FIPS-validated crypto provider: {:?}",
            e
        );
        return ExitCode::FAILURE;
    }

    // Logs go to stderr so command output stays clean on stdout
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let cancel = shutdown_token();

    match run(cli, cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = err
                .downcast_ref::<Error>()
                .map(Error::exit_code)
                .unwrap_or(1);
            tracing::error!(error = %format!("{:#}", err), exit_code = code, "trellis failed");
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

/// Cancel on SIGINT or SIGTERM
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable, listening for Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
        info!("Shutdown requested");
        trigger.cancel();
    });
    token
}

async fn run(cli: Cli, cancel: CancellationToken) -> anyhow::Result<()> {
    let config = Config::load(&cli.config)
        .map_err(Error::from)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Commands::Provision => run_provision(&config, &cancel).await?,
        Commands::Token => run_token(&config)?,
        Commands::Issue { identity } => run_issue(&config, identity.as_deref(), &cancel).await?,
        Commands::Bundles => run_bundles(&config)?,
        Commands::Gate { service } => run_gate(&config, &service, &cancel).await?,
        Commands::Units { binary, order } => run_units(&config, &cli.config, binary, order)?,
        Commands::Reconcile => run_reconcile(&config, &cancel).await?,
        Commands::Kubeconfig => run_kubeconfig(&config)?,
        Commands::Identities => run_identities(&config)?,
    }
    Ok(())
}

fn accounts() -> Arc<dyn AccountResolver> {
    Arc::new(SystemAccounts)
}

fn provisioner(config: &Config) -> trellis::Result<Provisioner<ConfiguredIssuer>> {
    let issuer = ConfiguredIssuer::from_config(&config.ca, &config.paths.token_file)?;
    Provisioner::from_config(config, Arc::new(issuer), accounts())
}

fn run_token(config: &Config) -> trellis::Result<()> {
    let deriver = TokenDeriver::new(
        config.token.password.clone(),
        &config.paths.token_file,
        &config.token.owner,
    );
    let written = deriver.provision(&SystemAccounts)?;
    info!(
        path = %written.path.display(),
        owner = %written.owner,
        fingerprint = %written.token.fingerprint(),
        "Bootstrap token written"
    );
    Ok(())
}

async fn run_provision(config: &Config, cancel: &CancellationToken) -> trellis::Result<()> {
    run_token(config)?;
    let report = provisioner(config)?.run(cancel).await?;
    println!(
        "{} identities issued, {} bundles written, {} unchanged",
        report.materials.len(),
        report.bundles_written.len(),
        report.bundles_unchanged.len()
    );
    Ok(())
}

async fn run_issue(
    config: &Config,
    identity: Option<&str>,
    cancel: &CancellationToken,
) -> trellis::Result<()> {
    let provisioner = provisioner(config)?;
    let materials = match identity {
        Some(name) => vec![provisioner.issue_one(name).await?],
        None => provisioner.issue_all(cancel).await?,
    };
    for material in &materials {
        println!("{}\t{}", material.identity.name, material.cert_path.display());
    }
    Ok(())
}

fn run_bundles(config: &Config) -> trellis::Result<()> {
    let provisioner = provisioner(config)?;
    let mut report = ProvisionReport::default();
    provisioner.write_bundles(&mut report)?;
    println!(
        "{} bundles written, {} unchanged",
        report.bundles_written.len(),
        report.bundles_unchanged.len()
    );
    Ok(())
}

async fn run_gate(config: &Config, service: &str, cancel: &CancellationToken) -> trellis::Result<()> {
    let requirement = config.readiness.requirement(service).ok_or_else(|| {
        ConfigError::Invalid(format!("no readiness requirement for service {}", service))
    })?;
    let registry = config.registry()?;
    let mut gate = ReadinessGate::new(
        requirement,
        &registry,
        &config.paths.cert_layout(),
        accounts(),
        config.readiness.timing(),
    )?;
    gate.wait(cancel).await?;
    Ok(())
}

fn run_units(
    config: &Config,
    config_path: &Path,
    binary: Option<PathBuf>,
    order: bool,
) -> trellis::Result<()> {
    let binary = match binary {
        Some(path) => path,
        None => std::env::current_exe().map_err(|e| {
            ConfigError::Invalid(format!("cannot determine binary path: {}", e))
        })?,
    };
    let invocation = vec![
        binary.display().to_string(),
        "--config".to_string(),
        config_path.display().to_string(),
    ];
    let graph = UnitGraph::build(
        &config.registry()?,
        &config.readiness.requirements,
        &config.api_service,
        &invocation,
    )?;

    if order {
        for unit in graph.start_order()? {
            println!("{}", unit);
        }
    } else {
        let json = graph.to_json().map_err(|e| Error::serialization(e.to_string()))?;
        println!("{}", json);
    }
    Ok(())
}

async fn run_reconcile(config: &Config, cancel: &CancellationToken) -> trellis::Result<()> {
    let registry = config.registry()?;
    let desired = DesiredState::resolve(&registry, &config.service_accounts, &config.bindings)?;

    let store = BundleStore::new(&config.paths.bundle_dir, &config.default_admin, accounts());
    let api = KubeAuthorizationApi::from_bundle(&store.path_for(&config.default_admin))
        .await
        .map_err(ReconciliationError::Client)?;

    let report = Reconciler::new(api, desired, config.paths.reconcile_marker())
        .with_reachability(config.reconcile.reachability())
        .run(cancel)
        .await?;

    if report.skipped {
        println!("authorization already reconciled");
    } else {
        println!(
            "{} created, {} already present",
            report.created.len(),
            report.existing.len()
        );
    }
    Ok(())
}

fn run_kubeconfig(config: &Config) -> trellis::Result<()> {
    let store = BundleStore::new(&config.paths.bundle_dir, &config.default_admin, accounts());
    let path = store.resolve(&Owner::current()?)?;
    println!("{}", path.display());
    Ok(())
}

fn run_identities(config: &Config) -> trellis::Result<()> {
    for identity in config.registry()?.list_identities() {
        println!(
            "{}\t{}\t{}",
            identity.name, identity.common_name, identity.private_key_owner
        );
    }
    Ok(())
}
