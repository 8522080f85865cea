//! Honeypool daemon
//!
//! Accepts TCP connections on the configured addresses and bridges each one
//! into the sandbox of its source host.

use anyhow::{bail, Context};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use honeypool::config::{self, Config, LogFormat};
use honeypool::core::TracingSink;
use honeypool::runtime::DockerBackend;
use honeypool::{SandboxPool, VERSION};

#[derive(Parser)]
#[command(
    name = "honeypool",
    author = "Honeypool Contributors",
    version = VERSION,
    about = "Honeypool - per-attacker sandbox pool",
    long_about = None
)]
struct Cli {
    /// Configuration file (TOML or JSON5)
    #[arg(long, short, env = "HONEYPOOL_CONFIG")]
    config: Option<PathBuf>,

    /// Address to accept connections on, repeatable
    #[arg(long, short)]
    listen: Vec<String>,

    /// Template image sandboxes are cloned from
    #[arg(long, short)]
    template: Option<String>,
}

fn init_logging(config: &Config) -> anyhow::Result<()> {
    let mut filter = EnvFilter::from_default_env().add_directive("honeypool=debug".parse()?);
    if let Some(directives) = config.log.filter.as_deref() {
        for directive in directives.split(',').filter(|d| !d.trim().is_empty()) {
            filter = filter.add_directive(directive.trim().parse()?);
        }
    }

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log.format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

fn load(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match cli.config.as_deref() {
        Some(path) => {
            let mut config = config::load_config_from_path(path)
                .with_context(|| format!("loading {}", path.display()))?;
            config::apply_env_overrides(&mut config);
            config
        }
        None => Config::from_env()?,
    };

    if !cli.listen.is_empty() {
        config.listener.addresses = cli.listen.clone();
    }
    if let Some(template) = cli.template.as_ref() {
        config.sandbox.template = template.clone();
    }

    Ok(config)
}

async fn serve(pool: Arc<SandboxPool>, listener: TcpListener) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                continue;
            }
        };

        let pool = Arc::clone(&pool);
        tokio::spawn(async move {
            match bridge(&pool, stream).await {
                Ok(()) => {}
                Err(e) if e.is_client_error() => debug!("Ignoring connection from {}: {}", peer, e),
                // the next connection from this peer tries again
                Err(e) if e.is_retryable() => warn!("Connection from {} failed: {}", peer, e),
                Err(e) => error!("Connection from {} failed: {}", peer, e),
            }
        });
    }
}

async fn bridge(pool: &SandboxPool, mut stream: TcpStream) -> honeypool::Result<()> {
    let mut conn = pool.dial(&stream).await?;
    let sandbox = conn.sandbox().name().to_string();
    debug!(
        "Bridging {} into {} via {}",
        stream.peer_addr()?,
        sandbox,
        conn.get_ref().local_addr()?
    );

    let (from_peer, from_sandbox) = tokio::io::copy_bidirectional(&mut stream, &mut conn).await?;
    debug!(
        "Session with {} closed ({} bytes in, {} bytes out)",
        sandbox, from_peer, from_sandbox
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load(&cli)?;
    init_logging(&config)?;

    info!("Starting Honeypool v{}", VERSION);

    let validation = config::validate_config(&config);
    for warning in &validation.warnings {
        warn!("{}", warning);
    }
    if !validation.valid {
        for issue in &validation.errors {
            error!("{}", issue);
        }
        bail!("invalid configuration ({} errors)", validation.errors.len());
    }

    let backend = DockerBackend::connect(&config.docker).await?;
    let pool = Arc::new(SandboxPool::new(
        config.sandbox.clone(),
        Arc::new(backend),
        Arc::new(TracingSink),
    )?);

    match pool.adopt_existing().await {
        Ok(0) => {}
        Ok(n) => info!("Adopted {} sandboxes from a previous run", n),
        Err(e) => warn!("Could not adopt existing sandboxes: {}", e),
    }

    for address in &config.listener.addresses {
        let listener = TcpListener::bind(address)
            .await
            .with_context(|| format!("binding {}", address))?;
        info!("Listening on {}", listener.local_addr()?);
        tokio::spawn(serve(Arc::clone(&pool), listener));
    }

    tokio::signal::ctrl_c().await?;
    pool.shutdown();

    info!("Honeypool shutdown complete");
    Ok(())
}
