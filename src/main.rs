//! Chatgate - edge daemons for the end-to-end encrypted chat service
//!
//! `chatgate proxy` terminates client TLS, checks the credential frame and
//! relays to the internal chat server. `chatgate ipmgr` follows the rule
//! source's control stream(s) and applies admission rules to the firewall.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chatgate_pool::{BufferPool, Pool};
use chatgate_proto::CredentialRecord;
use chatgate_relay::{AuthGate, GateConfig, ProxyServer, ProxyServerConfig, TlsDialer};
use chatgate_rules::{
    ControlResources, ControlSource, DispatchEnd, DispatcherConfig, LoggingFirewall,
    RuleDispatcher,
};
use chatgate_transport::{ensure_crypto_provider, Endpoint, TlsClientConfig, TlsServerConfig};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::prelude::*;

const VERSION: &str = concat!(
    env!("GIT_TAG"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_TIME"),
    ")"
);

/// Chatgate - authenticating relay and firewall rule manager
#[derive(Parser, Debug)]
#[command(name = "chatgate")]
#[command(version = VERSION)]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept client TLS connections, authenticate them and relay to the chat server
    Proxy(ProxyArgs),

    /// Apply firewall admission rules received from the rule source
    Ipmgr(IpmgrArgs),
}

#[derive(Args, Debug)]
struct ProxyArgs {
    /// Address to accept client connections on
    #[arg(long, env = "CHATGATE_LISTEN", default_value = "0.0.0.0:25500")]
    listen: SocketAddr,

    /// Internal chat server (host:port)
    #[arg(long, env = "CHATGATE_UPSTREAM", default_value = "127.0.0.1:25501")]
    upstream: Endpoint,

    /// PEM certificate chain presented to clients
    #[arg(long, env = "PROXY_TLS_CERT")]
    tls_cert: String,

    /// PEM private key for the certificate
    #[arg(long, env = "PROXY_TLS_KEY")]
    tls_key: String,

    /// Deadline for the TLS handshake and the credential frame
    #[arg(long, default_value = "5000")]
    auth_timeout_ms: u64,

    /// Relay buffer size in bytes (at least --max-credential-frame)
    #[arg(long, default_value = "32768", value_parser = parse_size)]
    buffer_size: usize,

    /// Largest credential frame accepted
    #[arg(long, default_value = "4096", value_parser = parse_size)]
    max_credential_frame: usize,
}

impl ProxyArgs {
    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.buffer_size >= self.max_credential_frame,
            "--buffer-size ({}) must hold a full credential frame (--max-credential-frame {})",
            self.buffer_size,
            self.max_credential_frame
        );
        Ok(())
    }
}

#[derive(Args, Debug)]
struct IpmgrArgs {
    /// Rule source carrying tagged insert/delete events on one stream
    #[arg(long, env = "CHATGATE_CONTROL", conflicts_with_all = ["insert_source", "delete_source"])]
    control: Option<Endpoint>,

    /// Rule source stream carrying insertions only
    #[arg(long, env = "TLS_SERVER_ADDR", requires = "delete_source")]
    insert_source: Option<Endpoint>,

    /// Rule source stream carrying deletions only
    #[arg(long, env = "HTTPS_SERVER_ADDR", requires = "insert_source")]
    delete_source: Option<Endpoint>,

    /// Read buffer size in bytes (at least --max-rule-frame)
    #[arg(long, default_value = "1024", value_parser = parse_size)]
    buffer_size: usize,

    /// Largest rule frame accepted
    #[arg(long, default_value = "1024", value_parser = parse_size)]
    max_rule_frame: usize,

    /// Log rules without applying them. No firewall backend is built in, so
    /// this is currently required.
    #[arg(long)]
    dry_run: bool,
}

impl IpmgrArgs {
    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.dry_run,
            "No firewall backend is configured; pass --dry-run to log rules without applying them"
        );
        anyhow::ensure!(
            self.buffer_size >= self.max_rule_frame,
            "--buffer-size ({}) must hold a full rule frame (--max-rule-frame {})",
            self.buffer_size,
            self.max_rule_frame
        );
        Ok(())
    }

    fn source(&self) -> Result<ControlSource> {
        match (&self.control, &self.insert_source, &self.delete_source) {
            (Some(control), None, None) => Ok(ControlSource::Single(control.clone())),
            (None, Some(inserts), Some(deletes)) => Ok(ControlSource::Split {
                inserts: inserts.clone(),
                deletes: deletes.clone(),
            }),
            _ => anyhow::bail!(
                "Specify either --control or both --insert-source and --delete-source"
            ),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;
    ensure_crypto_provider();

    info!("Chatgate {}", VERSION);

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down...");
                token.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    match cli.command {
        Commands::Proxy(args) => run_proxy(args, shutdown).await,
        Commands::Ipmgr(args) => run_ipmgr(args, shutdown).await,
    }
}

async fn run_proxy(args: ProxyArgs, shutdown: CancellationToken) -> Result<()> {
    args.validate()?;
    info!("Client endpoint: {}", args.listen);
    info!("Upstream chat server: {}", args.upstream);

    let acceptor = TlsServerConfig::new(&args.tls_cert, &args.tls_key)
        .build_acceptor()
        .context("Failed to load proxy TLS certificate")?;

    // The upstream link stays inside the private network
    let connector = TlsClientConfig::insecure()
        .build_connector()
        .context("Failed to build upstream TLS connector")?;
    let dialer = TlsDialer::new(args.upstream, connector);

    let gate = AuthGate::new(
        GateConfig {
            auth_timeout: Duration::from_millis(args.auth_timeout_ms),
            max_credential_frame: args.max_credential_frame,
        },
        dialer,
        Arc::new(BufferPool::new(args.buffer_size)),
        Arc::new(Pool::<CredentialRecord>::default()),
    );

    let server = ProxyServer::new(
        ProxyServerConfig {
            bind_addr: args.listen,
        },
        acceptor,
        gate,
    );

    server.start(shutdown).await?;
    info!("Proxy stopped");
    Ok(())
}

async fn run_ipmgr(args: IpmgrArgs, shutdown: CancellationToken) -> Result<()> {
    args.validate()?;
    let source = args.source()?;

    let resources = ControlResources::new(&DispatcherConfig {
        buffer_size: args.buffer_size,
        max_rule_frame: args.max_rule_frame,
    });

    // The rule source sits on the private network with a self-signed certificate
    let dispatcher =
        RuleDispatcher::connect(&source, &TlsClientConfig::insecure(), &resources, &shutdown)
            .await
            .context("Failed to connect to rule source")?;

    let outcome = dispatcher.run(&LoggingFirewall).await;
    info!("Applied {} rule(s)", outcome.applied);

    match outcome.ended_by {
        DispatchEnd::Shutdown => Ok(()),
        DispatchEnd::StreamEnded(stream) => {
            anyhow::bail!("Control stream {} ended; restart to resynchronize", stream)
        }
    }
}

/// Byte sizes must be non-zero
fn parse_size(s: &str) -> Result<usize, String> {
    match s.parse::<usize>() {
        Ok(0) => Err("must be greater than 0".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
