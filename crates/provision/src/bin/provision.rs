//! RouterBoard provisioning server and CLI.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use provision::executor::SshExecutor;
use provision::fetch::FetchLedger;
use provision::locator::{ArpLocator, DeviceLocator};
use provision::net::{detect_local_address, Ipv4Cidr};
use provision::render::{ConfigRenderer, MemoryConfigStore, RouterOsRenderer};
use provision::server::{self, ApiState};
use provision::{
    EventKind, HardwareAddress, NetworkParams, ProvisionRequest, Provisioner, ProvisionerConfig,
    SessionOrchestrator, SessionRegistry, StatusBus,
};

/// Zero-touch RouterBoard provisioning.
#[derive(Parser)]
#[command(name = "provision", version)]
#[command(about = "Locate RouterBoards by MAC and push their configuration")]
struct Cli {
    /// Configuration file (TOML).
    #[arg(long, short, env = "PROVISION_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API and the session reaper until interrupted.
    Serve {
        /// Listen address (overrides the config file).
        #[arg(long, env = "PROVISION_LISTEN")]
        listen: Option<SocketAddr>,

        /// `host:port` devices use to reach this server.
        #[arg(long, env = "PROVISION_PUBLIC_ADDRESS")]
        public_address: Option<String>,
    },

    /// Provision one device, printing progress as it happens.
    Provision {
        /// Device hardware address.
        #[arg(long)]
        mac: String,

        /// SSH password (the device default is tried if it is rejected).
        #[arg(long, env = "PROVISION_SSH_PASSWORD")]
        password: Option<String>,

        #[command(flatten)]
        params: ParamArgs,

        /// Listen address for the configuration download server.
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// `host:port` devices use to reach this server.
        #[arg(long)]
        public_address: Option<String>,
    },

    /// Find a device's IP address by MAC.
    Locate {
        /// Device hardware address.
        #[arg(long)]
        mac: String,

        /// Discovery timeout in seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Print a rendered configuration script.
    Render {
        /// Device hardware address; omit with `--base`.
        #[arg(long, required_unless_present = "base")]
        mac: Option<String>,

        /// Print the base script instead.
        #[arg(long, conflicts_with = "mac")]
        base: bool,

        #[command(flatten)]
        params: ParamArgs,

        /// `host:port` written into the base script.
        #[arg(long)]
        public_address: Option<String>,
    },
}

#[derive(clap::Args)]
struct ParamArgs {
    /// LAN address with prefix, e.g. 192.168.50.1/24.
    #[arg(long)]
    lan_ip: Option<String>,

    /// PPPoE username.
    #[arg(long)]
    pppoe_user: Option<String>,

    /// PPPoE password.
    #[arg(long, env = "PROVISION_PPPOE_PASSWORD")]
    pppoe_password: Option<String>,

    /// Extra template parameter (repeatable), e.g. wifi_ssid=Home.
    #[arg(long = "param", value_parser = parse_key_val)]
    params: Vec<(String, serde_json::Value)>,
}

impl ParamArgs {
    fn into_network_params(self) -> NetworkParams {
        NetworkParams {
            network_address_with_prefix: self.lan_ip,
            tunnel_username: self.pppoe_user,
            tunnel_password: self.pppoe_password,
            additional_params: self.params.into_iter().collect::<BTreeMap<_, _>>(),
        }
    }
}

/// Parse `key=value`; the value is JSON if it parses as JSON, a string otherwise.
fn parse_key_val(s: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{s}`"))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.trim().to_string(), value))
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}

/// Everything the subcommands need, wired from the configuration.
struct Services {
    bus: Arc<StatusBus>,
    provisioner: Arc<Provisioner>,
    renderer: Arc<dyn ConfigRenderer>,
    fetches: Arc<FetchLedger>,
    locator: Arc<dyn DeviceLocator>,
    public_address: String,
}

impl Services {
    async fn build(config: &ProvisionerConfig) -> Result<Self> {
        let server_ip = match config.listen.ip() {
            ip if ip.is_unspecified() => detect_local_address().await,
            ip => ip,
        };
        let public_address = config
            .public_address
            .clone()
            .unwrap_or_else(|| format!("{server_ip}:{}", config.listen.port()));

        let fallback_subnet = match server_ip {
            IpAddr::V4(v4) => Ipv4Cidr::new(v4, 24)?,
            IpAddr::V6(_) => Ipv4Cidr::parse("192.168.88.0/24")?,
        };
        let locator: Arc<dyn DeviceLocator> = Arc::new(ArpLocator::new(
            config
                .locator_config(fallback_subnet)
                .context("Invalid discovery settings")?,
        ));
        let executor = Arc::new(SshExecutor::new(config.ssh_settings()));
        let renderer: Arc<dyn ConfigRenderer> = Arc::new(
            RouterOsRenderer::new(Arc::new(MemoryConfigStore::new()), config.render_settings())
                .context("Failed to compile configuration templates")?,
        );
        let fetches = Arc::new(FetchLedger::new());

        let orchestrator = SessionOrchestrator::new(
            Arc::clone(&locator),
            executor,
            Arc::clone(&renderer),
            Arc::clone(&fetches),
            config.orchestrator_config(&public_address),
        );
        let bus = Arc::new(StatusBus::new());
        let registry = Arc::new(SessionRegistry::in_memory(Arc::clone(&bus)));
        let provisioner = Arc::new(Provisioner::new(registry, Arc::new(orchestrator)));

        info!(%public_address, "Devices will fetch configuration from this address");
        Ok(Self {
            bus,
            provisioner,
            renderer,
            fetches,
            locator,
            public_address,
        })
    }

    fn api_state(&self) -> ApiState {
        ApiState::new(
            Arc::clone(&self.provisioner),
            Arc::clone(&self.renderer),
            Arc::clone(&self.fetches),
            self.public_address.clone(),
        )
    }
}

async fn bind(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))
}

async fn serve(config: ProvisionerConfig) -> Result<()> {
    let services = Services::build(&config).await?;
    let listener = bind(config.listen).await?;
    let shutdown = CancellationToken::new();

    let reaper = services.provisioner.spawn_reaper(
        config.retention(),
        config.reap_interval(),
        shutdown.clone(),
    );

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received SIGINT, shutting down");
        }
        signal.cancel();
    });

    server::serve(listener, services.api_state(), shutdown.clone())
        .await
        .context("HTTP server failed")?;
    shutdown.cancel();
    if let Err(e) = reaper.await {
        warn!("Session reaper task failed: {e}");
    }
    Ok(())
}

async fn provision_one(config: ProvisionerConfig, request: ProvisionRequest) -> Result<()> {
    let services = Services::build(&config).await?;
    let listener = bind(config.listen).await?;
    let shutdown = CancellationToken::new();

    // devices download their scripts from us while the session runs
    let server = tokio::spawn(server::serve(listener, services.api_state(), shutdown.clone()));

    let id = services
        .provisioner
        .start(request)
        .await
        .context("Failed to start provisioning")?;
    println!("Session {id}");

    let mut events = services.bus.subscribe(id).await?;
    let mut failed = true;
    while let Some(event) = events.next().await {
        println!(
            "[{:>3}] {:<8} {}",
            event.sequence,
            event.kind.to_string(),
            event.message
        );
        if event.kind.is_terminal() {
            failed = event.kind == EventKind::Error;
        }
    }

    shutdown.cancel();
    match server.await {
        Ok(Err(e)) => warn!("HTTP server failed: {e}"),
        Err(e) => warn!("HTTP server task failed: {e}"),
        Ok(Ok(())) => {}
    }

    if failed {
        bail!("Provisioning session {id} failed");
    }
    Ok(())
}

async fn locate(config: ProvisionerConfig, mac: &str, timeout: Option<u64>) -> Result<()> {
    let hardware_address = HardwareAddress::parse(mac)?;
    let services = Services::build(&config).await?;
    let timeout = Duration::from_secs(timeout.unwrap_or(config.orchestrator.discovery_timeout_secs));

    let address = services
        .locator
        .locate(&hardware_address, timeout)
        .await
        .with_context(|| format!("Could not locate {hardware_address}"))?;
    println!("{hardware_address} {address}");
    Ok(())
}

async fn render(
    config: ProvisionerConfig,
    mac: Option<String>,
    params: NetworkParams,
) -> Result<()> {
    let services = Services::build(&config).await?;
    let payload = match mac {
        Some(mac) => {
            let hardware_address = HardwareAddress::parse(&mac)?;
            services
                .renderer
                .render_personalized(&hardware_address, &params)
                .await?
        }
        None => services.renderer.render_base(&services.public_address).await?,
    };
    print!("{}", payload.body);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    let mut config = ProvisionerConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Serve {
            listen,
            public_address,
        } => {
            if let Some(listen) = listen {
                config.listen = listen;
            }
            if public_address.is_some() {
                config.public_address = public_address;
            }
            serve(config).await
        }
        Commands::Provision {
            mac,
            password,
            params,
            listen,
            public_address,
        } => {
            if let Some(listen) = listen {
                config.listen = listen;
            }
            if public_address.is_some() {
                config.public_address = public_address;
            }
            let params = params.into_network_params();
            let request = ProvisionRequest {
                hardware_address: Some(mac),
                credentials: password,
                network_address_with_prefix: params.network_address_with_prefix,
                tunnel_username: params.tunnel_username,
                tunnel_password: params.tunnel_password,
                additional_params: params.additional_params,
            };
            provision_one(config, request).await
        }
        Commands::Locate { mac, timeout } => locate(config, &mac, timeout).await,
        Commands::Render {
            mac,
            base: _,
            params,
            public_address,
        } => {
            if public_address.is_some() {
                config.public_address = public_address;
            }
            render(config, mac, params.into_network_params()).await
        }
    }
}
