//! Shared fakes for the integration tests.

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use provision::executor::{CommandOutput, RemoteExecutor};
use provision::fetch::FetchLedger;
use provision::locator::DeviceLocator;
use provision::render::{ConfigRenderer, MemoryConfigStore, RenderSettings, RouterOsRenderer};
use provision::{
    Credentials, DiscoveryError, HardwareAddress, OrchestratorConfig, Provisioner,
    SessionOrchestrator, SessionRegistry, StatusBus, TransportError,
};

pub const DEVICE_MAC: &str = "AA:BB:CC:DD:EE:FF";
pub const DEVICE_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 88, 1));
pub const SERVER_ADDRESS: &str = "192.168.88.10:5000";

pub fn device() -> HardwareAddress {
    HardwareAddress::parse(DEVICE_MAC).unwrap()
}

/// Locator that finds the device at a fixed address, never does, or hangs.
pub struct FakeLocator {
    found: Option<IpAddr>,
    hang: bool,
    pub calls: AtomicUsize,
}

impl FakeLocator {
    pub fn found(address: IpAddr) -> Self {
        Self {
            found: Some(address),
            hang: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn missing() -> Self {
        Self {
            found: None,
            hang: false,
            calls: AtomicUsize::new(0),
        }
    }

    /// Never answers.
    pub fn hanging() -> Self {
        Self {
            found: None,
            hang: true,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl DeviceLocator for FakeLocator {
    async fn locate(
        &self,
        _hardware_address: &HardwareAddress,
        _timeout: Duration,
    ) -> Result<IpAddr, DiscoveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang {
            std::future::pending::<()>().await;
        }
        self.found.ok_or(DiscoveryError::NotFound)
    }
}

/// Executor returning scripted outcomes, one per call, repeating the last.
pub struct FakeExecutor {
    outcomes: Vec<Result<CommandOutput, TransportError>>,
    hang: bool,
    pub calls: AtomicUsize,
    pub commands: Mutex<Vec<(IpAddr, String, String)>>,
}

impl FakeExecutor {
    pub fn scripted(outcomes: Vec<Result<CommandOutput, TransportError>>) -> Self {
        Self {
            outcomes,
            hang: false,
            calls: AtomicUsize::new(0),
            commands: Mutex::new(Vec::new()),
        }
    }

    /// Accepts the command and never returns.
    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::succeeding()
        }
    }

    pub fn exiting(exit_status: i32, stderr: &str) -> Self {
        Self::scripted(vec![Ok(CommandOutput {
            exit_status,
            stdout: String::new(),
            stderr: stderr.to_string(),
        })])
    }

    pub fn succeeding() -> Self {
        Self::exiting(0, "")
    }
}

#[async_trait]
impl RemoteExecutor for FakeExecutor {
    async fn run(
        &self,
        address: IpAddr,
        command: &str,
        credentials: &Credentials,
        _timeout: Duration,
    ) -> Result<CommandOutput, TransportError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.commands.lock().await.push((
            address,
            command.to_string(),
            credentials.secret().to_string(),
        ));
        if self.hang {
            std::future::pending::<()>().await;
        }
        let index = call.min(self.outcomes.len().saturating_sub(1));
        self.outcomes
            .get(index)
            .cloned()
            .unwrap_or(Err(TransportError::Spawn("no scripted outcome".into())))
    }
}

/// A provisioner wired to fakes, with handles to everything tests inspect.
pub struct Harness {
    pub bus: Arc<StatusBus>,
    pub registry: Arc<SessionRegistry>,
    pub provisioner: Arc<Provisioner>,
    pub locator: Arc<FakeLocator>,
    pub executor: Arc<FakeExecutor>,
    pub renderer: Arc<RouterOsRenderer>,
    pub fetches: Arc<FetchLedger>,
}

impl Harness {
    pub fn new(locator: FakeLocator, executor: FakeExecutor, config: OrchestratorConfig) -> Self {
        let locator = Arc::new(locator);
        let executor = Arc::new(executor);
        let renderer = Arc::new(
            RouterOsRenderer::new(Arc::new(MemoryConfigStore::new()), RenderSettings::default())
                .unwrap(),
        );
        let fetches = Arc::new(FetchLedger::new());

        let orchestrator = SessionOrchestrator::new(
            Arc::clone(&locator) as Arc<dyn DeviceLocator>,
            Arc::clone(&executor) as Arc<dyn RemoteExecutor>,
            Arc::clone(&renderer) as Arc<dyn ConfigRenderer>,
            Arc::clone(&fetches),
            config,
        );
        let bus = Arc::new(StatusBus::new());
        let registry = Arc::new(SessionRegistry::in_memory(Arc::clone(&bus)));
        let provisioner = Arc::new(Provisioner::new(
            Arc::clone(&registry),
            Arc::new(orchestrator),
        ));

        Self {
            bus,
            registry,
            provisioner,
            locator,
            executor,
            renderer,
            fetches,
        }
    }

    /// Harness whose device is found and accepts the bootstrap command.
    pub fn happy(config: OrchestratorConfig) -> Self {
        Self::new(
            FakeLocator::found(DEVICE_IP),
            FakeExecutor::succeeding(),
            config,
        )
    }
}

pub fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        grace_interval: Duration::from_secs(5),
        base_url: format!("http://{SERVER_ADDRESS}"),
        ..OrchestratorConfig::default()
    }
}
