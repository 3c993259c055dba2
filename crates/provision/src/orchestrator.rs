//! Provisioning state machine.
//!
//! One [`SessionOrchestrator::run`] call drives one session from `created`
//! to a terminal state:
//!
//! ```text
//! discovering -> discovered -> connecting -> base_delivered
//!     -> personalizing -> awaiting_fetch -> completed
//! ```
//!
//! Every transition appends exactly one event. The first failing step ends
//! the run with a single `error` event; nothing is retried here.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{DiscoveryError, ProvisionError, RenderError, TransportError};
use crate::executor::RemoteExecutor;
use crate::fetch::FetchLedger;
use crate::locator::DeviceLocator;
use crate::mac::HardwareAddress;
use crate::render::{ConfigPayload, ConfigRenderer};
use crate::session::{Credentials, NetworkParams, Session, SessionState};
use crate::status::{EventKind, EventPublisher};

/// RouterOS command that makes the device pull and import the base script.
pub const DEFAULT_BOOTSTRAP_COMMAND: &str =
    "/tool fetch url={base_url}/config/base.rsc dst-path=base.rsc; :delay 2s; /import file-name=base.rsc";

/// Step timeouts and completion policy.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub discovery_timeout: Duration,
    pub command_timeout: Duration,
    pub render_timeout: Duration,
    /// How long to wait for the device-side scheduled fetch.
    pub grace_interval: Duration,
    /// Complete only once the device downloads its payload.
    pub require_fetch_confirmation: bool,
    /// How long confirmation mode waits for that download; at least
    /// `grace_interval`.
    pub fetch_confirmation_timeout: Duration,
    /// Bootstrap command; `{base_url}` is replaced with [`Self::base_url`].
    pub bootstrap_command: String,
    /// URL devices use to reach this server, e.g. `http://192.168.88.10:5000`.
    pub base_url: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            discovery_timeout: Duration::from_secs(90),
            command_timeout: Duration::from_secs(30),
            render_timeout: Duration::from_secs(10),
            grace_interval: Duration::from_secs(30),
            require_fetch_confirmation: false,
            fetch_confirmation_timeout: Duration::from_secs(60),
            bootstrap_command: DEFAULT_BOOTSTRAP_COMMAND.to_string(),
            base_url: "http://127.0.0.1:5000".to_string(),
        }
    }
}

impl OrchestratorConfig {
    /// The bootstrap command with the server URL filled in.
    #[must_use]
    pub fn bootstrap_command(&self) -> String {
        self.bootstrap_command
            .replace("{base_url}", self.base_url.trim_end_matches('/'))
    }
}

/// Drives sessions through discovery, delivery and personalization.
pub struct SessionOrchestrator {
    locator: Arc<dyn DeviceLocator>,
    executor: Arc<dyn RemoteExecutor>,
    renderer: Arc<dyn ConfigRenderer>,
    fetches: Arc<FetchLedger>,
    config: OrchestratorConfig,
}

impl SessionOrchestrator {
    #[must_use]
    pub fn new(
        locator: Arc<dyn DeviceLocator>,
        executor: Arc<dyn RemoteExecutor>,
        renderer: Arc<dyn ConfigRenderer>,
        fetches: Arc<FetchLedger>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            locator,
            executor,
            renderer,
            fetches,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run one session to its terminal state and return that state.
    ///
    /// Cancelling `cancel` aborts whichever step is in flight and records a
    /// `cancelled` event.
    #[instrument(skip_all, fields(session_id = %session.id, hardware_address = %session.hardware_address))]
    pub async fn run(
        &self,
        session: Session,
        publisher: EventPublisher,
        cancel: CancellationToken,
    ) -> SessionState {
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ProvisionError::Cancelled),
            result = self.drive(&session, &publisher) => result,
        };

        match outcome {
            Ok(state) => {
                info!(state = %state, "Provisioning finished");
                state
            }
            Err(err) => record_failure(&publisher, &err).await,
        }
    }

    async fn drive(
        &self,
        session: &Session,
        publisher: &EventPublisher,
    ) -> Result<SessionState, ProvisionError> {
        let hardware_address = session.hardware_address;

        emit(
            publisher,
            format!("Scanning network for {hardware_address}"),
            SessionState::Discovering,
        )
        .await;
        let address = self.discover(&hardware_address).await?;
        emit(
            publisher,
            format!("Device found at {address}"),
            SessionState::Discovered,
        )
        .await;

        emit(
            publisher,
            format!("Connecting to {address}"),
            SessionState::Connecting,
        )
        .await;
        self.deliver_base(address, &session.credentials).await?;
        emit(
            publisher,
            "Base configuration fetch sent",
            SessionState::BaseDelivered,
        )
        .await;

        emit(
            publisher,
            "Generating personalized configuration",
            SessionState::Personalizing,
        )
        .await;
        let payload = self
            .personalize(&hardware_address, &session.network_params)
            .await?;
        emit(
            publisher,
            format!(
                "Waiting for device to fetch {} (up to {}s)",
                payload.name,
                self.fetch_window().as_secs()
            ),
            SessionState::AwaitingFetch,
        )
        .await;

        let message = self.await_fetch(&hardware_address, &payload).await?;
        if let Err(e) = publisher
            .append(message, EventKind::Success, SessionState::Completed)
            .await
        {
            warn!("Failed to record completion: {e}");
        }
        Ok(SessionState::Completed)
    }

    fn fetch_window(&self) -> Duration {
        if self.config.require_fetch_confirmation {
            self.config.fetch_confirmation_timeout
        } else {
            self.config.grace_interval
        }
    }

    async fn discover(&self, hardware_address: &HardwareAddress) -> Result<IpAddr, ProvisionError> {
        let timeout = self.config.discovery_timeout;
        match tokio::time::timeout(timeout, self.locator.locate(hardware_address, timeout)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(DiscoveryError::ScanTimeout(timeout.as_secs()).into()),
        }
    }

    async fn deliver_base(
        &self,
        address: IpAddr,
        credentials: &Credentials,
    ) -> Result<(), ProvisionError> {
        let command = self.config.bootstrap_command();
        let timeout = self.config.command_timeout;
        debug!(%address, command, "Sending bootstrap command");

        let output = tokio::time::timeout(
            timeout,
            self.executor.run(address, &command, credentials, timeout),
        )
        .await
        .map_err(|_| TransportError::ConnectionTimeout)??;

        if !output.success() {
            return Err(TransportError::CommandFailed {
                exit_status: output.exit_status,
                stderr: output.stderr,
            }
            .into());
        }
        Ok(())
    }

    async fn personalize(
        &self,
        hardware_address: &HardwareAddress,
        params: &NetworkParams,
    ) -> Result<ConfigPayload, ProvisionError> {
        let timeout = self.config.render_timeout;
        tokio::time::timeout(
            timeout,
            self.renderer.render_personalized(hardware_address, params),
        )
        .await
        .map_err(|_| {
            RenderError::PersistFailed(format!("rendering timed out after {}s", timeout.as_secs()))
        })?
        .map_err(Into::into)
    }

    /// Wait out the grace interval, returning the completion message.
    async fn await_fetch(
        &self,
        hardware_address: &HardwareAddress,
        payload: &ConfigPayload,
    ) -> Result<String, ProvisionError> {
        let grace = self.config.grace_interval;
        let rendered_at: DateTime<Utc> = payload.rendered_at;

        if self.config.require_fetch_confirmation {
            let window = self.config.fetch_confirmation_timeout;
            return if self.fetches.wait_for(hardware_address, rendered_at, window).await {
                Ok(format!(
                    "Device fetched {}; import not confirmed",
                    payload.name
                ))
            } else {
                Err(ProvisionError::FetchTimedOut(window.as_secs()))
            };
        }

        tokio::time::sleep(grace).await;
        if self.fetches.fetched_since(hardware_address, rendered_at).await {
            Ok(format!(
                "Configuration delivered and {} fetched by device; import not confirmed",
                payload.name
            ))
        } else {
            Ok("Configuration delivery steps completed; device fetch and import not confirmed".to_string())
        }
    }
}

async fn emit(publisher: &EventPublisher, message: impl Into<String>, state: SessionState) {
    // only fails after a terminal event, which drive never writes early
    if let Err(e) = publisher.append(message, EventKind::Info, state).await {
        warn!("Failed to record progress: {e}");
    }
}

async fn record_failure(publisher: &EventPublisher, err: &ProvisionError) -> SessionState {
    let state = err.terminal_state();
    match publisher.fail(err.to_string(), state, err.kind()).await {
        Ok(_) => state,
        Err(e) => {
            // cancellation raced with a completed run
            debug!("Terminal event already recorded: {e}");
            publisher.latest().await.map_or(state, |event| event.state)
        }
    }
}
