//! Service facade tying the registry to the orchestrator.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::RegistryError;
use crate::mac::{HardwareAddress, InvalidHardwareAddress};
use crate::orchestrator::SessionOrchestrator;
use crate::registry::{NewSession, SessionRegistry};
use crate::session::{Credentials, NetworkParams, SessionId, SessionState};

/// Body of a provisioning request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProvisionRequest {
    /// Required; accepted in any separator style.
    #[serde(default)]
    pub hardware_address: Option<String>,
    /// Remote shell password; empty or absent means the device default.
    #[serde(default, alias = "password")]
    pub credentials: Option<String>,
    #[serde(default)]
    pub network_address_with_prefix: Option<String>,
    #[serde(default)]
    pub tunnel_username: Option<String>,
    #[serde(default)]
    pub tunnel_password: Option<String>,
    #[serde(default)]
    pub additional_params: BTreeMap<String, serde_json::Value>,
}

impl ProvisionRequest {
    /// Request for `hardware_address` with no other parameters.
    #[must_use]
    pub fn for_address(hardware_address: impl Into<String>) -> Self {
        Self {
            hardware_address: Some(hardware_address.into()),
            ..Self::default()
        }
    }

    fn into_parts(self) -> Result<(HardwareAddress, Credentials, NetworkParams), StartError> {
        let raw = self
            .hardware_address
            .filter(|s| !s.trim().is_empty())
            .ok_or(StartError::MissingHardwareAddress)?;
        let hardware_address = HardwareAddress::parse(&raw)?;
        let credentials = self.credentials.map_or_else(Credentials::empty, Credentials::password);
        let params = NetworkParams {
            network_address_with_prefix: self.network_address_with_prefix,
            tunnel_username: self.tunnel_username,
            tunnel_password: self.tunnel_password,
            additional_params: self.additional_params,
        };
        Ok((hardware_address, credentials, params))
    }
}

/// Why a session could not be started.
#[derive(Error, Debug)]
pub enum StartError {
    #[error("hardware_address is required")]
    MissingHardwareAddress,

    #[error(transparent)]
    InvalidHardwareAddress(#[from] InvalidHardwareAddress),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl StartError {
    /// Caller mistakes, as opposed to server-side failures.
    #[must_use]
    pub fn is_bad_request(&self) -> bool {
        matches!(
            self,
            Self::MissingHardwareAddress | Self::InvalidHardwareAddress(_)
        )
    }
}

/// Creates sessions and runs them in the background.
pub struct Provisioner {
    registry: Arc<SessionRegistry>,
    orchestrator: Arc<SessionOrchestrator>,
}

impl Provisioner {
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>, orchestrator: Arc<SessionOrchestrator>) -> Self {
        Self {
            registry,
            orchestrator,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn orchestrator(&self) -> &Arc<SessionOrchestrator> {
        &self.orchestrator
    }

    async fn create(&self, request: ProvisionRequest) -> Result<NewSession, StartError> {
        let (hardware_address, credentials, params) = request.into_parts()?;
        Ok(self
            .registry
            .create(hardware_address, credentials, params)
            .await?)
    }

    /// Register a session and start provisioning it on a background task.
    ///
    /// # Errors
    ///
    /// Returns an error if the request is invalid or the session cannot be
    /// registered.
    pub async fn start(&self, request: ProvisionRequest) -> Result<SessionId, StartError> {
        let NewSession {
            session,
            publisher,
            cancel,
        } = self.create(request).await?;
        let id = session.id;

        let orchestrator = Arc::clone(&self.orchestrator);
        tokio::spawn(async move {
            orchestrator.run(session, publisher, cancel).await;
        });
        Ok(id)
    }

    /// Register a session and provision it on the current task.
    ///
    /// # Errors
    ///
    /// Returns an error if the request is invalid or the session cannot be
    /// registered. Provisioning failures are reported through the returned
    /// state and the session's events.
    pub async fn run_to_completion(
        &self,
        request: ProvisionRequest,
    ) -> Result<(SessionId, SessionState), StartError> {
        let NewSession {
            session,
            publisher,
            cancel,
        } = self.create(request).await?;
        let id = session.id;
        let state = self.orchestrator.run(session, publisher, cancel).await;
        Ok((id, state))
    }

    /// Periodically evict sessions older than `retention` until `shutdown`.
    pub fn spawn_reaper(
        &self,
        retention: Duration,
        every: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            let Ok(max_age) = chrono::Duration::from_std(retention) else {
                warn!("Retention window too large, session reaper disabled");
                return;
            };
            let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
            // the first tick completes immediately
            ticker.tick().await;
            info!(
                retention_secs = retention.as_secs(),
                interval_secs = every.as_secs(),
                "Session reaper started"
            );

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = registry.evict_older_than(max_age).await {
                            warn!("Session eviction failed: {e}");
                        }
                    }
                }
            }
            info!("Session reaper stopped");
        })
    }
}
