// Startup path and event loop: provision once, open the session, then feed
// inbound session events to the controller one at a time until an update asks
// for a restart.

use std::path::PathBuf;
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::config::AgentConfig;
use crate::connection::ConnectionLifecycle;
use crate::error::{ConnectionError, ProvisioningError};
use crate::fetcher::FirmwareFetcher;
use crate::logging;
use crate::ota::{OtaController, RestartRequest};
use crate::provisioning::{DeviceIdentity, IdentityProvisioner};
use crate::transport::{CloudTransport, HttpTransport, ProvisioningTransport, SessionEvent, Storage};
use crate::version;

const IDLE_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("provisioning failed: {0}")]
    Provisioning(#[from] ProvisioningError),
    #[error("session unavailable: {0}")]
    Connection(#[from] ConnectionError),
    #[error("session event channel closed")]
    EventsClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub backoff: Duration,
    pub max_backoff: Duration,
    /// 0 retries forever
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            backoff: Duration::from_secs(config.reconnect_backoff_secs),
            max_backoff: Duration::from_secs(config.reconnect_max_backoff_secs),
            max_attempts: config.max_reconnect_attempts,
        }
    }

    /// Exponential delay before attempt `attempt` (1-based), capped
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(4);
        self.backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

pub struct Agent<P, C, H, S> {
    identity: DeviceIdentity,
    provisioner: IdentityProvisioner<P>,
    controller: OtaController<C, H, S>,
    events: Receiver<SessionEvent>,
    reconnect: ReconnectPolicy,
}

impl<P, C, H, S> Agent<P, C, H, S>
where
    P: ProvisioningTransport,
    C: CloudTransport,
    H: HttpTransport,
    S: Storage,
{
    pub fn new(
        identity: DeviceIdentity,
        provisioner: IdentityProvisioner<P>,
        controller: OtaController<C, H, S>,
        events: Receiver<SessionEvent>,
        reconnect: ReconnectPolicy,
    ) -> Self {
        Self {
            identity,
            provisioner,
            controller,
            events,
            reconnect,
        }
    }

    /// Wire the agent from configuration. `events` is the receiving end of the
    /// channel the cloud transport pushes into.
    pub fn from_config(
        config: &AgentConfig,
        provisioning: P,
        cloud: C,
        http: H,
        storage: S,
        events: Receiver<SessionEvent>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        if logging::set_max_level_from_str(&config.log_level) {
            log::info!("Log level set to {}", config.log_level);
        }
        let root = PathBuf::from(&config.storage_root);
        let current_version = version::load_committed(&storage, &root)?;

        let identity = DeviceIdentity::from_config(config)?;
        let provisioner =
            IdentityProvisioner::new(provisioning, config.provisioning_trust_anchor()?, config.provisioning_deadline());
        let connection = ConnectionLifecycle::new(cloud, config.hub_trust_anchor()?, config.qos, config.snapshot_deadline());
        let fetcher = FirmwareFetcher::new(
            http,
            storage,
            root,
            &config.firmware_extension,
            config.download_trust_anchor()?,
        );
        let controller = OtaController::new(connection, fetcher, current_version, config.ota_policy());

        Ok(Self::new(
            identity,
            provisioner,
            controller,
            events,
            ReconnectPolicy::from_config(config),
        ))
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn controller(&self) -> &OtaController<C, H, S> {
        &self.controller
    }

    /// Provision, open the session and take the initial twin snapshot.
    /// Nothing is opened when provisioning fails.
    pub fn start(&mut self) -> Result<(), AgentError> {
        self.provisioner.register(&mut self.identity)?;
        self.controller.connect(&self.identity)?;
        Ok(())
    }

    /// Reopen the session if the last update attempt closed it, then drain
    /// queued events without blocking and run the controller.
    pub fn poll(&mut self) -> Result<Option<RestartRequest>, AgentError> {
        if self.controller.wants_reopen() {
            self.reconnect()?;
        }
        loop {
            match self.events.try_recv() {
                Ok(event) => self.controller.handle_event(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        Ok(self.controller.run_pending())
    }

    /// Block until an update is ready for a restart.
    pub fn run(&mut self) -> Result<RestartRequest, AgentError> {
        loop {
            if let Some(request) = self.poll()? {
                return Ok(request);
            }
            match self.events.recv_timeout(IDLE_WAIT) {
                Ok(event) => self.controller.handle_event(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Err(AgentError::EventsClosed),
            }
        }
    }

    /// Persist the version of a verified image before the platform reboots.
    pub fn commit_restart(&mut self, request: &RestartRequest) -> anyhow::Result<()> {
        let root = self.controller.fetcher().root().to_path_buf();
        version::commit(self.controller.fetcher_mut().storage_mut(), &root, request)
    }

    fn reconnect(&mut self) -> Result<(), ConnectionError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let delay = self.reconnect.delay(attempt);
            if !delay.is_zero() {
                log::info!("Backoff {}s before reconnection attempt", delay.as_secs());
                thread::sleep(delay);
            }
            match self.controller.connect(&self.identity) {
                Ok(()) => {
                    if attempt > 1 {
                        log::warn!("Session reopened after {} attempts", attempt);
                    }
                    return Ok(());
                }
                Err(e) if self.reconnect.max_attempts == 0 || attempt < self.reconnect.max_attempts => {
                    log::warn!("Reconnect attempt #{} failed: {}", attempt, e);
                }
                Err(e) => {
                    log::error!("Giving up on the session after {} attempts", attempt);
                    return Err(e);
                }
            }
        }
    }
}
