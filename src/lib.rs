//! Twin OTA agent - provisioning, twin sync and firmware replacement for a
//! constrained device.
//!
//! Everything in this crate runs on the host as well as on the device. The
//! transports (provisioning, pub/sub session, HTTPS, raw storage) are consumed
//! through the traits in [`transport`]; ESP-IDF implementations live in
//! [`platform`] and are only compiled for `target_os = "espidf"`.

pub mod agent;
pub mod config;
pub mod connection;
pub mod error;
pub mod fetcher;
pub mod logging;
pub mod ota;
pub mod platform;
pub mod provisioning;
pub mod storage;
pub mod trace;
pub mod transport;
pub mod twin;
pub mod validators;
pub mod version;

#[cfg(test)]
mod testing;

#[cfg(test)]
mod tests;

pub use agent::{Agent, AgentError, ReconnectPolicy};
pub use config::AgentConfig;
pub use connection::{ConnectionLifecycle, Session};
pub use error::{ConnectionError, ErrorKind, FetchError, ProvisioningError, TwinError};
pub use fetcher::FirmwareFetcher;
pub use ota::{OtaController, OtaState, RestartRequest, UpdatePhase};
pub use provisioning::{AssignedConnection, DeviceIdentity, IdentityProvisioner};
pub use twin::{DesiredChangeSet, PropertyMap, TwinDocument, TwinStore};
