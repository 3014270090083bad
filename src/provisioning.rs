// Device identity and the one-shot registration handshake that assigns it a hub.

use std::fmt;
use std::time::Duration;

use base64::Engine as _;
use zeroize::Zeroizing;

use crate::config::AgentConfig;
use crate::error::{ProvisioningError, RegistrationFailure};
use crate::transport::{
    ProvisioningTransport, RegistrationRequest, RegistrationResult, RegistrationStatus, TrustAnchor,
};

/// Symmetric device key, wiped from memory on drop.
#[derive(Clone)]
pub struct SharedKey(Zeroizing<Vec<u8>>);

impl SharedKey {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn from_base64(encoded: &str) -> anyhow::Result<Self> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| anyhow::anyhow!("Device key is not valid base64: {}", e))?;
        Ok(Self::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedKey(<{} bytes>)", self.0.len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignedConnection {
    pub assigned_hub: String,
    pub device_id: String,
}

#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    provisioning_endpoint: String,
    id_scope: String,
    registration_id: String,
    shared_key: SharedKey,
    assignment: Option<AssignedConnection>,
}

impl DeviceIdentity {
    pub fn new(
        provisioning_endpoint: impl Into<String>,
        id_scope: impl Into<String>,
        registration_id: impl Into<String>,
        shared_key: SharedKey,
    ) -> Self {
        Self {
            provisioning_endpoint: provisioning_endpoint.into(),
            id_scope: id_scope.into(),
            registration_id: registration_id.into(),
            shared_key,
            assignment: None,
        }
    }

    pub fn from_config(config: &AgentConfig) -> anyhow::Result<Self> {
        Ok(Self::new(
            config.provisioning_endpoint.clone(),
            config.id_scope.clone(),
            config.registration_id.clone(),
            SharedKey::from_base64(&config.device_key)?,
        ))
    }

    pub fn provisioning_endpoint(&self) -> &str {
        &self.provisioning_endpoint
    }

    pub fn id_scope(&self) -> &str {
        &self.id_scope
    }

    pub fn registration_id(&self) -> &str {
        &self.registration_id
    }

    pub fn shared_key(&self) -> &SharedKey {
        &self.shared_key
    }

    pub fn assignment(&self) -> Option<&AssignedConnection> {
        self.assignment.as_ref()
    }

    pub fn assigned_hub(&self) -> Option<&str> {
        self.assignment.as_ref().map(|a| a.assigned_hub.as_str())
    }

    pub fn device_id(&self) -> Option<&str> {
        self.assignment.as_ref().map(|a| a.device_id.as_str())
    }

    fn check_inputs(&self) -> Result<(), ProvisioningError> {
        if self.id_scope.is_empty() {
            return Err(ProvisioningError::InvalidIdentity("ID scope is empty".into()));
        }
        if self.registration_id.is_empty() {
            return Err(ProvisioningError::InvalidIdentity("registration ID is empty".into()));
        }
        if self.shared_key.is_empty() {
            return Err(ProvisioningError::InvalidIdentity("shared key is empty".into()));
        }
        Ok(())
    }
}

pub struct IdentityProvisioner<P> {
    transport: P,
    trust_anchor: TrustAnchor,
    deadline: Duration,
}

impl<P: ProvisioningTransport> IdentityProvisioner<P> {
    pub fn new(transport: P, trust_anchor: TrustAnchor, deadline: Duration) -> Self {
        Self {
            transport,
            trust_anchor,
            deadline,
        }
    }

    /// Run the registration handshake and record the assignment on `identity`.
    ///
    /// An identity that already carries an assignment is returned as is; the
    /// assignment never changes for the lifetime of the process.
    pub fn register(&mut self, identity: &mut DeviceIdentity) -> Result<AssignedConnection, ProvisioningError> {
        if let Some(existing) = identity.assignment() {
            log::debug!("Identity already assigned to {}", existing.assigned_hub);
            return Ok(existing.clone());
        }
        identity.check_inputs()?;

        log::info!(
            "Registering '{}' with {} (scope {})",
            identity.registration_id,
            identity.provisioning_endpoint,
            identity.id_scope
        );

        let request = RegistrationRequest {
            endpoint: &identity.provisioning_endpoint,
            id_scope: &identity.id_scope,
            registration_id: &identity.registration_id,
            key: identity.shared_key.as_bytes(),
            trust_anchor: &self.trust_anchor,
            deadline: self.deadline,
        };
        let result = self.transport.register(&request);

        match interpret(result) {
            Ok(assigned) => {
                log::info!("Device '{}' assigned to hub {}", assigned.device_id, assigned.assigned_hub);
                identity.assignment = Some(assigned.clone());
                Ok(assigned)
            }
            Err(e) => {
                log::error!("Device could not be registered: {}", e);
                Err(e)
            }
        }
    }
}

fn interpret(result: RegistrationResult) -> Result<AssignedConnection, ProvisioningError> {
    let failure = |result: RegistrationResult| RegistrationFailure {
        status: result.status,
        substatus: result.substatus,
        message: result.error_message,
    };

    match result.status {
        RegistrationStatus::Assigned => {
            let hub = result.assigned_hub.clone().filter(|h| !h.is_empty());
            let device = result.device_id.clone().filter(|d| !d.is_empty());
            match (hub, device) {
                (Some(assigned_hub), Some(device_id)) => Ok(AssignedConnection {
                    assigned_hub,
                    device_id,
                }),
                _ => {
                    let mut f = failure(result);
                    f.message.get_or_insert_with(|| "assignment without hub or device ID".into());
                    Err(ProvisioningError::Failed(f))
                }
            }
        }
        RegistrationStatus::Disabled => Err(ProvisioningError::Disabled(failure(result))),
        RegistrationStatus::Failed => Err(ProvisioningError::Failed(failure(result))),
        RegistrationStatus::Unassigned => Err(ProvisioningError::Unassigned(failure(result))),
        RegistrationStatus::Assigning => Err(ProvisioningError::Timeout(failure(result))),
    }
}
