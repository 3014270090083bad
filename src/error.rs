// Typed errors for every component. The controller is the only place that
// decides what a failure means for the running job.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::transport::RegistrationStatus;

/// What the provisioning service said when it refused to assign the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationFailure {
    pub status: RegistrationStatus,
    pub substatus: Option<String>,
    pub message: Option<String>,
}

impl fmt::Display for RegistrationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.status)?;
        if let Some(substatus) = &self.substatus {
            write!(f, ".{}", substatus)?;
        }
        if let Some(message) = &self.message {
            write!(f, " - {}", message)?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("identity rejected before registration: {0}")]
    InvalidIdentity(String),
    #[error("device registration disabled: {0}")]
    Disabled(RegistrationFailure),
    #[error("device registration failed: {0}")]
    Failed(RegistrationFailure),
    #[error("device left unassigned: {0}")]
    Unassigned(RegistrationFailure),
    #[error("no terminal registration status before the deadline: {0}")]
    Timeout(RegistrationFailure),
}

impl ProvisioningError {
    pub fn failure(&self) -> Option<&RegistrationFailure> {
        match self {
            Self::InvalidIdentity(_) => None,
            Self::Disabled(f) | Self::Failed(f) | Self::Unassigned(f) | Self::Timeout(f) => Some(f),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("identity has no assigned hub yet")]
    NotProvisioned,
    #[error("session handshake with {hub} failed")]
    HandshakeFailed { hub: String },
    #[error("session handshake with {hub} timed out")]
    Timeout { hub: String },
}

#[derive(Debug, Error)]
pub enum TwinError {
    #[error("reported properties were not accepted by the service")]
    FlushFailed,
    #[error("no open session to carry the twin")]
    NotConnected,
    #[error("twin snapshot not received before the deadline")]
    SnapshotUnavailable,
    #[error("malformed twin document: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("twin document is not a JSON object")]
    NotAnObject,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid firmware file name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },
    #[error("firmware download failed: {0}")]
    Network(#[source] io::Error),
    #[error("firmware server answered HTTP {0}")]
    HttpStatus(u16),
    #[error("firmware storage failure: {0}")]
    Storage(#[source] io::Error),
}

/// Compact classification of a job failure, kept on the job and reported to
/// the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidDesired,
    InvalidName,
    Network,
    HttpStatus(u16),
    Storage,
    EmptyImage,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::InvalidDesired => f.write_str("invalid desired properties"),
            ErrorKind::InvalidName => f.write_str("invalid firmware name"),
            ErrorKind::Network => f.write_str("network error"),
            ErrorKind::HttpStatus(code) => write!(f, "HTTP {}", code),
            ErrorKind::Storage => f.write_str("storage error"),
            ErrorKind::EmptyImage => f.write_str("empty firmware image"),
        }
    }
}

impl From<&FetchError> for ErrorKind {
    fn from(err: &FetchError) -> Self {
        match err {
            FetchError::InvalidName { .. } => ErrorKind::InvalidName,
            FetchError::Network(_) => ErrorKind::Network,
            FetchError::HttpStatus(code) => ErrorKind::HttpStatus(*code),
            FetchError::Storage(_) => ErrorKind::Storage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_failure_formats_like_the_service_status() {
        let failure = RegistrationFailure {
            status: RegistrationStatus::Failed,
            substatus: Some("deviceDisabled".into()),
            message: Some("enrollment disabled".into()),
        };
        assert_eq!(failure.to_string(), "Failed.deviceDisabled - enrollment disabled");

        let bare = RegistrationFailure {
            status: RegistrationStatus::Unassigned,
            substatus: None,
            message: None,
        };
        assert_eq!(bare.to_string(), "Unassigned");
    }

    #[test]
    fn fetch_errors_map_to_kinds() {
        assert_eq!(ErrorKind::from(&FetchError::HttpStatus(404)), ErrorKind::HttpStatus(404));
        let storage = FetchError::Storage(io::Error::new(io::ErrorKind::Other, "disk full"));
        assert_eq!(ErrorKind::from(&storage), ErrorKind::Storage);
        assert_eq!(ErrorKind::HttpStatus(404).to_string(), "HTTP 404");
    }
}
