// Capabilities the agent consumes but does not implement: the provisioning
// exchange, the pub/sub cloud session, secured HTTP and raw file storage.

use std::fmt;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Root certificate material handed to every secured transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustAnchor {
    /// PEM encoded root certificate(s)
    Pem(Arc<str>),
    /// The platform's built-in certificate bundle
    PlatformBundle,
}

impl TrustAnchor {
    pub fn pem(pem: impl Into<Arc<str>>) -> Self {
        TrustAnchor::Pem(pem.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStatus {
    Unassigned,
    Assigning,
    Assigned,
    Failed,
    Disabled,
}

impl fmt::Display for RegistrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RegistrationStatus::Unassigned => "Unassigned",
            RegistrationStatus::Assigning => "Assigning",
            RegistrationStatus::Assigned => "Assigned",
            RegistrationStatus::Failed => "Failed",
            RegistrationStatus::Disabled => "Disabled",
        };
        f.write_str(s)
    }
}

pub struct RegistrationRequest<'a> {
    pub endpoint: &'a str,
    pub id_scope: &'a str,
    pub registration_id: &'a str,
    pub key: &'a [u8],
    pub trust_anchor: &'a TrustAnchor,
    /// The transport must give up and report its last status after this long
    pub deadline: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationResult {
    pub status: RegistrationStatus,
    pub substatus: Option<String>,
    pub assigned_hub: Option<String>,
    pub device_id: Option<String>,
    pub error_message: Option<String>,
}

pub trait ProvisioningTransport {
    fn register(&mut self, request: &RegistrationRequest<'_>) -> RegistrationResult;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum Qos {
    #[default]
    AtMostOnce,
    AtLeastOnce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    Connected,
    Rejected,
    TimedOut,
}

/// Events the session transport pushes into the agent's inbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Desired-property patch as raw JSON
    TwinChanged(String),
    ConnectionStatusChanged { status: String, message: String },
}

pub trait CloudTransport {
    fn open(
        &mut self,
        hub: &str,
        device_id: &str,
        key: &[u8],
        qos: Qos,
        trust_anchor: &TrustAnchor,
    ) -> OpenOutcome;
    fn close(&mut self);
    fn is_connected(&self) -> bool;
    /// Full twin document as raw JSON, `None` if it did not arrive in time
    fn get_twin(&mut self, deadline: Duration) -> Option<String>;
    /// Publish a reported-properties document; `true` once the service accepted it
    fn update_reported(&mut self, payload: &str) -> bool;
}

pub struct HttpResponse<'a> {
    pub status: u16,
    pub body: Box<dyn Read + 'a>,
}

impl HttpResponse<'_> {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub trait HttpTransport {
    fn get<'a>(&'a mut self, url: &str, trust_anchor: &TrustAnchor) -> io::Result<HttpResponse<'a>>;
}

/// A freshly created file. Dropping it without `finish` leaves the contents
/// unspecified.
pub trait FileSink: Write {
    /// Flush, sync and close. The bytes are durable once this returns `Ok`.
    fn finish(self: Box<Self>) -> io::Result<()>;
}

pub trait Storage {
    fn list_files(&self, root: &Path) -> io::Result<Vec<PathBuf>>;
    fn delete(&mut self, path: &Path) -> io::Result<()>;
    /// Create (or truncate) `path` for writing
    fn create<'a>(&'a mut self, path: &Path) -> io::Result<Box<dyn FileSink + 'a>>;
    fn open_read<'a>(&'a self, path: &Path) -> io::Result<Box<dyn Read + 'a>>;
    /// Size in bytes, `None` if the file does not exist
    fn file_len(&self, path: &Path) -> io::Result<Option<u64>>;
}

pub fn read_to_string(storage: &dyn Storage, path: &Path) -> io::Result<String> {
    let mut contents = String::new();
    storage.open_read(path)?.read_to_string(&mut contents)?;
    Ok(contents)
}

pub fn write_all(storage: &mut dyn Storage, path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut sink = storage.create(path)?;
    sink.write_all(bytes)?;
    sink.finish()
}
