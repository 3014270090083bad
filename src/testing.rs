// Recording fakes for every capability. All of them append to one shared
// effect log so tests can assert the order of side effects.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use crate::provisioning::{DeviceIdentity, IdentityProvisioner, SharedKey};
use crate::transport::{
    CloudTransport, FileSink, HttpResponse, HttpTransport, OpenOutcome, ProvisioningTransport, Qos,
    RegistrationRequest, RegistrationResult, RegistrationStatus, Storage, TrustAnchor,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Registered { registration_id: String },
    SessionOpened { hub: String },
    SessionClosed,
    TwinRequested,
    Reported(String),
    Listed,
    Deleted(PathBuf),
    HttpGet(String),
    FileCreated(PathBuf),
    FileFinished(PathBuf),
}

#[derive(Debug, Clone, Default)]
pub struct EffectLog(Rc<RefCell<Vec<Effect>>>);

impl EffectLog {
    pub fn push(&self, effect: Effect) {
        self.0.borrow_mut().push(effect);
    }

    pub fn entries(&self) -> Vec<Effect> {
        self.0.borrow().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    pub fn count(&self, pred: impl Fn(&Effect) -> bool) -> usize {
        self.0.borrow().iter().filter(|e| pred(e)).count()
    }

    pub fn position(&self, pred: impl Fn(&Effect) -> bool) -> Option<usize> {
        self.0.borrow().iter().position(|e| pred(e))
    }
}

pub struct FakeProvisioning {
    result: RegistrationResult,
    log: EffectLog,
}

impl FakeProvisioning {
    pub fn new(result: RegistrationResult, log: EffectLog) -> Self {
        Self { result, log }
    }

    pub fn assigned(hub: &str, device_id: &str) -> RegistrationResult {
        RegistrationResult {
            status: RegistrationStatus::Assigned,
            substatus: None,
            assigned_hub: Some(hub.to_string()),
            device_id: Some(device_id.to_string()),
            error_message: None,
        }
    }

    pub fn refused(status: RegistrationStatus, substatus: Option<&str>) -> RegistrationResult {
        RegistrationResult {
            status,
            substatus: substatus.map(str::to_string),
            assigned_hub: None,
            device_id: None,
            error_message: Some("refused by test".to_string()),
        }
    }
}

impl ProvisioningTransport for FakeProvisioning {
    fn register(&mut self, request: &RegistrationRequest<'_>) -> RegistrationResult {
        self.log.push(Effect::Registered {
            registration_id: request.registration_id.to_string(),
        });
        self.result.clone()
    }
}

/// An identity that went through a successful registration.
pub fn assigned_identity() -> DeviceIdentity {
    let mut identity = DeviceIdentity::new(
        "global.azure-devices-provisioning.net",
        "0ne0001",
        "aca-esp-sk01",
        SharedKey::new(b"secret".to_vec()),
    );
    let mut provisioner = IdentityProvisioner::new(
        FakeProvisioning::new(FakeProvisioning::assigned("hub.example.net", "dev-1"), EffectLog::default()),
        TrustAnchor::pem("ROOT"),
        Duration::from_secs(1),
    );
    provisioner.register(&mut identity).expect("fake registration succeeds");
    identity
}

struct CloudState {
    outcomes: VecDeque<OpenOutcome>,
    connected: bool,
    twin: Option<String>,
    accept_reports: bool,
}

/// Pub/sub session fake. Clones share state so a test can keep a handle after
/// moving the transport into a lifecycle.
#[derive(Clone)]
pub struct FakeCloud {
    state: Rc<RefCell<CloudState>>,
    log: EffectLog,
}

impl FakeCloud {
    pub fn new(log: EffectLog) -> Self {
        Self {
            state: Rc::new(RefCell::new(CloudState {
                outcomes: VecDeque::new(),
                connected: false,
                twin: Some(r#"{"properties":{"desired":{},"reported":{}}}"#.to_string()),
                accept_reports: true,
            })),
            log,
        }
    }

    pub fn with_outcome(self, outcome: OpenOutcome) -> Self {
        self.state.borrow_mut().outcomes = VecDeque::from([outcome]);
        self
    }

    /// Outcomes for successive opens; the last one repeats
    pub fn with_outcomes(self, outcomes: &[OpenOutcome]) -> Self {
        self.state.borrow_mut().outcomes = outcomes.iter().copied().collect();
        self
    }

    pub fn with_twin(self, raw: &str) -> Self {
        self.set_twin(raw);
        self
    }

    pub fn without_twin(self) -> Self {
        self.clear_twin();
        self
    }

    pub fn clear_twin(&self) {
        self.state.borrow_mut().twin = None;
    }

    pub fn set_twin(&self, raw: &str) {
        self.state.borrow_mut().twin = Some(raw.to_string());
    }

    pub fn rejecting_reports(self) -> Self {
        self.state.borrow_mut().accept_reports = false;
        self
    }

    pub fn drop_link(&self) {
        self.state.borrow_mut().connected = false;
    }
}

impl CloudTransport for FakeCloud {
    fn open(&mut self, hub: &str, _device_id: &str, _key: &[u8], _qos: Qos, _trust: &TrustAnchor) -> OpenOutcome {
        let mut state = self.state.borrow_mut();
        let outcome = if state.outcomes.len() > 1 {
            state.outcomes.pop_front().unwrap_or(OpenOutcome::Connected)
        } else {
            state.outcomes.front().copied().unwrap_or(OpenOutcome::Connected)
        };
        if outcome == OpenOutcome::Connected {
            state.connected = true;
            self.log.push(Effect::SessionOpened { hub: hub.to_string() });
        }
        outcome
    }

    fn close(&mut self) {
        self.state.borrow_mut().connected = false;
        self.log.push(Effect::SessionClosed);
    }

    fn is_connected(&self) -> bool {
        self.state.borrow().connected
    }

    fn get_twin(&mut self, _deadline: Duration) -> Option<String> {
        self.log.push(Effect::TwinRequested);
        self.state.borrow().twin.clone()
    }

    fn update_reported(&mut self, payload: &str) -> bool {
        self.log.push(Effect::Reported(payload.to_string()));
        self.state.borrow().accept_reports
    }
}

#[derive(Debug, Clone)]
pub enum Planned {
    Ok(Vec<u8>),
    Status(u16),
    BrokenAfter(Vec<u8>),
    Unreachable,
}

pub struct FakeHttp {
    plans: VecDeque<Planned>,
    log: EffectLog,
}

impl FakeHttp {
    /// Responses for successive requests; the last one repeats
    pub fn sequence(plans: Vec<Planned>, log: EffectLog) -> Self {
        Self {
            plans: plans.into(),
            log,
        }
    }

    pub fn ok(body: Vec<u8>, log: EffectLog) -> Self {
        Self::sequence(vec![Planned::Ok(body)], log)
    }

    pub fn status(code: u16, log: EffectLog) -> Self {
        Self::sequence(vec![Planned::Status(code)], log)
    }

    pub fn broken_after(body: Vec<u8>, log: EffectLog) -> Self {
        Self::sequence(vec![Planned::BrokenAfter(body)], log)
    }

    pub fn unreachable(log: EffectLog) -> Self {
        Self::sequence(vec![Planned::Unreachable], log)
    }
}

struct BrokenBody {
    data: Cursor<Vec<u8>>,
}

impl Read for BrokenBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.data.read(buf)? {
            0 => Err(io::Error::new(io::ErrorKind::ConnectionReset, "peer reset")),
            n => Ok(n),
        }
    }
}

impl HttpTransport for FakeHttp {
    fn get<'a>(&'a mut self, url: &str, _trust: &TrustAnchor) -> io::Result<HttpResponse<'a>> {
        self.log.push(Effect::HttpGet(url.to_string()));
        let plan = if self.plans.len() > 1 {
            self.plans.pop_front()
        } else {
            self.plans.front().cloned()
        };
        match plan.unwrap_or(Planned::Unreachable) {
            Planned::Ok(body) => Ok(HttpResponse {
                status: 200,
                body: Box::new(Cursor::new(body)),
            }),
            Planned::Status(status) => Ok(HttpResponse {
                status,
                body: Box::new(io::empty()),
            }),
            Planned::BrokenAfter(body) => Ok(HttpResponse {
                status: 200,
                body: Box::new(BrokenBody { data: Cursor::new(body) }),
            }),
            Planned::Unreachable => Err(io::Error::new(io::ErrorKind::ConnectionRefused, "no route")),
        }
    }
}

#[derive(Default)]
struct MemFs {
    files: BTreeMap<PathBuf, Vec<u8>>,
    capacity: Option<usize>,
    failing_delete: BTreeSet<PathBuf>,
}

/// In-memory storage root. Clones share the same files.
#[derive(Clone)]
pub struct MemoryStorage {
    fs: Rc<RefCell<MemFs>>,
    log: EffectLog,
}

impl MemoryStorage {
    pub fn new(log: EffectLog) -> Self {
        Self {
            fs: Rc::new(RefCell::new(MemFs::default())),
            log,
        }
    }

    pub fn with_file(self, path: &str, contents: &[u8]) -> Self {
        self.fs.borrow_mut().files.insert(PathBuf::from(path), contents.to_vec());
        self
    }

    /// Largest file size a write may reach
    pub fn with_capacity(self, bytes: usize) -> Self {
        self.fs.borrow_mut().capacity = Some(bytes);
        self
    }

    pub fn failing_delete(self, path: &str) -> Self {
        self.fs.borrow_mut().failing_delete.insert(PathBuf::from(path));
        self
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.fs.borrow().files.keys().cloned().collect()
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.fs.borrow().files.get(Path::new(path)).cloned()
    }
}

struct MemSink {
    fs: Rc<RefCell<MemFs>>,
    path: PathBuf,
    log: EffectLog,
}

impl Write for MemSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut fs = self.fs.borrow_mut();
        let capacity = fs.capacity;
        let file = fs.files.entry(self.path.clone()).or_default();
        if let Some(cap) = capacity {
            if file.len() + buf.len() > cap {
                return Err(io::Error::new(io::ErrorKind::Other, "no space left on device"));
            }
        }
        file.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl FileSink for MemSink {
    fn finish(self: Box<Self>) -> io::Result<()> {
        self.log.push(Effect::FileFinished(self.path.clone()));
        Ok(())
    }
}

impl Storage for MemoryStorage {
    fn list_files(&self, root: &Path) -> io::Result<Vec<PathBuf>> {
        self.log.push(Effect::Listed);
        Ok(self
            .fs
            .borrow()
            .files
            .keys()
            .filter(|p| p.parent() == Some(root))
            .cloned()
            .collect())
    }

    fn delete(&mut self, path: &Path) -> io::Result<()> {
        let mut fs = self.fs.borrow_mut();
        if fs.failing_delete.contains(path) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only file"));
        }
        match fs.files.remove(path) {
            Some(_) => {
                self.log.push(Effect::Deleted(path.to_path_buf()));
                Ok(())
            }
            None => Err(io::Error::new(io::ErrorKind::NotFound, "no such file")),
        }
    }

    fn create<'a>(&'a mut self, path: &Path) -> io::Result<Box<dyn FileSink + 'a>> {
        self.fs.borrow_mut().files.insert(path.to_path_buf(), Vec::new());
        self.log.push(Effect::FileCreated(path.to_path_buf()));
        Ok(Box::new(MemSink {
            fs: self.fs.clone(),
            path: path.to_path_buf(),
            log: self.log.clone(),
        }))
    }

    fn open_read<'a>(&'a self, path: &Path) -> io::Result<Box<dyn Read + 'a>> {
        let contents = self
            .fs
            .borrow()
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such file"))?;
        Ok(Box::new(Cursor::new(contents)))
    }

    fn file_len(&self, path: &Path) -> io::Result<Option<u64>> {
        Ok(self.fs.borrow().files.get(path).map(|f| f.len() as u64))
    }
}
