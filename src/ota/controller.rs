// Update state machine. Notifications are queued and handled one at a time;
// an update runs to completion (or failure) before the next one is looked at.

use std::collections::{BTreeMap, VecDeque};

use crate::connection::{ConnectionLifecycle, Session};
use crate::error::{ConnectionError, ErrorKind, TwinError};
use crate::fetcher::FirmwareFetcher;
use crate::ota::{
    image_name_from_url, FirmwareUpdateJob, JobStatus, OtaState, RestartRequest, UpdatePhase, UPDATING_MESSAGE,
};
use crate::provisioning::DeviceIdentity;
use crate::trace::TransitionTrace;
use crate::transport::{CloudTransport, HttpTransport, SessionEvent, Storage};
use crate::twin::{TwinStore, CODE_VERSION_KEY, MESSAGE_KEY};
use crate::validators;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtaPolicy {
    /// Failed attempts tolerated per target version before it is ignored
    pub max_attempts_per_target: u32,
}

impl Default for OtaPolicy {
    fn default() -> Self {
        Self {
            max_attempts_per_target: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Notification {
    Snapshot,
    Patch(String),
}

/// What handling one notification led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    NoTarget,
    Converged,
    Ignored,
    Failed(ErrorKind),
    Restart(RestartRequest),
}

pub struct OtaController<C, H, S> {
    twin: TwinStore,
    connection: ConnectionLifecycle<C>,
    fetcher: FirmwareFetcher<H, S>,
    session: Option<Session>,
    // the session was closed for a download that did not end in a restart
    reopen_wanted: bool,
    current_version: i64,
    state: OtaState,
    pending: VecDeque<Notification>,
    failures: BTreeMap<i64, u32>,
    unreported_failure: Option<ErrorKind>,
    last_job: Option<FirmwareUpdateJob>,
    policy: OtaPolicy,
    trace: TransitionTrace,
}

impl<C: CloudTransport, H: HttpTransport, S: Storage> OtaController<C, H, S> {
    pub fn new(
        connection: ConnectionLifecycle<C>,
        fetcher: FirmwareFetcher<H, S>,
        current_version: i64,
        policy: OtaPolicy,
    ) -> Self {
        Self {
            twin: TwinStore::new(),
            connection,
            fetcher,
            session: None,
            reopen_wanted: false,
            current_version,
            state: OtaState::Idle,
            pending: VecDeque::new(),
            failures: BTreeMap::new(),
            unreported_failure: None,
            last_job: None,
            policy,
            trace: TransitionTrace::new(),
        }
    }

    pub fn state(&self) -> OtaState {
        self.state
    }

    pub fn current_version(&self) -> i64 {
        self.current_version
    }

    pub fn twin(&self) -> &TwinStore {
        &self.twin
    }

    pub fn trace(&self) -> &TransitionTrace {
        &self.trace
    }

    /// The most recent job that reached Done or Failed
    pub fn last_job(&self) -> Option<&FirmwareUpdateJob> {
        self.last_job.as_ref()
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn fetcher(&self) -> &FirmwareFetcher<H, S> {
        &self.fetcher
    }

    pub fn fetcher_mut(&mut self) -> &mut FirmwareFetcher<H, S> {
        &mut self.fetcher
    }

    pub fn connection(&self) -> &ConnectionLifecycle<C> {
        &self.connection
    }

    /// Idle and without a session, after an update attempt closed it.
    pub fn wants_reopen(&self) -> bool {
        self.reopen_wanted && self.session.is_none() && self.state == OtaState::Idle
    }

    /// Open a session for `identity` and sync with the service's twin.
    ///
    /// A missing snapshot is logged; the session stays up and patches are
    /// still processed.
    pub fn connect(&mut self, identity: &DeviceIdentity) -> Result<(), ConnectionError> {
        let session = self.connection.open(identity)?;
        if let Err(e) = self.attach(session) {
            log::warn!("Twin snapshot unavailable: {}", e);
        }
        Ok(())
    }

    /// Close the session, if any. Used on shutdown.
    pub fn disconnect(&mut self) {
        self.connection.close(self.session.take());
    }

    fn attach(&mut self, session: Session) -> Result<(), TwinError> {
        if let Some(previous) = self.session.take() {
            log::warn!("Replacing session #{} with #{}", previous.generation(), session.generation());
            self.connection.close(Some(previous));
        }
        let raw = self.connection.fetch_twin(&session);
        self.session = Some(session);
        self.reopen_wanted = false;

        let applied = raw.and_then(|raw| self.twin.apply_snapshot(&raw).map(|doc| doc.version));
        if let Ok(version) = &applied {
            log::info!("Twin snapshot applied (version {})", version);
            // the snapshot supersedes every patch received before it
            let superseded = self.pending.len();
            if superseded > 0 {
                log::debug!("Dropping {} queued notification(s) older than the snapshot", superseded);
                self.pending.clear();
            }
        }

        // reported whether or not a snapshot arrived
        self.twin.set_reported(CODE_VERSION_KEY, self.current_version);
        if let Some(kind) = self.unreported_failure {
            self.twin.set_reported(MESSAGE_KEY, format!("Update failed: {}", kind));
        }
        match self.flush_reported() {
            Ok(()) => self.unreported_failure = None,
            Err(e) => log::warn!("Initial report not delivered: {}", e),
        }

        applied?;
        self.pending.push_back(Notification::Snapshot);
        Ok(())
    }

    pub fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::TwinChanged(raw) => {
                if self.state == OtaState::RestartPending {
                    log::info!("Restart pending, ignoring twin change");
                    return;
                }
                self.pending.push_back(Notification::Patch(raw));
            }
            SessionEvent::ConnectionStatusChanged { status, message } => {
                log::info!("Hub status updated {}-{}", status, message);
            }
        }
    }

    /// Handle queued notifications until the queue is empty, an update needs a
    /// restart, or an update attempt left the agent without a session.
    pub fn run_pending(&mut self) -> Option<RestartRequest> {
        while self.state == OtaState::Idle {
            let Some(notification) = self.pending.pop_front() else {
                break;
            };
            match self.step(notification) {
                StepOutcome::Restart(request) => return Some(request),
                StepOutcome::Failed(_) if self.session.is_none() => break,
                _ => {}
            }
        }
        if self.state == OtaState::RestartPending && !self.pending.is_empty() {
            log::info!("Restart pending, discarding {} notification(s)", self.pending.len());
            self.pending.clear();
        }
        None
    }

    fn step(&mut self, notification: Notification) -> StepOutcome {
        self.transition(OtaState::CheckingVersion);

        if let Notification::Patch(raw) = &notification {
            match self.twin.apply_patch(raw) {
                Ok(changes) if changes.is_empty() => log::debug!("Desired patch changed nothing"),
                Ok(changes) => log::debug!("Desired keys changed: {:?}", changes.keys),
                Err(e) => {
                    log::warn!("Ignoring malformed desired patch: {}", e);
                    self.transition(OtaState::Idle);
                    return StepOutcome::Ignored;
                }
            }
        }

        let Some(target) = self.twin.code_version() else {
            log::info!("No desired CodeVersion");
            self.transition(OtaState::Idle);
            return StepOutcome::NoTarget;
        };
        if target == self.current_version {
            log::info!("Running CodeVersion {} matches desired", target);
            self.transition(OtaState::Idle);
            return StepOutcome::Converged;
        }

        let failed = self.failures.get(&target).copied().unwrap_or(0);
        if failed >= self.policy.max_attempts_per_target {
            log::warn!("CodeVersion {} failed {} time(s), not retrying", target, failed);
            self.transition(OtaState::Idle);
            return StepOutcome::Ignored;
        }

        let url = self.twin.firmware_url().unwrap_or_default().to_string();
        let mut job = FirmwareUpdateJob {
            target_version: target,
            local_file_name: image_name_from_url(&url).unwrap_or_default().to_string(),
            source_url: url,
            status: JobStatus::Idle,
            last_error: None,
        };
        let usable = validators::validate_firmware_url(&job.source_url)
            .and_then(|()| validators::validate_image_name(&job.local_file_name, self.fetcher.extension()));
        if let Err(e) = usable {
            log::error!("Desired Firmware for CodeVersion {} is unusable: {}", target, e);
            return self.fail(job, ErrorKind::InvalidDesired);
        }

        log::info!("Updating from CodeVersion {} to {}", self.current_version, target);

        self.transition(OtaState::Updating(UpdatePhase::Reporting));
        job.status = JobStatus::Reporting;
        self.twin.set_reported(MESSAGE_KEY, UPDATING_MESSAGE);
        if let Err(e) = self.flush_reported() {
            log::warn!("Could not report update start: {}", e);
        }

        self.transition(OtaState::Updating(UpdatePhase::ConnectionClosing));
        self.connection.close(self.session.take());
        self.reopen_wanted = true;

        self.transition(OtaState::Updating(UpdatePhase::Downloading));
        job.status = JobStatus::Downloading;
        if let Err(e) = self.fetcher.fetch(&job.source_url, &job.local_file_name) {
            return self.fail(job, ErrorKind::from(&e));
        }

        self.transition(OtaState::Updating(UpdatePhase::Verifying));
        job.status = JobStatus::Verifying;
        let image = match self.fetcher.inspect(&job.local_file_name) {
            Ok(Some(image)) if image.len > 0 => image,
            Ok(_) => return self.fail(job, ErrorKind::EmptyImage),
            Err(e) => return self.fail(job, ErrorKind::from(&e)),
        };
        log::info!(
            "Image {} verified: {} bytes, sha256 {}",
            image.path.display(),
            image.len,
            image.sha256
        );

        job.status = JobStatus::Done;
        self.last_job = Some(job);
        self.transition(OtaState::RestartPending);
        StepOutcome::Restart(RestartRequest {
            target_version: target,
            image_path: image.path,
            image_len: image.len,
            sha256: image.sha256,
        })
    }

    fn fail(&mut self, mut job: FirmwareUpdateJob, kind: ErrorKind) -> StepOutcome {
        log::error!("Update to CodeVersion {} failed: {}", job.target_version, kind);
        job.status = JobStatus::Failed;
        job.last_error = Some(kind);
        *self.failures.entry(job.target_version).or_insert(0) += 1;
        self.last_job = Some(job);
        self.transition(OtaState::Failed);

        self.unreported_failure = Some(kind);
        if self.session.is_some() {
            self.twin.set_reported(MESSAGE_KEY, format!("Update failed: {}", kind));
            match self.flush_reported() {
                Ok(()) => self.unreported_failure = None,
                Err(e) => log::warn!("Failure report not delivered: {}", e),
            }
        }

        self.transition(OtaState::Idle);
        StepOutcome::Failed(kind)
    }

    fn flush_reported(&mut self) -> Result<(), TwinError> {
        let Some(session) = self.session.as_ref() else {
            return Err(TwinError::NotConnected);
        };
        let connection = &mut self.connection;
        self.twin.flush_reported(|payload| connection.send_reported(session, payload))
    }

    fn transition(&mut self, to: OtaState) {
        let from = self.state;
        log::debug!("OTA {:?} -> {:?}", from, to);
        self.trace.record(from, to);
        self.state = to;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{assigned_identity, Effect, EffectLog, FakeCloud, FakeHttp, MemoryStorage};
    use crate::transport::{Qos, TrustAnchor};
    use std::time::Duration;

    type Controller = OtaController<FakeCloud, FakeHttp, MemoryStorage>;

    fn controller(cloud: FakeCloud, http: FakeHttp, storage: MemoryStorage, current: i64) -> Controller {
        let connection = ConnectionLifecycle::new(cloud, TrustAnchor::pem("ROOT"), Qos::AtMostOnce, Duration::from_secs(10));
        let fetcher = FirmwareFetcher::new(http, storage, "/fw", "bin", TrustAnchor::PlatformBundle);
        OtaController::new(connection, fetcher, current, OtaPolicy::default())
    }

    fn twin(desired: &str) -> String {
        format!(r#"{{"properties":{{"desired":{},"reported":{{}}}}}}"#, desired)
    }

    #[test]
    fn connect_reports_running_version() {
        let log = EffectLog::default();
        let cloud = FakeCloud::new(log.clone()).with_twin(&twin(r#"{"$version":4}"#));
        let mut ota = controller(cloud, FakeHttp::ok(vec![1], log.clone()), MemoryStorage::new(log.clone()), 2);

        ota.connect(&assigned_identity()).unwrap();

        assert_eq!(ota.twin().document().version, 4);
        assert_eq!(ota.twin().reported().get(CODE_VERSION_KEY), Some(&serde_json::json!(2)));
        assert_eq!(log.count(|e| matches!(e, Effect::Reported(_))), 1);
        assert_eq!(ota.run_pending(), None);
        assert_eq!(ota.state(), OtaState::Idle);
    }

    #[test]
    fn missing_snapshot_keeps_session() {
        let log = EffectLog::default();
        let cloud = FakeCloud::new(log.clone()).without_twin();
        let mut ota = controller(cloud, FakeHttp::ok(vec![1], log.clone()), MemoryStorage::new(log.clone()), 2);

        ota.connect(&assigned_identity()).unwrap();
        assert!(ota.session().is_some());
        assert_eq!(ota.pending(), 0);
    }

    #[test]
    fn malformed_patch_is_ignored() {
        let log = EffectLog::default();
        let mut ota = controller(
            FakeCloud::new(log.clone()),
            FakeHttp::ok(vec![1], log.clone()),
            MemoryStorage::new(log.clone()),
            2,
        );
        ota.connect(&assigned_identity()).unwrap();
        ota.handle_event(SessionEvent::TwinChanged("not json".into()));

        assert_eq!(ota.run_pending(), None);
        assert_eq!(ota.state(), OtaState::Idle);
        assert!(ota.session().is_some());
    }

    #[test]
    fn unusable_firmware_url_fails_without_closing() {
        let log = EffectLog::default();
        let cloud = FakeCloud::new(log.clone()).with_twin(&twin(r#"{"CodeVersion":3,"Firmware":"ftp://x/v3.bin"}"#));
        let mut ota = controller(cloud, FakeHttp::ok(vec![1], log.clone()), MemoryStorage::new(log.clone()), 2);

        ota.connect(&assigned_identity()).unwrap();
        assert_eq!(ota.run_pending(), None);

        assert_eq!(ota.last_job().and_then(|j| j.last_error), Some(ErrorKind::InvalidDesired));
        assert_eq!(log.count(|e| matches!(e, Effect::SessionClosed)), 0);
        assert_eq!(log.count(|e| matches!(e, Effect::HttpGet(_))), 0);
        assert_eq!(
            ota.twin().reported().get(MESSAGE_KEY),
            Some(&serde_json::json!("Update failed: invalid desired properties"))
        );
    }

    #[test]
    fn firmware_without_image_extension_fails_without_closing() {
        let log = EffectLog::default();
        let cloud =
            FakeCloud::new(log.clone()).with_twin(&twin(r#"{"CodeVersion":3,"Firmware":"https://host/fw/v3.pe"}"#));
        let mut ota = controller(cloud, FakeHttp::ok(vec![1], log.clone()), MemoryStorage::new(log.clone()), 2);

        ota.connect(&assigned_identity()).unwrap();
        for _ in 0..4 {
            assert_eq!(ota.run_pending(), None);
            assert!(!ota.wants_reopen());
        }

        assert_eq!(ota.last_job().and_then(|j| j.last_error), Some(ErrorKind::InvalidDesired));
        assert_eq!(log.count(|e| matches!(e, Effect::SessionClosed)), 0);
        assert_eq!(log.count(|e| matches!(e, Effect::SessionOpened { .. })), 1);
        assert_eq!(log.count(|e| matches!(e, Effect::HttpGet(_))), 0);
        assert!(ota.session().is_some());
    }

    #[test]
    fn status_events_do_not_queue_work() {
        let log = EffectLog::default();
        let mut ota = controller(
            FakeCloud::new(log.clone()),
            FakeHttp::ok(vec![1], log.clone()),
            MemoryStorage::new(log.clone()),
            2,
        );
        ota.handle_event(SessionEvent::ConnectionStatusChanged {
            status: "Connected".into(),
            message: "OK".into(),
        });
        assert_eq!(ota.pending(), 0);
    }
}
