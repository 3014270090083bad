// Cloud session lifecycle. A `Session` value is proof that the channel is open;
// closing consumes it, so a closed session cannot be used by accident.

use std::time::Duration;

use crate::error::{ConnectionError, TwinError};
use crate::provisioning::DeviceIdentity;
use crate::transport::{CloudTransport, OpenOutcome, Qos, TrustAnchor};

#[derive(Debug, PartialEq, Eq)]
pub struct Session {
    hub: String,
    device_id: String,
    generation: u64,
}

impl Session {
    pub fn hub(&self) -> &str {
        &self.hub
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Increases with every successful open
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

pub struct ConnectionLifecycle<C> {
    transport: C,
    trust_anchor: TrustAnchor,
    qos: Qos,
    snapshot_deadline: Duration,
    generation: u64,
}

impl<C: CloudTransport> ConnectionLifecycle<C> {
    pub fn new(transport: C, trust_anchor: TrustAnchor, qos: Qos, snapshot_deadline: Duration) -> Self {
        Self {
            transport,
            trust_anchor,
            qos,
            snapshot_deadline,
            generation: 0,
        }
    }

    pub fn open(&mut self, identity: &DeviceIdentity) -> Result<Session, ConnectionError> {
        let assignment = identity.assignment().ok_or(ConnectionError::NotProvisioned)?;
        let hub = assignment.assigned_hub.clone();

        log::info!("Opening session to {} as '{}'", hub, assignment.device_id);
        let outcome = self.transport.open(
            &hub,
            &assignment.device_id,
            identity.shared_key().as_bytes(),
            self.qos,
            &self.trust_anchor,
        );

        match outcome {
            OpenOutcome::Connected => {
                self.generation += 1;
                log::info!("Session #{} open", self.generation);
                Ok(Session {
                    hub,
                    device_id: assignment.device_id.clone(),
                    generation: self.generation,
                })
            }
            OpenOutcome::Rejected => {
                log::error!("Session handshake with {} failed", hub);
                Err(ConnectionError::HandshakeFailed { hub })
            }
            OpenOutcome::TimedOut => {
                log::error!("Session handshake with {} timed out", hub);
                Err(ConnectionError::Timeout { hub })
            }
        }
    }

    /// Close the session. Closing nothing, or a session the transport already
    /// dropped, is a no-op.
    pub fn close(&mut self, session: Option<Session>) {
        let Some(session) = session else {
            log::debug!("Close requested without an open session");
            return;
        };
        if self.transport.is_connected() {
            self.transport.close();
            log::info!("Session #{} closed", session.generation);
        } else {
            log::debug!("Session #{} already disconnected", session.generation);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn fetch_twin(&mut self, session: &Session) -> Result<String, TwinError> {
        if !self.transport.is_connected() {
            return Err(TwinError::NotConnected);
        }
        log::debug!("Requesting twin on session #{}", session.generation);
        self.transport
            .get_twin(self.snapshot_deadline)
            .ok_or(TwinError::SnapshotUnavailable)
    }

    pub fn send_reported(&mut self, session: &Session, payload: &str) -> Result<(), TwinError> {
        if !self.transport.is_connected() {
            return Err(TwinError::NotConnected);
        }
        log::debug!("Reporting on session #{}: {}", session.generation, payload);
        if self.transport.update_reported(payload) {
            Ok(())
        } else {
            Err(TwinError::FlushFailed)
        }
    }

    pub fn transport(&self) -> &C {
        &self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioning::SharedKey;
    use crate::testing::{assigned_identity, Effect, EffectLog, FakeCloud};

    fn lifecycle(cloud: FakeCloud) -> ConnectionLifecycle<FakeCloud> {
        ConnectionLifecycle::new(cloud, TrustAnchor::pem("ROOT"), Qos::AtMostOnce, Duration::from_secs(10))
    }

    #[test]
    fn open_requires_an_assignment() {
        let log = EffectLog::default();
        let mut conn = lifecycle(FakeCloud::new(log.clone()));
        let id = DeviceIdentity::new("ep", "scope", "reg", SharedKey::new(vec![1]));

        assert_eq!(conn.open(&id).unwrap_err(), ConnectionError::NotProvisioned);
        assert!(log.is_empty());
    }

    #[test]
    fn reopen_bumps_the_generation() {
        let log = EffectLog::default();
        let mut conn = lifecycle(FakeCloud::new(log.clone()));
        let id = assigned_identity();

        let first = conn.open(&id).unwrap();
        assert_eq!(first.hub(), "hub.example.net");
        conn.close(Some(first));
        let second = conn.open(&id).unwrap();
        assert_eq!(second.generation(), 2);
    }

    #[test]
    fn close_is_idempotent() {
        let log = EffectLog::default();
        let mut conn = lifecycle(FakeCloud::new(log.clone()));
        let id = assigned_identity();

        conn.close(None);
        let session = conn.open(&id).unwrap();
        conn.close(Some(session));
        conn.close(None);

        assert_eq!(log.count(|e| matches!(e, Effect::SessionClosed)), 1);
        assert!(!conn.is_connected());
    }

    #[test]
    fn open_failures_are_typed() {
        let id = assigned_identity();

        let mut rejected = lifecycle(FakeCloud::new(EffectLog::default()).with_outcome(OpenOutcome::Rejected));
        assert!(matches!(rejected.open(&id), Err(ConnectionError::HandshakeFailed { .. })));

        let mut slow = lifecycle(FakeCloud::new(EffectLog::default()).with_outcome(OpenOutcome::TimedOut));
        assert_eq!(
            slow.open(&id).unwrap_err(),
            ConnectionError::Timeout { hub: "hub.example.net".into() }
        );
    }

    #[test]
    fn reporting_needs_a_live_transport() {
        let log = EffectLog::default();
        let cloud = FakeCloud::new(log.clone());
        let handle = cloud.clone();
        let mut conn = lifecycle(cloud);
        let session = conn.open(&assigned_identity()).unwrap();

        assert!(conn.send_reported(&session, "{}").is_ok());
        handle.drop_link();
        assert!(matches!(conn.send_reported(&session, "{}"), Err(TwinError::NotConnected)));

        // transport already gone: close does not call into it again
        conn.close(Some(session));
        assert_eq!(log.count(|e| matches!(e, Effect::SessionClosed)), 0);
    }
}
