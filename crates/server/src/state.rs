//! Application state

use std::sync::Arc;
use std::time::Duration;

use armdock_connectors::{DeviceSource, PromptExtractor};
use armdock_protocol::{ServerMessage, SessionDetail, SessionKind, SessionSnapshot, TeleopPhase};
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::ServerConfig;
use crate::error::SessionError;
use crate::fanout::{LiveFanout, Topic};
use crate::presence::PresencePoller;
use crate::session_actor::{ActorContext, SessionActorHandle};
use crate::store::RobotStore;

/// Whether a session still holds its robots: a live process, or a dry-run
/// teleop that is nominally running.
pub fn is_live(snapshot: &SessionSnapshot) -> bool {
    if snapshot.running {
        return true;
    }
    matches!(
        &snapshot.detail,
        SessionDetail::Teleop(detail)
            if matches!(detail.phase, TeleopPhase::Starting | TeleopPhase::Running)
    )
}

/// In-memory map of session id to actor
pub struct SessionRegistry {
    sessions: DashMap<String, SessionActorHandle>,
    fanout: Arc<LiveFanout>,
}

impl SessionRegistry {
    pub fn new(fanout: Arc<LiveFanout>) -> Self {
        Self {
            sessions: DashMap::new(),
            fanout,
        }
    }

    pub fn insert(&self, handle: SessionActorHandle) {
        self.sessions.insert(handle.id.clone(), handle);
    }

    pub fn get(&self, id: &str) -> Result<SessionActorHandle, SessionError> {
        self.sessions
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn handles(&self) -> Vec<SessionActorHandle> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn teleop_handles(&self) -> Vec<SessionActorHandle> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().snapshot().kind() == SessionKind::Teleop)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// A live session that involves `robot_id`, if any.
    pub fn find_live(&self, robot_id: &str) -> Option<SessionActorHandle> {
        self.sessions.iter().find_map(|entry| {
            let snapshot = entry.value().snapshot();
            (snapshot.subject.involves(robot_id) && is_live(&snapshot))
                .then(|| entry.value().clone())
        })
    }

    /// Stop the session's process and drop it. Observers get `SessionClosed`.
    ///
    /// The entry is removed before the process is stopped, so a concurrent or
    /// repeated close of the same id reports `NotFound`.
    pub async fn close(&self, id: &str, reason: &str) -> Result<(), SessionError> {
        let (_, handle) = self
            .sessions
            .remove(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        handle.cancel().await;
        self.fanout.close(
            &Topic::Session(id.to_string()),
            Some(ServerMessage::SessionClosed {
                session_id: id.to_string(),
                reason: reason.to_string(),
            }),
        );
        info!(
            component = "registry",
            event = "session.closed",
            session_id = %id,
            reason,
            "Session closed"
        );
        Ok(())
    }

    /// Close finished sessions whose state has not changed for `ttl`.
    pub async fn reap_idle(&self, ttl: Duration) -> usize {
        let now = Utc::now();
        let idle: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| {
                let snapshot = entry.value().snapshot();
                let idle_for = (now - snapshot.updated_at).to_std().unwrap_or_default();
                !is_live(&snapshot) && idle_for >= ttl
            })
            .map(|entry| entry.key().clone())
            .collect();

        let mut reaped = 0;
        for id in idle {
            if self.close(&id, "idle").await.is_ok() {
                reaped += 1;
            }
        }
        reaped
    }

    /// Stop every process; used on server shutdown.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            let _ = self.close(&id, "shutdown").await;
        }
    }
}

/// Shared application state
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<dyn RobotStore>,
    pub fanout: Arc<LiveFanout>,
    pub presence: PresencePoller,
    pub registry: SessionRegistry,
    pub extractor: Arc<PromptExtractor>,
    /// Held while any session is being launched; records the teleop session
    /// currently occupying the single teleop slot.
    pub launch: Mutex<Option<String>>,
}

impl AppState {
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn RobotStore>,
        devices: Arc<dyn DeviceSource>,
    ) -> anyhow::Result<Self> {
        let extractor = Arc::new(PromptExtractor::new(config.markers.clone())?);
        let fanout = Arc::new(LiveFanout::new());
        Ok(Self {
            config,
            store,
            registry: SessionRegistry::new(fanout.clone()),
            fanout,
            presence: PresencePoller::new(devices),
            extractor,
            launch: Mutex::new(None),
        })
    }

    pub fn actor_context(&self) -> ActorContext {
        ActorContext {
            extractor: self.extractor.clone(),
            fanout: self.fanout.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armdock_connectors::CommandSpec;
    use armdock_protocol::SessionSubject;

    use crate::calibration::CalibrationRun;
    use crate::config::{LOG_CAPACITY, NEAR_ZERO_SPAN};
    use crate::session::ProcessSession;
    use crate::session_actor::Machine;

    fn dry_run_calibration(ctx: ActorContext, robot_id: &str) -> SessionActorHandle {
        let mut session = ProcessSession::new(
            SessionKind::Calibration,
            SessionSubject::Robot {
                robot_id: robot_id.into(),
            },
            LOG_CAPACITY,
        );
        let events = session
            .spawn(&CommandSpec::new("python"), true)
            .expect("dry-run");
        SessionActorHandle::spawn(
            session,
            Machine::Calibration(CalibrationRun::new(NEAR_ZERO_SPAN)),
            events,
            ctx,
        )
    }

    fn ctx(fanout: &Arc<LiveFanout>) -> ActorContext {
        ActorContext {
            extractor: Arc::new(PromptExtractor::default()),
            fanout: fanout.clone(),
        }
    }

    #[tokio::test]
    async fn second_close_reports_not_found() {
        let fanout = Arc::new(LiveFanout::new());
        let registry = SessionRegistry::new(fanout.clone());
        let handle = dry_run_calibration(ctx(&fanout), "r1");
        let id = handle.id.clone();
        registry.insert(handle);

        let mut sub = fanout.subscribe(Topic::Session(id.clone()));
        assert!(sub.initial.is_some());

        registry.close(&id, "cancelled").await.expect("first close");
        assert!(matches!(
            registry.close(&id, "cancelled").await,
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(registry.get(&id), Err(SessionError::NotFound(_))));

        let mut closed = false;
        while let Ok(msg) = sub.rx.recv().await {
            if let ServerMessage::SessionClosed { reason, .. } = msg {
                assert_eq!(reason, "cancelled");
                closed = true;
            }
        }
        assert!(closed);
    }

    #[tokio::test]
    async fn finished_dry_run_is_not_live() {
        let fanout = Arc::new(LiveFanout::new());
        let registry = SessionRegistry::new(fanout.clone());
        registry.insert(dry_run_calibration(ctx(&fanout), "r1"));
        assert!(registry.find_live("r1").is_none());
        assert_eq!(registry.teleop_handles().len(), 0);
    }

    #[tokio::test]
    async fn idle_sessions_are_reaped_after_ttl() {
        let fanout = Arc::new(LiveFanout::new());
        let registry = SessionRegistry::new(fanout.clone());
        registry.insert(dry_run_calibration(ctx(&fanout), "r1"));

        assert_eq!(registry.reap_idle(Duration::from_secs(3600)).await, 0);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.reap_idle(Duration::ZERO).await, 1);
        assert_eq!(registry.len(), 0);
    }
}
