//! Device presence polling
//!
//! Each tick replaces the whole snapshot of attached serial devices, pushes
//! it to running teleop sessions and republishes the fleet when anything an
//! observer can see has changed.

use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use armdock_connectors::{ConnectorError, DeviceSource};
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::SESSION_IDLE_TTL;
use crate::fleet::{newly_online, PresenceSnapshot};
use crate::orchestrator;
use crate::session_command::SessionCommand;
use crate::state::AppState;
use crate::store::run_blocking;

pub struct PresencePoller {
    source: Arc<dyn DeviceSource>,
    current: ArcSwap<PresenceSnapshot>,
}

impl PresencePoller {
    pub fn new(source: Arc<dyn DeviceSource>) -> Self {
        Self {
            source,
            current: ArcSwap::from_pointee(PresenceSnapshot::new()),
        }
    }

    pub fn current(&self) -> Arc<PresenceSnapshot> {
        self.current.load_full()
    }

    /// Enumerate devices and swap in the result. Returns (previous, current).
    ///
    /// On failure the previous snapshot stays in place.
    pub async fn refresh(
        &self,
    ) -> Result<(Arc<PresenceSnapshot>, Arc<PresenceSnapshot>), ConnectorError> {
        let source = self.source.clone();
        let devices = tokio::task::spawn_blocking(move || source.list_attached_devices())
            .await
            .map_err(|e| ConnectorError::Enumeration(e.to_string()))??;
        let current = Arc::new(devices);
        let previous = self.current.swap(current.clone());
        Ok((previous, current))
    }
}

/// One poll cycle. Returns whether a new fleet snapshot was published.
pub async fn tick(state: &AppState) -> bool {
    let (previous, current) = match state.presence.refresh().await {
        Ok(pair) => pair,
        Err(e) => {
            warn!(
                component = "presence",
                event = "presence.refresh_failed",
                error = %e,
                "Device enumeration failed, keeping previous snapshot"
            );
            return false;
        }
    };

    let at = Instant::now();
    for handle in state.registry.teleop_handles() {
        handle.try_send(SessionCommand::Presence {
            presence: current.clone(),
            at,
        });
    }

    if previous != current {
        record_last_seen(state, &previous, &current).await;
    }

    match orchestrator::publish_fleet(state).await {
        Ok(published) => published,
        Err(e) => {
            warn!(
                component = "presence",
                event = "presence.fleet_failed",
                error = %e,
                "Failed to publish fleet snapshot"
            );
            false
        }
    }
}

async fn record_last_seen(
    state: &AppState,
    previous: &PresenceSnapshot,
    current: &PresenceSnapshot,
) {
    let robots = match run_blocking(state.store.clone(), |s| s.list_robots()).await {
        Ok(robots) => robots,
        Err(e) => {
            warn!(
                component = "presence",
                event = "presence.list_failed",
                error = %e,
                "Failed to list robots"
            );
            return;
        }
    };
    let seen: Vec<String> = newly_online(&robots, previous, current)
        .map(|robot| robot.id.clone())
        .collect();
    if seen.is_empty() {
        return;
    }

    debug!(
        component = "presence",
        event = "presence.robots_online",
        robots = ?seen,
    );
    let now = Utc::now();
    if let Err(e) = run_blocking(state.store.clone(), move |s| s.mark_seen(&seen, now)).await {
        warn!(
            component = "presence",
            event = "presence.mark_seen_failed",
            error = %e,
            "Failed to record last seen"
        );
    }
}

/// Poll on `config.poll_interval` until the runtime shuts down.
pub fn spawn_presence_loop(state: Arc<AppState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(state.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            component = "presence",
            event = "presence.loop_started",
            interval_ms = state.config.poll_interval.as_millis() as u64,
            "Presence polling started"
        );
        loop {
            interval.tick().await;
            tick(&state).await;
            let reaped = state.registry.reap_idle(SESSION_IDLE_TTL).await;
            if reaped > 0 {
                info!(
                    component = "presence",
                    event = "registry.reaped",
                    count = reaped,
                    "Closed idle sessions"
                );
            }
        }
    })
}
