//! Teleoperation state machine and start preconditions
//!
//! Disconnects are an overlay on Starting/Running: they accumulate in
//! `disconnected` until the operator clears them and never stop the process.
//! Presence is authoritative; log scraping only fills in what it can attribute.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use armdock_connectors::{DisconnectSignals, ExtractedSignals};
use armdock_protocol::{Robot, RobotRole, TeleopDetail, TeleopPhase};

use crate::effect::Effect;
use crate::error::SessionError;
use crate::fleet::PresenceSnapshot;

#[derive(Debug, Clone)]
pub enum Input {
    Spawned { dry_run: bool, at: Instant },
    Output {
        signals: ExtractedSignals,
        disconnects: DisconnectSignals,
    },
    Presence {
        leader_online: bool,
        follower_online: bool,
        at: Instant,
    },
    Exited { code: i32 },
    Stop,
    ClearDisconnects { log_mark: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TeleopRun {
    pub phase: TeleopPhase,
    pub leader_id: String,
    pub follower_id: String,
    pub disconnected: BTreeSet<RobotRole>,
    pub ambiguous_disconnect: bool,
    pub failure: Option<String>,
    /// Log lines before this absolute index were already cleared
    pub log_mark: u64,
    started_at: Option<Instant>,
    grace: Duration,
    stop_requested: bool,
}

impl TeleopRun {
    pub fn new(leader_id: String, follower_id: String, grace: Duration) -> Self {
        Self {
            phase: TeleopPhase::Idle,
            leader_id,
            follower_id,
            disconnected: BTreeSet::new(),
            ambiguous_disconnect: false,
            failure: None,
            log_mark: 0,
            started_at: None,
            grace,
            stop_requested: false,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.phase, TeleopPhase::Starting | TeleopPhase::Running)
    }

    pub fn detail(&self) -> TeleopDetail {
        TeleopDetail {
            phase: self.phase,
            leader_id: self.leader_id.clone(),
            follower_id: self.follower_id.clone(),
            disconnected_roles: self.disconnected.iter().copied().collect(),
            ambiguous_disconnect: self.ambiguous_disconnect,
            failure: self.failure.clone(),
        }
    }

    fn in_grace(&self, at: Instant) -> bool {
        match self.started_at {
            Some(started) => at.saturating_duration_since(started) < self.grace,
            None => true,
        }
    }
}

pub fn transition(run: &TeleopRun, input: Input) -> (TeleopRun, Vec<Effect>) {
    let mut next = run.clone();
    let mut effects = Vec::new();

    match input {
        Input::Spawned { dry_run, at } => {
            if run.phase == TeleopPhase::Idle {
                next.started_at = Some(at);
                next.phase = if dry_run {
                    TeleopPhase::Running
                } else {
                    TeleopPhase::Starting
                };
            }
        }

        Input::Output {
            signals,
            disconnects,
        } => {
            if !run.is_active() {
                return (next, effects);
            }
            if run.phase == TeleopPhase::Starting && signals.confirmed_started {
                next.phase = TeleopPhase::Running;
            }
            next.disconnected.extend(disconnects.roles.iter().copied());
            if disconnects.ambiguous > 0 {
                next.ambiguous_disconnect = true;
            }
        }

        Input::Presence {
            leader_online,
            follower_online,
            at,
        } => {
            if !run.is_active() || run.in_grace(at) {
                return (next, effects);
            }
            let mut offline = Vec::new();
            if !leader_online {
                offline.push(RobotRole::Leader);
            }
            if !follower_online {
                offline.push(RobotRole::Follower);
            }
            if next.ambiguous_disconnect && offline.len() == 1 {
                next.ambiguous_disconnect = false;
            }
            next.disconnected.extend(offline);
        }

        Input::Exited { code } => {
            if run.phase == TeleopPhase::Idle {
                return (next, effects);
            }
            if !run.stop_requested && code != 0 {
                next.failure = Some(format!("Teleoperation exited with code {code}"));
            }
            next.phase = TeleopPhase::Stopped;
        }

        Input::Stop => {
            next.stop_requested = true;
            if run.is_active() {
                effects.push(Effect::Terminate);
            }
            next.phase = TeleopPhase::Stopped;
        }

        Input::ClearDisconnects { log_mark } => {
            next.disconnected.clear();
            next.ambiguous_disconnect = false;
            next.log_mark = log_mark;
        }
    }

    (next, effects)
}

/// Synchronous checks before any process is spawned.
pub fn check_start_preconditions(
    leader: &Robot,
    follower: &Robot,
    presence: &PresenceSnapshot,
) -> Result<(), SessionError> {
    let fail = |msg: &str| Err(SessionError::PreconditionFailed(msg.to_string()));

    if leader.id == follower.id {
        return fail("Leader and follower must be different robots");
    }
    if leader.model != follower.model {
        return fail("Leader and follower must be the same model");
    }
    if leader.role != RobotRole::Leader {
        return fail("Teleop must start from a leader arm");
    }
    if follower.role != RobotRole::Follower {
        return fail("Select a follower arm to control");
    }
    if !leader.has_calibration {
        return fail("Leader needs calibration first");
    }
    if !follower.has_calibration {
        return fail("Follower needs calibration first");
    }
    if !presence.contains_key(&leader.com_port) {
        return Err(SessionError::PreconditionFailed(format!(
            "Leader {} is offline ({} not attached)",
            leader.name, leader.com_port
        )));
    }
    if !presence.contains_key(&follower.com_port) {
        return Err(SessionError::PreconditionFailed(format!(
            "Follower {} is offline ({} not attached)",
            follower.name, follower.com_port
        )));
    }
    Ok(())
}
