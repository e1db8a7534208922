//! Session and fleet operations shared by the websocket and HTTP surfaces
//!
//! Every start request validates synchronously and either rejects with no
//! process spawned or hands a running session to its actor. Operator actions
//! on an existing session are forwarded to that actor and answered by it.

use armdock_connectors::{calibration_command, teleop_command};
use armdock_protocol::{
    FleetSnapshot, NewRobot, Robot, ServerMessage, SessionKind, SessionSnapshot, SessionSubject,
};
use tracing::{info, warn};

use crate::calibration::{CalibrationRun, OverrideChoice};
use crate::config::{LOG_CAPACITY, NEAR_ZERO_SPAN, TELEOP_PRESENCE_GRACE};
use crate::error::SessionError;
use crate::fanout::Topic;
use crate::fleet::compute_fleet;
use crate::session::ProcessSession;
use crate::session_actor::{Machine, SessionActorHandle, TeleopMachine};
use crate::session_command::{CalibrationAction, SessionCommand, TeleopAction};
use crate::state::{is_live, AppState};
use crate::store::run_blocking;
use crate::teleop::check_start_preconditions;

// -- Fleet and robots --

pub async fn fleet_snapshot(state: &AppState) -> Result<FleetSnapshot, SessionError> {
    let robots = run_blocking(state.store.clone(), |s| s.list_robots()).await?;
    Ok(compute_fleet(robots, &state.presence.current()))
}

/// Recompute the fleet and publish it if observers would see a difference.
pub async fn publish_fleet(state: &AppState) -> Result<bool, SessionError> {
    let fleet = fleet_snapshot(state).await?;
    Ok(state
        .fanout
        .publish_if_changed(Topic::Fleet, ServerMessage::FleetStatus { fleet }))
}

async fn republish_fleet(state: &AppState) {
    if let Err(e) = publish_fleet(state).await {
        warn!(
            component = "orchestrator",
            event = "fleet.publish_failed",
            error = %e,
            "Failed to publish fleet snapshot"
        );
    }
}

pub async fn get_robot(state: &AppState, robot_id: &str) -> Result<Robot, SessionError> {
    let id = robot_id.to_string();
    Ok(run_blocking(state.store.clone(), move |s| s.get_robot(&id)).await?)
}

pub async fn add_robot(state: &AppState, robot: NewRobot) -> Result<Robot, SessionError> {
    let robot = run_blocking(state.store.clone(), move |s| s.add_robot(robot)).await?;
    info!(
        component = "orchestrator",
        event = "robot.added",
        robot_id = %robot.id,
        name = %robot.name,
        "Robot registered"
    );
    republish_fleet(state).await;
    Ok(robot)
}

pub async fn delete_robot(state: &AppState, robot_id: &str) -> Result<(), SessionError> {
    ensure_idle(state, robot_id)?;
    let id = robot_id.to_string();
    run_blocking(state.store.clone(), move |s| s.delete_robot(&id)).await?;
    info!(
        component = "orchestrator",
        event = "robot.deleted",
        robot_id = %robot_id,
        "Robot deleted"
    );
    republish_fleet(state).await;
    Ok(())
}

pub async fn delete_calibration(state: &AppState, robot_id: &str) -> Result<Robot, SessionError> {
    ensure_idle(state, robot_id)?;
    let id = robot_id.to_string();
    let robot = run_blocking(state.store.clone(), move |s| s.delete_calibration(&id)).await?;
    republish_fleet(state).await;
    Ok(robot)
}

fn ensure_idle(state: &AppState, robot_id: &str) -> Result<(), SessionError> {
    match state.registry.find_live(robot_id) {
        Some(handle) => Err(SessionError::PreconditionFailed(format!(
            "Robot {robot_id} is in use by session {}",
            handle.id
        ))),
        None => Ok(()),
    }
}

// -- Calibration --

pub async fn start_calibration(
    state: &AppState,
    robot_id: &str,
) -> Result<SessionSnapshot, SessionError> {
    let _launch = state.launch.lock().await;

    let robot = get_robot(state, robot_id).await?;
    if let Some(busy) = state.registry.find_live(&robot.id) {
        return Err(SessionError::PreconditionFailed(format!(
            "{} is busy in session {}",
            robot.name, busy.id
        )));
    }

    let spec = calibration_command(&state.config.tool, &robot);
    let mut session = ProcessSession::new(
        SessionKind::Calibration,
        SessionSubject::Robot {
            robot_id: robot.id.clone(),
        },
        LOG_CAPACITY,
    );
    let events = session.spawn(&spec, state.config.dry_run)?;
    let handle = SessionActorHandle::spawn(
        session,
        Machine::Calibration(CalibrationRun::new(NEAR_ZERO_SPAN)),
        events,
        state.actor_context(),
    );
    info!(
        component = "orchestrator",
        event = "calibration.started",
        session_id = %handle.id,
        robot_id = %robot.id,
        dry_run = state.config.dry_run,
        "Calibration session started"
    );
    let snapshot = handle.snapshot();
    state.registry.insert(handle);
    Ok((*snapshot).clone())
}

async fn calibration_action(
    state: &AppState,
    session_id: &str,
    action: CalibrationAction,
) -> Result<(), SessionError> {
    state
        .registry
        .get(session_id)?
        .request(|reply| SessionCommand::Calibration { action, reply })
        .await
}

/// Answer the existing-calibration-file prompt.
pub async fn override_decision(
    state: &AppState,
    session_id: &str,
    overwrite: bool,
) -> Result<(), SessionError> {
    let choice = if overwrite {
        OverrideChoice::Recalibrate
    } else {
        OverrideChoice::KeepExisting
    };
    calibration_action(state, session_id, CalibrationAction::Override(choice)).await
}

pub async fn begin_sweep(state: &AppState, session_id: &str) -> Result<(), SessionError> {
    calibration_action(state, session_id, CalibrationAction::BeginSweep).await
}

pub async fn finish_sweep(state: &AppState, session_id: &str) -> Result<(), SessionError> {
    calibration_action(state, session_id, CalibrationAction::FinishSweep).await
}

pub async fn send_input(
    state: &AppState,
    session_id: &str,
    data: String,
) -> Result<(), SessionError> {
    calibration_action(state, session_id, CalibrationAction::RawInput(data)).await
}

/// Persist a captured calibration and close its session.
pub async fn save_calibration(state: &AppState, session_id: &str) -> Result<Robot, SessionError> {
    let handle = state.registry.get(session_id)?;
    let robot_id = match &handle.snapshot().subject {
        SessionSubject::Robot { robot_id } => robot_id.clone(),
        SessionSubject::Pair { .. } => {
            return Err(SessionError::PreconditionFailed(format!(
                "Session {session_id} is not a calibration session"
            )))
        }
    };

    let joints = handle
        .request(|reply| SessionCommand::TakeCapture { reply })
        .await?;
    let id = robot_id.clone();
    let robot = run_blocking(state.store.clone(), move |s| s.save_calibration(&id, joints)).await?;
    handle
        .request(|reply| SessionCommand::MarkSaved { reply })
        .await?;

    info!(
        component = "orchestrator",
        event = "calibration.saved",
        session_id = %session_id,
        robot_id = %robot_id,
        joints = robot.calibration.as_ref().map(|c| c.joints.len()).unwrap_or(0),
        "Calibration saved"
    );
    // Already gone means someone else closed it first; the save still stands.
    let _ = state.registry.close(session_id, "saved").await;
    republish_fleet(state).await;
    Ok(robot)
}

// -- Teleop --

/// Start teleoperation for a leader/follower pair.
///
/// Only one pair runs at a time: asking again for the running pair returns
/// its session, asking for any other pair is rejected.
pub async fn start_teleop(
    state: &AppState,
    leader_id: &str,
    follower_id: &str,
) -> Result<SessionSnapshot, SessionError> {
    let mut slot = state.launch.lock().await;

    if let Some(active_id) = slot.as_deref() {
        if let Ok(active) = state.registry.get(active_id) {
            let snapshot = active.snapshot();
            if is_live(&snapshot) {
                let same_pair = snapshot.subject
                    == SessionSubject::Pair {
                        leader_id: leader_id.to_string(),
                        follower_id: follower_id.to_string(),
                    };
                if same_pair {
                    return Ok((*snapshot).clone());
                }
                return Err(SessionError::PreconditionFailed(format!(
                    "Teleoperation already running in session {active_id}; stop it first"
                )));
            }
        }
    }

    let leader = get_robot(state, leader_id).await?;
    let follower = get_robot(state, follower_id).await?;
    check_start_preconditions(&leader, &follower, &state.presence.current())?;
    for robot in [&leader, &follower] {
        if let Some(busy) = state.registry.find_live(&robot.id) {
            return Err(SessionError::PreconditionFailed(format!(
                "{} is busy in session {}",
                robot.name, busy.id
            )));
        }
    }

    let spec = teleop_command(&state.config.tool, &leader, &follower);
    let mut session = ProcessSession::new(
        SessionKind::Teleop,
        SessionSubject::Pair {
            leader_id: leader.id.clone(),
            follower_id: follower.id.clone(),
        },
        LOG_CAPACITY,
    );
    let events = session.spawn(&spec, state.config.dry_run)?;
    let handle = SessionActorHandle::spawn(
        session,
        Machine::Teleop(TeleopMachine::new(&leader, &follower, TELEOP_PRESENCE_GRACE)),
        events,
        state.actor_context(),
    );
    info!(
        component = "orchestrator",
        event = "teleop.started",
        session_id = %handle.id,
        leader_id = %leader.id,
        follower_id = %follower.id,
        dry_run = state.config.dry_run,
        "Teleop session started"
    );
    let snapshot = handle.snapshot();
    *slot = Some(handle.id.clone());
    state.registry.insert(handle);
    Ok((*snapshot).clone())
}

async fn teleop_action(
    state: &AppState,
    session_id: &str,
    action: TeleopAction,
) -> Result<(), SessionError> {
    state
        .registry
        .get(session_id)?
        .request(|reply| SessionCommand::Teleop { action, reply })
        .await
}

/// Stop the teleop process. The session stays readable until cancelled.
///
/// The teleop slot is released even when the process had already exited.
pub async fn stop_teleop(state: &AppState, session_id: &str) -> Result<(), SessionError> {
    let result = teleop_action(state, session_id, TeleopAction::Stop).await;
    if matches!(result, Ok(()) | Err(SessionError::NotRunning(_))) {
        let mut slot = state.launch.lock().await;
        if slot.as_deref() == Some(session_id) {
            *slot = None;
        }
    }
    result
}

pub async fn clear_disconnects(state: &AppState, session_id: &str) -> Result<(), SessionError> {
    teleop_action(state, session_id, TeleopAction::ClearDisconnects).await
}

// -- Sessions --

pub fn get_session(state: &AppState, session_id: &str) -> Result<SessionSnapshot, SessionError> {
    let handle = state.registry.get(session_id)?;
    let snapshot = handle.snapshot();
    Ok((*snapshot).clone())
}

/// Terminate and drop a session. Unknown ids report `NotFound`.
pub async fn cancel_session(state: &AppState, session_id: &str) -> Result<(), SessionError> {
    state.registry.close(session_id, "cancelled").await?;
    let mut slot = state.launch.lock().await;
    if slot.as_deref() == Some(session_id) {
        *slot = None;
    }
    Ok(())
}
