//! HTTP routes for robots, ports and session reads

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Serialize;

use armdock_protocol::{Calibration, FleetSnapshot, NewRobot, Robot, RobotView, SessionSnapshot};

use crate::error::SessionError;
use crate::fleet::{robot_view, PresenceSnapshot};
use crate::orchestrator;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub sessions: usize,
    pub dry_run: bool,
}

#[derive(Debug, Serialize)]
pub struct CalibrationResponse {
    pub robot_id: String,
    pub calibration: Option<Calibration>,
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/api/ports", get(list_ports))
        .route("/api/fleet", get(get_fleet))
        .route("/api/robots", get(list_robots).post(create_robot))
        .route("/api/robots/{id}", get(get_robot).delete(delete_robot))
        .route(
            "/api/robots/{id}/calibration",
            get(get_calibration).delete(delete_calibration),
        )
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{id}", get(get_session))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Health> {
    Json(Health {
        status: "ok",
        sessions: state.registry.len(),
        dry_run: state.config.dry_run,
    })
}

async fn list_ports(State(state): State<Arc<AppState>>) -> Json<PresenceSnapshot> {
    Json((*state.presence.current()).clone())
}

async fn get_fleet(
    State(state): State<Arc<AppState>>,
) -> Result<Json<FleetSnapshot>, SessionError> {
    Ok(Json(orchestrator::fleet_snapshot(&state).await?))
}

async fn list_robots(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<RobotView>>, SessionError> {
    Ok(Json(orchestrator::fleet_snapshot(&state).await?.robots))
}

async fn create_robot(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewRobot>,
) -> Result<(StatusCode, Json<Robot>), SessionError> {
    let robot = orchestrator::add_robot(&state, body).await?;
    Ok((StatusCode::CREATED, Json(robot)))
}

async fn get_robot(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RobotView>, SessionError> {
    let robot = orchestrator::get_robot(&state, &id).await?;
    Ok(Json(robot_view(robot, &state.presence.current())))
}

async fn delete_robot(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, SessionError> {
    orchestrator::delete_robot(&state, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_calibration(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<CalibrationResponse>, SessionError> {
    let robot = orchestrator::get_robot(&state, &id).await?;
    Ok(Json(CalibrationResponse {
        robot_id: robot.id,
        calibration: robot.calibration,
    }))
}

async fn delete_calibration(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Robot>, SessionError> {
    Ok(Json(orchestrator::delete_calibration(&state, &id).await?))
}

async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Vec<SessionSnapshot>> {
    let mut sessions: Vec<SessionSnapshot> = state
        .registry
        .handles()
        .iter()
        .map(|handle| (*handle.snapshot()).clone())
        .collect();
    sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Json(sessions)
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionSnapshot>, SessionError> {
    Ok(Json(orchestrator::get_session(&state, &id)?))
}
