//! Robot inventory and calibration store
//!
//! The orchestrators only see the `RobotStore` trait. Each call is atomic on
//! its own; nothing spans calls, so callers re-fetch after any await.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use armdock_protocol::{
    device_type_for, new_id, Calibration, JointCalibration, NewRobot, Robot, SUPPORTED_MODELS,
};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Robot not found: {0}")]
    NotFound(String),

    #[error("A robot named {0:?} already exists")]
    DuplicateName(String),

    #[error("{0}")]
    Invalid(String),

    #[error("Store I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Store file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::NotFound(_) => "robot_not_found",
            StoreError::DuplicateName(_) => "duplicate_name",
            StoreError::Invalid(_) => "invalid_robot",
            StoreError::Io(_) | StoreError::Corrupt(_) | StoreError::Unavailable(_) => {
                "store_error"
            }
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::DuplicateName(_) => StatusCode::CONFLICT,
            StoreError::Invalid(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Persisted robots and their calibrations.
///
/// Blocking; async callers go through `spawn_blocking`.
pub trait RobotStore: Send + Sync {
    fn list_robots(&self) -> Result<Vec<Robot>, StoreError>;
    fn get_robot(&self, id: &str) -> Result<Robot, StoreError>;
    fn add_robot(&self, robot: NewRobot) -> Result<Robot, StoreError>;
    fn delete_robot(&self, id: &str) -> Result<(), StoreError>;
    fn save_calibration(
        &self,
        id: &str,
        joints: Vec<JointCalibration>,
    ) -> Result<Robot, StoreError>;
    fn delete_calibration(&self, id: &str) -> Result<Robot, StoreError>;
    /// Record that these robots were observed online.
    fn mark_seen(&self, ids: &[String], at: DateTime<Utc>) -> Result<(), StoreError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    robots: Vec<Robot>,
}

/// `robots.json` backed store. The file is rewritten whole on every mutation.
pub struct JsonRobotStore {
    path: PathBuf,
    robots: Mutex<Vec<Robot>>,
}

impl JsonRobotStore {
    /// Open (or start empty at) `path`. An unreadable file is kept aside, not lost.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let robots = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<StoreFile>(&raw) {
                Ok(file) => file.robots,
                Err(e) => {
                    let backup = path.with_extension("json.corrupt");
                    warn!(
                        component = "store",
                        event = "store.load.corrupt",
                        path = %path.display(),
                        backup = %backup.display(),
                        error = %e,
                        "Robot store unreadable, starting empty"
                    );
                    std::fs::rename(&path, &backup)?;
                    Vec::new()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        info!(
            component = "store",
            event = "store.opened",
            path = %path.display(),
            robots = robots.len(),
            "Robot store opened"
        );

        Ok(Self {
            path,
            robots: Mutex::new(robots),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<Robot>>, StoreError> {
        self.robots
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".into()))
    }

    fn persist(&self, robots: &[Robot]) -> Result<(), StoreError> {
        write_atomically(&self.path, robots)
    }

    fn update<F>(&self, id: &str, mutate: F) -> Result<Robot, StoreError>
    where
        F: FnOnce(&mut Robot),
    {
        let mut robots = self.lock()?;
        let idx = robots
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let mut updated = robots[idx].clone();
        mutate(&mut updated);
        let previous = std::mem::replace(&mut robots[idx], updated.clone());
        if let Err(e) = self.persist(&robots) {
            robots[idx] = previous;
            return Err(e);
        }
        Ok(updated)
    }
}

fn write_atomically(path: &Path, robots: &[Robot]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let body = serde_json::to_vec_pretty(&StoreFile {
        robots: robots.to_vec(),
    })?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn validate(robot: &NewRobot) -> Result<(), StoreError> {
    if robot.name.trim().is_empty() {
        return Err(StoreError::Invalid("Robot name must not be empty".into()));
    }
    if robot.com_port.trim().is_empty() {
        return Err(StoreError::Invalid("Device port must not be empty".into()));
    }
    if !SUPPORTED_MODELS.iter().any(|(name, _)| *name == robot.model) {
        return Err(StoreError::Invalid(format!(
            "Unsupported model: {}",
            robot.model
        )));
    }
    if device_type_for(&robot.model, robot.role).is_none() {
        return Err(StoreError::Invalid(format!(
            "Unsupported role: {}",
            robot.role.as_str()
        )));
    }
    Ok(())
}

impl RobotStore for JsonRobotStore {
    fn list_robots(&self) -> Result<Vec<Robot>, StoreError> {
        Ok(self.lock()?.clone())
    }

    fn get_robot(&self, id: &str) -> Result<Robot, StoreError> {
        self.lock()?
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn add_robot(&self, robot: NewRobot) -> Result<Robot, StoreError> {
        validate(&robot)?;
        let mut robots = self.lock()?;
        let name = robot.name.trim().to_string();
        if robots
            .iter()
            .any(|r| r.name.to_lowercase() == name.to_lowercase())
        {
            return Err(StoreError::DuplicateName(name));
        }

        let record = Robot {
            id: new_id(),
            name,
            model: robot.model,
            role: robot.role,
            com_port: robot.com_port.trim().to_string(),
            has_calibration: false,
            calibration: None,
            last_seen: None,
        };
        robots.push(record.clone());
        if let Err(e) = self.persist(&robots) {
            robots.pop();
            return Err(e);
        }
        info!(
            component = "store",
            event = "store.robot.added",
            robot_id = %record.id,
            name = %record.name,
            "Robot added"
        );
        Ok(record)
    }

    fn delete_robot(&self, id: &str) -> Result<(), StoreError> {
        let mut robots = self.lock()?;
        let idx = robots
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let removed = robots.remove(idx);
        if let Err(e) = self.persist(&robots) {
            robots.insert(idx, removed);
            return Err(e);
        }
        Ok(())
    }

    fn save_calibration(
        &self,
        id: &str,
        joints: Vec<JointCalibration>,
    ) -> Result<Robot, StoreError> {
        self.update(id, |robot| {
            robot.calibration = Some(Calibration {
                joints,
                updated_at: Utc::now(),
            });
            robot.has_calibration = true;
        })
    }

    fn delete_calibration(&self, id: &str) -> Result<Robot, StoreError> {
        self.update(id, |robot| {
            robot.calibration = None;
            robot.has_calibration = false;
        })
    }

    fn mark_seen(&self, ids: &[String], at: DateTime<Utc>) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut robots = self.lock()?;
        let mut touched = false;
        for robot in robots.iter_mut().filter(|r| ids.contains(&r.id)) {
            robot.last_seen = Some(at);
            touched = true;
        }
        if touched {
            self.persist(&robots)?;
        }
        Ok(())
    }
}

/// Run a blocking store call off the async runtime.
pub async fn run_blocking<T, F>(store: Arc<dyn RobotStore>, f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&dyn RobotStore) -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|e| StoreError::Unavailable(format!("store task failed: {e}")))?
}
