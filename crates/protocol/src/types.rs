//! Core types shared across the protocol

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Robot models the panel knows how to drive, with the device type passed to
/// the external tool for each role.
pub const SUPPORTED_MODELS: &[(&str, &[(RobotRole, &str)])] = &[(
    "so101",
    &[
        (RobotRole::Leader, "so101_leader"),
        (RobotRole::Follower, "so101_follower"),
    ],
)];

/// Which side of a teleoperation pair a robot plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobotRole {
    Leader,
    Follower,
}

impl RobotRole {
    pub fn as_str(self) -> &'static str {
        match self {
            RobotRole::Leader => "leader",
            RobotRole::Follower => "follower",
        }
    }
}

/// Presence-derived robot status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobotStatus {
    Online,
    Offline,
}

/// Captured range of a single joint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointCalibration {
    pub name: String,
    pub min: f64,
    pub max: f64,
    pub current: f64,
}

/// Saved calibration for a robot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub joints: Vec<JointCalibration>,
    pub updated_at: DateTime<Utc>,
}

/// A stored robot record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Robot {
    pub id: String,
    pub name: String,
    pub model: String,
    pub role: RobotRole,
    /// Serial device the robot is attached to (e.g. `/dev/ttyACM0`, `COM13`)
    pub com_port: String,
    #[serde(default)]
    pub has_calibration: bool,
    #[serde(default)]
    pub calibration: Option<Calibration>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

impl Robot {
    /// Device type flag value understood by the external tool.
    pub fn device_type(&self) -> String {
        device_type_for(&self.model, self.role)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}_{}", self.model, self.role.as_str()))
    }
}

/// Look up the device type for a supported model/role pair.
pub fn device_type_for(model: &str, role: RobotRole) -> Option<&'static str> {
    SUPPORTED_MODELS
        .iter()
        .find(|(name, _)| *name == model)
        .and_then(|(_, roles)| roles.iter().find(|(r, _)| *r == role))
        .map(|(_, device_type)| *device_type)
}

/// Payload for registering a robot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRobot {
    pub name: String,
    pub model: String,
    pub role: RobotRole,
    pub com_port: String,
}

/// A robot joined with the latest presence snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotView {
    #[serde(flatten)]
    pub robot: Robot,
    pub status: RobotStatus,
}

/// Everything fleet observers need: robots with status plus the raw port list
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetSnapshot {
    pub robots: Vec<RobotView>,
    pub ports: BTreeMap<String, String>,
}

/// Kind of supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Calibration,
    Teleop,
}

/// Robot(s) a session acts on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionSubject {
    Robot {
        robot_id: String,
    },
    Pair {
        leader_id: String,
        follower_id: String,
    },
}

impl SessionSubject {
    /// Whether this subject references the given robot.
    pub fn involves(&self, robot_id: &str) -> bool {
        match self {
            SessionSubject::Robot { robot_id: id } => id == robot_id,
            SessionSubject::Pair {
                leader_id,
                follower_id,
            } => leader_id == robot_id || follower_id == robot_id,
        }
    }
}

/// Live min/current/max triple for one joint during a sweep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointRange {
    pub name: String,
    pub min: f64,
    pub pos: f64,
    pub max: f64,
}

impl JointRange {
    pub fn span(&self) -> f64 {
        self.max - self.min
    }
}

impl From<&JointRange> for JointCalibration {
    fn from(range: &JointRange) -> Self {
        JointCalibration {
            name: range.name.clone(),
            min: range.min,
            max: range.max,
            current: range.pos,
        }
    }
}

/// Calibration orchestrator phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationPhase {
    Created,
    AwaitingOutput,
    AwaitingOverrideDecision,
    Sweeping,
    Captured,
    Saved,
    Failed,
    Cancelled,
}

impl CalibrationPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CalibrationPhase::Captured
                | CalibrationPhase::Saved
                | CalibrationPhase::Failed
                | CalibrationPhase::Cancelled
        )
    }
}

/// Teleop orchestrator phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeleopPhase {
    Idle,
    Starting,
    Running,
    Stopped,
}

/// Calibration-specific part of a session snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationDetail {
    pub phase: CalibrationPhase,
    pub ranges: Vec<JointRange>,
    pub override_prompt_pending: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub override_prompt: Option<String>,
    pub started: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stuck_joints: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// Teleop-specific part of a session snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeleopDetail {
    pub phase: TeleopPhase,
    pub leader_id: String,
    pub follower_id: String,
    pub disconnected_roles: Vec<RobotRole>,
    /// A disconnect was reported that could not be attributed to either arm
    pub ambiguous_disconnect: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionDetail {
    Calibration(CalibrationDetail),
    Teleop(TeleopDetail),
}

/// Full session state pushed to session observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub subject: SessionSubject,
    pub logs: Vec<String>,
    pub running: bool,
    pub return_code: Option<i32>,
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Last time output arrived or the derived state changed
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub detail: SessionDetail,
}

impl SessionSnapshot {
    pub fn kind(&self) -> SessionKind {
        match self.detail {
            SessionDetail::Calibration(_) => SessionKind::Calibration,
            SessionDetail::Teleop(_) => SessionKind::Teleop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn robot(model: &str, role: RobotRole) -> Robot {
        Robot {
            id: "r1".to_string(),
            name: "arm".to_string(),
            model: model.to_string(),
            role,
            com_port: "/dev/ttyACM0".to_string(),
            has_calibration: false,
            calibration: None,
            last_seen: None,
        }
    }

    #[test]
    fn device_type_uses_supported_model_table() {
        assert_eq!(robot("so101", RobotRole::Leader).device_type(), "so101_leader");
        assert_eq!(
            robot("so101", RobotRole::Follower).device_type(),
            "so101_follower"
        );
    }

    #[test]
    fn device_type_falls_back_for_unknown_model() {
        assert_eq!(robot("koch", RobotRole::Leader).device_type(), "koch_leader");
    }

    #[test]
    fn subject_involves_both_members_of_a_pair() {
        let subject = SessionSubject::Pair {
            leader_id: "a".to_string(),
            follower_id: "b".to_string(),
        };
        assert!(subject.involves("a"));
        assert!(subject.involves("b"));
        assert!(!subject.involves("c"));
    }

    #[test]
    fn snapshot_detail_is_flattened_with_kind_tag() {
        let snapshot = SessionSnapshot {
            id: "s1".to_string(),
            subject: SessionSubject::Robot {
                robot_id: "r1".to_string(),
            },
            logs: vec!["hello".to_string()],
            running: true,
            return_code: None,
            dry_run: false,
            command: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            detail: SessionDetail::Calibration(CalibrationDetail {
                phase: CalibrationPhase::Sweeping,
                ranges: vec![],
                override_prompt_pending: false,
                override_prompt: None,
                started: true,
                stuck_joints: vec![],
                failure: None,
            }),
        };

        let value = serde_json::to_value(&snapshot).expect("serialize");
        assert_eq!(value["kind"], "calibration");
        assert_eq!(value["phase"], "sweeping");
        assert_eq!(value["subject"]["type"], "robot");

        let reparsed: SessionSnapshot = serde_json::from_value(value).expect("deserialize");
        assert_eq!(reparsed.kind(), SessionKind::Calibration);
    }
}
