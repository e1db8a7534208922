//! Client → Server messages

use serde::{Deserialize, Serialize};

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    // Subscriptions
    SubscribeFleet,
    UnsubscribeFleet,
    SubscribeSession {
        session_id: String,
    },
    UnsubscribeSession {
        session_id: String,
    },

    // Calibration
    StartCalibration {
        robot_id: String,
    },
    /// Answer the "existing calibration file" prompt.
    /// `overwrite = true` runs a fresh calibration, false keeps the file.
    OverrideDecision {
        session_id: String,
        overwrite: bool,
    },
    BeginSweep {
        session_id: String,
    },
    FinishSweep {
        session_id: String,
    },
    SendInput {
        session_id: String,
        data: String,
    },
    SaveCalibration {
        session_id: String,
    },

    // Teleop
    StartTeleop {
        leader_id: String,
        follower_id: String,
    },
    StopTeleop {
        session_id: String,
    },
    ClearDisconnects {
        session_id: String,
    },

    // Any session
    GetSession {
        session_id: String,
    },
    CancelSession {
        session_id: String,
    },
}
