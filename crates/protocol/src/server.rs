//! Server → Client messages

use serde::{Deserialize, Serialize};

use crate::types::*;

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    // Full state sync
    FleetStatus {
        fleet: FleetSnapshot,
    },
    SessionSnapshot {
        session: SessionSnapshot,
    },

    // Lifecycle
    SessionStarted {
        session: SessionSnapshot,
    },
    SessionClosed {
        session_id: String,
        reason: String,
    },

    /// Request accepted; state changes arrive as snapshots
    Ack {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        message: String,
    },

    // Errors
    Error {
        code: String,
        message: String,
        session_id: Option<String>,
    },
}
