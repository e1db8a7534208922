//! Commands sent to a session actor from websocket, HTTP and presence callers.

use std::sync::Arc;
use std::time::Instant;

use armdock_protocol::JointCalibration;
use tokio::sync::oneshot;

use crate::calibration::OverrideChoice;
use crate::error::SessionError;
use crate::fleet::PresenceSnapshot;

/// Operator actions that only make sense for a calibration session
#[derive(Debug, Clone)]
pub enum CalibrationAction {
    Override(OverrideChoice),
    BeginSweep,
    FinishSweep,
    RawInput(String),
}

/// Operator actions that only make sense for a teleop session
#[derive(Debug, Clone)]
pub enum TeleopAction {
    Stop,
    ClearDisconnects,
}

pub type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

/// A command that can be sent to a session actor.
pub enum SessionCommand {
    // -- Operator actions --
    Calibration {
        action: CalibrationAction,
        reply: Reply<()>,
    },
    Teleop {
        action: TeleopAction,
        reply: Reply<()>,
    },

    // -- Save flow --
    /// Captured joints, only available once the run reached Captured
    TakeCapture {
        reply: Reply<Vec<JointCalibration>>,
    },
    /// The capture was persisted
    MarkSaved {
        reply: Reply<()>,
    },

    // -- Lifecycle --
    /// Latest device presence, fire-and-forget
    Presence {
        presence: Arc<PresenceSnapshot>,
        at: Instant,
    },
    /// Stop the process and end the actor. Replies once the process is gone.
    Cancel {
        reply: oneshot::Sender<()>,
    },
}
