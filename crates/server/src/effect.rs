//! Side effects requested by the orchestrator state machines
//!
//! The external tool is driven by synthetic keypresses on stdin. Those bytes
//! are produced in exactly one place, `StdinCommand::bytes`.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StdinCommand {
    /// Plain ENTER: advance to the sweep, stop recording, or keep an existing file
    Confirm,
    /// `c` + ENTER: discard the existing calibration file and recalibrate
    OverrideConfirm,
    /// Operator-typed text, newline-terminated
    Raw(String),
}

impl StdinCommand {
    pub fn bytes(&self) -> Vec<u8> {
        match self {
            StdinCommand::Confirm => b"\n".to_vec(),
            StdinCommand::OverrideConfirm => b"c\n".to_vec(),
            StdinCommand::Raw(text) => {
                let mut bytes = text.trim_end_matches(['\r', '\n']).as_bytes().to_vec();
                bytes.push(b'\n');
                bytes
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Write(StdinCommand),
    /// Interrupt the process, escalating to kill after the grace window
    Terminate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypress_bytes() {
        assert_eq!(StdinCommand::Confirm.bytes(), b"\n");
        assert_eq!(StdinCommand::OverrideConfirm.bytes(), b"c\n");
        assert_eq!(StdinCommand::Raw("y".into()).bytes(), b"y\n");
        assert_eq!(StdinCommand::Raw("y\r\n".into()).bytes(), b"y\n");
    }
}
