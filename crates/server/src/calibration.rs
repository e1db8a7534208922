//! Calibration state machine
//!
//! `transition(run, input) -> (run, effects)` is pure: no IO, no async.
//! The session actor feeds it process output (as extracted signals) and
//! operator requests, then carries out the returned effects.

use std::collections::BTreeSet;

use armdock_connectors::ExtractedSignals;
use armdock_protocol::{CalibrationDetail, CalibrationPhase, JointCalibration, JointRange};

use crate::effect::{Effect, StdinCommand};
use crate::error::SessionError;

/// Answer to the "existing calibration file" prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideChoice {
    /// Overwrite the file and run a fresh calibration
    Recalibrate,
    /// Keep the file on disk; the tool exits without recording ranges
    KeepExisting,
}

#[derive(Debug, Clone)]
pub enum Input {
    Spawned { dry_run: bool },
    Output(ExtractedSignals),
    Exited { code: i32, signals: ExtractedSignals },
    Override(OverrideChoice),
    BeginSweep,
    FinishSweep,
    RawInput(String),
    Cancel,
    Saved,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationRun {
    pub phase: CalibrationPhase,
    /// First-seen order; entries are updated, never removed
    pub ranges: Vec<JointRange>,
    pub override_prompt: Option<String>,
    pub override_handled: bool,
    pub kept_existing: bool,
    pub started: bool,
    pub stuck_joints: Vec<String>,
    pub failure: Option<String>,
    near_zero_span: f64,
}

impl CalibrationRun {
    pub fn new(near_zero_span: f64) -> Self {
        Self {
            phase: CalibrationPhase::Created,
            ranges: Vec::new(),
            override_prompt: None,
            override_handled: false,
            kept_existing: false,
            started: false,
            stuck_joints: Vec::new(),
            failure: None,
            near_zero_span,
        }
    }

    pub fn override_prompt_pending(&self) -> bool {
        self.phase == CalibrationPhase::AwaitingOverrideDecision
    }

    /// Joints safe to persist: only once the process exited cleanly with data.
    pub fn captured_joints(&self) -> Result<Vec<JointCalibration>, SessionError> {
        if self.phase != CalibrationPhase::Captured {
            return Err(self.invalid("save calibration"));
        }
        Ok(self.ranges.iter().map(JointCalibration::from).collect())
    }

    pub fn detail(&self) -> CalibrationDetail {
        CalibrationDetail {
            phase: self.phase,
            ranges: self.ranges.clone(),
            override_prompt_pending: self.override_prompt_pending(),
            override_prompt: self.override_prompt.clone(),
            started: self.started,
            stuck_joints: self.stuck_joints.clone(),
            failure: self.failure.clone(),
        }
    }

    fn invalid(&self, action: &'static str) -> SessionError {
        SessionError::InvalidPhase {
            action,
            phase: phase_name(self.phase).to_string(),
        }
    }

    fn merge_ranges(&mut self, rows: &[JointRange]) {
        for row in rows {
            match self.ranges.iter_mut().find(|r| r.name == row.name) {
                Some(existing) => *existing = row.clone(),
                None => self.ranges.push(row.clone()),
            }
        }
    }

    fn absorb(&mut self, signals: &ExtractedSignals) {
        self.merge_ranges(&signals.range_rows);
        if !signals.stuck_joint_names.is_empty() {
            self.stuck_joints = signals.stuck_joint_names.clone();
        }
    }

    /// Log-reported stuck joints plus any joint whose span never opened up.
    fn stuck_union(&self, reported: &[String]) -> Vec<String> {
        let mut names: BTreeSet<String> = reported.iter().cloned().collect();
        names.extend(
            self.ranges
                .iter()
                .filter(|r| r.span().abs() < self.near_zero_span)
                .map(|r| r.name.clone()),
        );
        names.into_iter().collect()
    }
}

pub fn phase_name(phase: CalibrationPhase) -> &'static str {
    match phase {
        CalibrationPhase::Created => "created",
        CalibrationPhase::AwaitingOutput => "awaiting_output",
        CalibrationPhase::AwaitingOverrideDecision => "awaiting_override_decision",
        CalibrationPhase::Sweeping => "sweeping",
        CalibrationPhase::Captured => "captured",
        CalibrationPhase::Saved => "saved",
        CalibrationPhase::Failed => "failed",
        CalibrationPhase::Cancelled => "cancelled",
    }
}

pub fn transition(
    run: &CalibrationRun,
    input: Input,
) -> Result<(CalibrationRun, Vec<Effect>), SessionError> {
    use CalibrationPhase as P;

    let mut next = run.clone();
    let mut effects = Vec::new();

    match input {
        Input::Spawned { dry_run } => {
            if run.phase != P::Created {
                return Err(run.invalid("start"));
            }
            // A dry run has no process to wait on; it completes immediately.
            next.phase = if dry_run { P::Captured } else { P::AwaitingOutput };
        }

        Input::Output(signals) => {
            if run.phase.is_terminal() {
                return Ok((next, effects));
            }
            next.absorb(&signals);
            if run.phase == P::AwaitingOutput && !run.override_handled {
                if let Some(line) = signals.override_prompt_line {
                    next.override_prompt = Some(line);
                    next.phase = P::AwaitingOverrideDecision;
                }
            }
        }

        Input::Exited { code, signals } => {
            if run.phase.is_terminal() {
                return Ok((next, effects));
            }
            next.absorb(&signals);
            let reported = next.stuck_joints.clone();
            next.stuck_joints = next.stuck_union(&reported);
            next.phase = if code != 0 {
                next.failure = Some(format!("Calibration exited with code {code}"));
                P::Failed
            } else if next.ranges.is_empty() {
                next.failure = Some(if run.kept_existing {
                    "Existing calibration file kept; no ranges were recorded".to_string()
                } else {
                    "Calibration exited without recording any joint ranges".to_string()
                });
                P::Failed
            } else {
                P::Captured
            };
        }

        Input::Override(choice) => {
            if run.phase != P::AwaitingOverrideDecision {
                return Err(run.invalid("answer the override prompt"));
            }
            next.override_handled = true;
            next.phase = P::AwaitingOutput;
            match choice {
                OverrideChoice::Recalibrate => {
                    effects.push(Effect::Write(StdinCommand::OverrideConfirm));
                }
                OverrideChoice::KeepExisting => {
                    next.kept_existing = true;
                    effects.push(Effect::Write(StdinCommand::Confirm));
                }
            }
        }

        Input::BeginSweep => {
            if run.phase != P::AwaitingOutput {
                return Err(run.invalid("begin the sweep"));
            }
            next.phase = P::Sweeping;
            next.started = true;
            effects.push(Effect::Write(StdinCommand::Confirm));
        }

        Input::FinishSweep => {
            if run.phase != P::Sweeping {
                return Err(run.invalid("finish the sweep"));
            }
            effects.push(Effect::Write(StdinCommand::Confirm));
        }

        Input::RawInput(text) => {
            if run.phase.is_terminal() || run.phase == P::Created {
                return Err(run.invalid("send input"));
            }
            effects.push(Effect::Write(StdinCommand::Raw(text)));
        }

        Input::Cancel => {
            if run.phase == P::Saved {
                return Err(run.invalid("cancel"));
            }
            // Unblock a process waiting on the override prompt before stopping it.
            if run.phase == P::AwaitingOverrideDecision {
                next.kept_existing = true;
                effects.push(Effect::Write(StdinCommand::Confirm));
            }
            next.phase = P::Cancelled;
            effects.push(Effect::Terminate);
        }

        Input::Saved => {
            if run.phase != P::Captured {
                return Err(run.invalid("mark saved"));
            }
            next.phase = P::Saved;
        }
    }

    Ok((next, effects))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(name: &str, min: f64, pos: f64, max: f64) -> JointRange {
        JointRange {
            name: name.to_string(),
            min,
            pos,
            max,
        }
    }

    fn spawned() -> CalibrationRun {
        let (run, effects) = transition(
            &CalibrationRun::new(1.0),
            Input::Spawned { dry_run: false },
        )
        .expect("spawn");
        assert!(effects.is_empty());
        run
    }

    fn step(run: &CalibrationRun, input: Input) -> (CalibrationRun, Vec<Effect>) {
        transition(run, input).expect("transition")
    }

    fn output_with_rows(rows: Vec<JointRange>) -> Input {
        Input::Output(ExtractedSignals {
            range_rows: rows,
            ..Default::default()
        })
    }

    #[test]
    fn spawn_enters_awaiting_output() {
        assert_eq!(spawned().phase, CalibrationPhase::AwaitingOutput);
    }

    #[test]
    fn override_then_sweep_then_clean_exit_is_captured() {
        let run = spawned();

        let (run, _) = step(
            &run,
            Input::Output(ExtractedSignals {
                override_prompt_line: Some("Press ENTER to use provided calibration file".into()),
                ..Default::default()
            }),
        );
        assert_eq!(run.phase, CalibrationPhase::AwaitingOverrideDecision);
        assert!(run.detail().override_prompt_pending);

        let (run, effects) = step(&run, Input::Override(OverrideChoice::Recalibrate));
        assert_eq!(run.phase, CalibrationPhase::AwaitingOutput);
        assert_eq!(effects, vec![Effect::Write(StdinCommand::OverrideConfirm)]);

        // The prompt is still in the buffer; it must not be detected again.
        let (run, _) = step(
            &run,
            Input::Output(ExtractedSignals {
                override_prompt_line: Some("Press ENTER to use provided calibration file".into()),
                ..Default::default()
            }),
        );
        assert_eq!(run.phase, CalibrationPhase::AwaitingOutput);

        let (run, effects) = step(&run, Input::BeginSweep);
        assert_eq!(run.phase, CalibrationPhase::Sweeping);
        assert!(run.started);
        assert_eq!(effects, vec![Effect::Write(StdinCommand::Confirm)]);

        let rows = vec![
            row("base", 100.0, 2000.0, 3900.0),
            row("elbow", 800.0, 1500.0, 3000.0),
            row("wrist", 50.0, 60.0, 4000.0),
        ];
        let (run, _) = step(&run, output_with_rows(rows.clone()));
        let (run, _) = step(
            &run,
            Input::Exited {
                code: 0,
                signals: ExtractedSignals {
                    range_rows: rows,
                    ..Default::default()
                },
            },
        );
        assert_eq!(run.phase, CalibrationPhase::Captured);
        let names: Vec<_> = run.ranges.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["base", "elbow", "wrist"]);
        assert!(run.failure.is_none());
        assert_eq!(run.captured_joints().expect("joints").len(), 3);
    }

    #[test]
    fn ranges_after_override_are_captured_without_explicit_sweep() {
        let run = spawned();
        let (run, _) = step(
            &run,
            Input::Output(ExtractedSignals {
                override_prompt_line: Some("press enter to use provided calibration file".into()),
                ..Default::default()
            }),
        );
        let (run, _) = step(&run, Input::Override(OverrideChoice::Recalibrate));
        let (run, _) = step(&run, output_with_rows(vec![row("base", 10.0, 20.0, 30.0)]));
        let (run, _) = step(
            &run,
            Input::Exited {
                code: 0,
                signals: ExtractedSignals::default(),
            },
        );
        assert_eq!(run.phase, CalibrationPhase::Captured);
        assert_eq!(run.ranges.len(), 1);
    }

    #[test]
    fn clean_exit_without_ranges_fails() {
        let run = spawned();
        let (run, _) = step(
            &run,
            Input::Exited {
                code: 0,
                signals: ExtractedSignals::default(),
            },
        );
        assert_eq!(run.phase, CalibrationPhase::Failed);
        assert!(run.failure.is_some());
        assert!(run.captured_joints().is_err());
    }

    #[test]
    fn nonzero_exit_reports_stuck_joints_from_log_and_spans() {
        let run = spawned();
        let (run, _) = step(&run, Input::BeginSweep);
        let (run, _) = step(
            &run,
            output_with_rows(vec![
                row("base", 100.0, 2000.0, 3900.0),
                row("gripper", 2047.0, 2047.0, 2047.5),
            ]),
        );
        let (run, _) = step(
            &run,
            Input::Exited {
                code: 1,
                signals: ExtractedSignals {
                    stuck_joint_names: vec!["wrist_roll".into()],
                    ..Default::default()
                },
            },
        );
        assert_eq!(run.phase, CalibrationPhase::Failed);
        assert_eq!(run.stuck_joints, vec!["gripper", "wrist_roll"]);
        assert_eq!(run.ranges.len(), 2);
    }

    #[test]
    fn ranges_survive_log_eviction() {
        let run = spawned();
        let (run, _) = step(&run, output_with_rows(vec![row("base", 1.0, 2.0, 3.0)]));
        // A later buffer no longer contains the base row.
        let (run, _) = step(&run, output_with_rows(vec![row("elbow", 4.0, 5.0, 6.0)]));
        let names: Vec<_> = run.ranges.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["base", "elbow"]);
    }

    #[test]
    fn cancel_while_override_pending_answers_keep_existing_first() {
        let run = spawned();
        let (run, _) = step(
            &run,
            Input::Output(ExtractedSignals {
                override_prompt_line: Some("type 'c' and press ENTER to run calibration".into()),
                ..Default::default()
            }),
        );
        let (run, effects) = step(&run, Input::Cancel);
        assert_eq!(run.phase, CalibrationPhase::Cancelled);
        assert_eq!(
            effects,
            vec![Effect::Write(StdinCommand::Confirm), Effect::Terminate]
        );
    }

    #[test]
    fn exit_after_cancel_keeps_cancelled() {
        let run = spawned();
        let (run, _) = step(&run, Input::Cancel);
        let (run, _) = step(
            &run,
            Input::Exited {
                code: -2,
                signals: ExtractedSignals::default(),
            },
        );
        assert_eq!(run.phase, CalibrationPhase::Cancelled);
    }

    #[test]
    fn sweep_requires_answered_prompt() {
        let run = spawned();
        let (run, _) = step(
            &run,
            Input::Output(ExtractedSignals {
                override_prompt_line: Some("press enter to use provided calibration file".into()),
                ..Default::default()
            }),
        );
        assert!(matches!(
            transition(&run, Input::BeginSweep),
            Err(SessionError::InvalidPhase { .. })
        ));
        assert!(matches!(
            transition(&spawned(), Input::Override(OverrideChoice::KeepExisting)),
            Err(SessionError::InvalidPhase { .. })
        ));
    }

    #[test]
    fn dry_run_is_captured_and_saveable() {
        let (run, _) = step(&CalibrationRun::new(1.0), Input::Spawned { dry_run: true });
        assert_eq!(run.phase, CalibrationPhase::Captured);
        assert!(run.captured_joints().expect("joints").is_empty());
        let (run, _) = step(&run, Input::Saved);
        assert_eq!(run.phase, CalibrationPhase::Saved);
        assert!(transition(&run, Input::Cancel).is_err());
    }

    #[test]
    fn raw_input_is_forwarded_verbatim() {
        let run = spawned();
        let (_, effects) = step(&run, Input::RawInput("y".into()));
        assert_eq!(effects, vec![Effect::Write(StdinCommand::Raw("y".into()))]);
    }
}
